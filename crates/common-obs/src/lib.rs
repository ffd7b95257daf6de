use std::{fmt, io, sync::Arc};

use axum::{routing::get, Json, Router};
use serde_json::json;
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::{
    fmt::{self as tsfmt, format::Writer, FmtContext, FormatEvent, FormatFields, MakeWriter},
    layer::{Context, Layer, SubscriberExt},
    registry::LookupSpan,
    EnvFilter, Registry,
};

mod metrics;

pub use metrics::{
    admission_denied_total, encode_prometheus as encode_prometheus_metrics, http_requests_total,
    login_total, register_counter, tokens_issued_total, tokens_revoked_total, CounterVec,
    PROMETHEUS_CONTENT_TYPE,
};

/// Span field that the JSON formatter lifts to a top-level `request_id` key.
pub const REQUEST_ID_FIELD: &str = "request_id";

#[derive(Debug, thiserror::Error)]
pub enum ObsInitError {
    #[error("tracing subscriber already initialized")]
    AlreadyInitialized,
    #[error("failed to install tracing subscriber: {0}")]
    Install(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Initialize observability for a service.
pub struct ObsInit;

impl ObsInit {
    /// Install a global tracing subscriber writing one JSON object per line to stderr.
    pub fn init(service: &str) -> Result<(), ObsInitError> {
        let subscriber = Self::subscriber_with_writer(service, io::stderr);
        tracing::subscriber::set_global_default(subscriber).map_err(|err| {
            if tracing::dispatcher::has_been_set() {
                ObsInitError::AlreadyInitialized
            } else {
                ObsInitError::Install(err)
            }
        })
    }

    /// Build a tracing subscriber using the provided writer.
    pub fn subscriber_with_writer<W>(service: &str, writer: W) -> impl tracing::Subscriber
    where
        W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
    {
        metrics::init();
        let env_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| {
            if cfg!(debug_assertions) {
                "debug".to_string()
            } else {
                "info".to_string()
            }
        });
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(env_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let fmt_layer = tsfmt::layer()
            .with_ansi(false)
            .event_format(JsonLineFormat {
                service: Arc::from(service),
            })
            .with_writer(writer);

        Registry::default()
            .with(env_filter)
            .with(RequestIdLayer)
            .with(fmt_layer)
    }
}

/// Build a simple health and info router for services.
pub fn health_router(service: &'static str) -> Router {
    let health_handler =
        get(move || async move { Json(json!({ "status": "ok", "service": service })) });

    let info_handler = {
        let version = env!("CARGO_PKG_VERSION");
        get(move || async move { Json(json!({ "service": service, "version": version })) })
    };

    Router::new()
        .route("/health", health_handler.clone())
        .route("/v1/health", health_handler)
        .route("/info", info_handler.clone())
        .route("/v1/info", info_handler)
}

#[derive(Debug, Clone)]
struct RequestId(String);

/// Remembers the `request_id` a span was opened with so events logged inside
/// it can carry the id.
struct RequestIdLayer;

impl<S> Layer<S> for RequestIdLayer
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = RequestIdVisitor(None);
        attrs.record(&mut visitor);
        if let (Some(request_id), Some(span)) = (visitor.0, ctx.span(id)) {
            span.extensions_mut().insert(RequestId(request_id));
        }
    }
}

struct RequestIdVisitor(Option<String>);

impl Visit for RequestIdVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == REQUEST_ID_FIELD {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == REQUEST_ID_FIELD {
            self.0 = Some(format!("{:?}", value).trim_matches('"').to_string());
        }
    }
}

struct JsonLineFormat {
    service: Arc<str>,
}

impl<S, N> FormatEvent<S, N> for JsonLineFormat
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let request_id = ctx.lookup_current().and_then(|span| {
            span.scope()
                .find_map(|scope| scope.extensions().get::<RequestId>().map(|id| id.0.clone()))
        });

        let line = json!({
            "level": metadata.level().as_str().to_ascii_lowercase(),
            "target": metadata.target(),
            "service": &*self.service,
            "request_id": request_id,
            "fields": serde_json::Value::Object(fields.0),
        });
        writeln!(writer, "{line}")
    }
}

#[derive(Default)]
struct FieldCollector(serde_json::Map<String, serde_json::Value>);

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0
            .insert(field.name().to_string(), json!(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), json!(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), json!(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), json!(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), json!(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().to_string(), json!(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Mutex, Once};
    use tracing::subscriber::with_default;

    static INIT: Once = Once::new();

    fn init_global() {
        INIT.call_once(|| {
            ObsInit::init("test-service").expect("init failed");
        });
    }

    #[test]
    fn init_is_idempotent() {
        init_global();
        assert!(matches!(
            ObsInit::init("test"),
            Err(ObsInitError::AlreadyInitialized)
        ));
    }

    #[test]
    fn json_logs_include_service_and_request() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = ObsInit::subscriber_with_writer("svc", TestMakeWriter(buffer.clone()));

        with_default(subscriber, || {
            let span = tracing::info_span!("http.request", request_id = "req-123");
            let _guard = span.enter();
            tracing::info!(username = "alice", "hello world");
        });

        let output = {
            let guard = buffer.lock().unwrap();
            String::from_utf8(guard.clone()).expect("valid utf8")
        };
        let line: serde_json::Value =
            serde_json::from_str(output.lines().next().expect("one line")).expect("json");

        assert_eq!(line["service"], "svc");
        assert_eq!(line["request_id"], "req-123");
        assert_eq!(line["level"], "info");
        assert_eq!(line["fields"]["message"], "hello world");
        assert_eq!(line["fields"]["username"], "alice");
    }

    #[derive(Clone)]
    struct TestMakeWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for TestMakeWriter {
        type Writer = TestWriter;

        fn make_writer(&'a self) -> Self::Writer {
            TestWriter(self.0.clone())
        }
    }

    struct TestWriter(Arc<Mutex<Vec<u8>>>);

    impl io::Write for TestWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
