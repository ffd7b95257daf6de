use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, RwLock};

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

static REGISTRY: OnceCell<Registry> = OnceCell::new();
static SERIES_INIT: Once = Once::new();

/// Pre-register the series dashboards expect to see before any traffic.
pub fn init() {
    SERIES_INIT.call_once(|| {
        login_total().ensure(&["success"]);
        admission_denied_total().ensure(&[]);
        tokens_revoked_total().ensure(&[]);
    });
}

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::default)
}

#[derive(Default)]
struct Registry {
    counters: RwLock<Vec<Arc<CounterVecInner>>>,
}

impl Registry {
    fn register(&self, counter: Arc<CounterVecInner>) -> Arc<CounterVecInner> {
        let mut guard = self.counters.write().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = guard.iter().find(|existing| existing.name == counter.name) {
            return existing.clone();
        }
        guard.push(counter.clone());
        counter
    }

    fn encode(&self) -> String {
        let mut output = String::new();
        let guard = self.counters.read().unwrap_or_else(|p| p.into_inner());
        for counter in guard.iter() {
            let _ = writeln!(output, "# HELP {} {}", counter.name, counter.help);
            let _ = writeln!(output, "# TYPE {} counter", counter.name);

            let mut samples = counter.collect();
            samples.sort_by(|a, b| a.0.cmp(&b.0));
            for (labels, value) in samples {
                output.push_str(counter.name);
                write_labels(&mut output, counter.label_names, &labels);
                let _ = writeln!(output, " {}", value);
            }
        }
        output
    }
}

struct CounterVecInner {
    name: &'static str,
    help: &'static str,
    label_names: &'static [&'static str],
    values: Mutex<HashMap<Vec<String>, Arc<AtomicU64>>>,
}

impl CounterVecInner {
    fn value(&self, labels: &[&str]) -> Arc<AtomicU64> {
        let key: Vec<String> = labels.iter().map(|label| label.to_string()).collect();
        let mut values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        values.entry(key).or_default().clone()
    }

    fn collect(&self) -> Vec<(Vec<String>, u64)> {
        let values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        values
            .iter()
            .map(|(labels, value)| (labels.clone(), value.load(Ordering::Relaxed)))
            .collect()
    }
}

/// A labelled family of monotonically increasing counters.
#[derive(Clone)]
pub struct CounterVec {
    inner: Arc<CounterVecInner>,
}

impl CounterVec {
    pub fn inc(&self, labels: &[&str], amount: u64) {
        debug_assert_eq!(labels.len(), self.inner.label_names.len());
        self.inner
            .value(labels)
            .fetch_add(amount, Ordering::Relaxed);
    }

    /// Make a series visible at zero before its first increment.
    pub fn ensure(&self, labels: &[&str]) {
        self.inner.value(labels);
    }

    pub fn get(&self, labels: &[&str]) -> u64 {
        self.inner.value(labels).load(Ordering::Relaxed)
    }
}

pub fn register_counter(
    name: &'static str,
    help: &'static str,
    label_names: &'static [&'static str],
) -> CounterVec {
    let inner = registry().register(Arc::new(CounterVecInner {
        name,
        help,
        label_names,
        values: Mutex::new(HashMap::new()),
    }));
    CounterVec { inner }
}

pub fn encode_prometheus() -> String {
    registry().encode()
}

pub fn login_total() -> &'static CounterVec {
    static METRIC: OnceCell<CounterVec> = OnceCell::new();
    METRIC.get_or_init(|| {
        register_counter(
            "auth_login_total",
            "Login attempts by outcome",
            &["outcome"],
        )
    })
}

pub fn admission_denied_total() -> &'static CounterVec {
    static METRIC: OnceCell<CounterVec> = OnceCell::new();
    METRIC.get_or_init(|| {
        register_counter(
            "auth_admission_denied_total",
            "Requests rejected by the per-client rate limiter",
            &[],
        )
    })
}

pub fn tokens_issued_total() -> &'static CounterVec {
    static METRIC: OnceCell<CounterVec> = OnceCell::new();
    METRIC.get_or_init(|| {
        register_counter(
            "auth_tokens_issued_total",
            "Session tokens issued by kind",
            &["kind"],
        )
    })
}

pub fn tokens_revoked_total() -> &'static CounterVec {
    static METRIC: OnceCell<CounterVec> = OnceCell::new();
    METRIC.get_or_init(|| {
        register_counter(
            "auth_tokens_revoked_total",
            "Session tokens revoked before expiry",
            &[],
        )
    })
}

pub fn http_requests_total() -> &'static CounterVec {
    static METRIC: OnceCell<CounterVec> = OnceCell::new();
    METRIC.get_or_init(|| {
        register_counter(
            "http_requests_total",
            "HTTP requests by route and status code",
            &["route", "code"],
        )
    })
}

fn write_labels(output: &mut String, names: &[&str], values: &[String]) {
    if names.is_empty() {
        return;
    }
    output.push('{');
    for (idx, (name, value)) in names.iter().zip(values).enumerate() {
        if idx > 0 {
            output.push(',');
        }
        let _ = write!(output, "{}=\"{}\"", name, escape_label(value));
    }
    output.push('}');
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_encode_in_prometheus_text() {
        let counter = register_counter("test_events_total", "Test events", &["kind"]);
        counter.inc(&["a\"b"], 2);
        counter.ensure(&["zero"]);

        let encoded = encode_prometheus();
        assert!(encoded.contains("# TYPE test_events_total counter"));
        assert!(encoded.contains("test_events_total{kind=\"a\\\"b\"} 2"));
        assert!(encoded.contains("test_events_total{kind=\"zero\"} 0"));
    }

    #[test]
    fn registering_twice_shares_series() {
        let first = register_counter("test_shared_total", "Shared", &[]);
        let second = register_counter("test_shared_total", "Shared", &[]);
        first.inc(&[], 1);
        second.inc(&[], 1);
        assert_eq!(first.get(&[]), 2);
    }
}
