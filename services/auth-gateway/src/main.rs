use std::net::SocketAddr;
use std::time::Duration;

use auth_gateway::config::AuthGatewayConfig;
use auth_gateway::{build_router, build_state, SERVICE_NAME};
use common_config::load;
use common_obs::ObsInit;
use tokio::net::TcpListener;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn build_sha() -> &'static str {
    option_env!("BUILD_SHA").unwrap_or("unknown")
}

fn build_time() -> &'static str {
    option_env!("BUILD_TIME").unwrap_or("unknown")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ObsInit::init(SERVICE_NAME).map_err(|err| -> Box<dyn std::error::Error> { Box::new(err) })?;

    let config = load::<AuthGatewayConfig>()?;
    let addr = config.socket_addr()?;
    tracing::info!(
        event = "service_start",
        service = SERVICE_NAME,
        version = VERSION,
        build_sha = build_sha(),
        build_time = build_time(),
        listen_addr = %addr,
        "starting service"
    );

    let state = build_state(&config).await?;
    let admission_sweeper = state.admission.spawn_sweeper();
    let revocation_sweeper = state
        .revocations
        .spawn_sweeper(Duration::from_secs(config.tokens.revocation_sweep_secs.max(1)));

    let router = build_router(state);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    admission_sweeper.abort();
    revocation_sweeper.abort();
    tracing::info!(event = "service_stop", service = SERVICE_NAME);

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!(event = "shutdown_requested", service = SERVICE_NAME);
}
