use clap::Parser;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use frame_relay::{router, AppState, Cli, ConfigError, Relay, RelayConfig};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "frame_relay=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::try_from(Cli::parse())?;
    tracing::info!(
        bind = %config.bind,
        queue_capacity = config.delivery.queue_capacity,
        write_timeout = ?config.delivery.write_timeout,
        producer_policy = ?config.producer_policy,
        producer_idle_timeout = ?config.producer_limits.idle_timeout,
        "frame-relay starting"
    );

    let relay = Relay::new(config.delivery, config.producer_policy);
    let state = AppState::new(relay, config.producer_limits);
    let app = router(state.clone(), config.static_dir.clone());

    let listener = match tokio::net::TcpListener::bind(config.bind).await {
        Ok(listener) => listener,
        Err(source) => {
            tracing::error!(addr = %config.bind, error = %source, "failed to bind listener");
            return Err(RelayError::Bind {
                addr: config.bind,
                source,
            });
        }
    };
    tracing::info!(addr = %config.bind, "listening");

    let shutdown = state.shutdown.clone();
    let signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("shutdown requested");
        shutdown.shutdown();
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
        .map_err(RelayError::Serve)?;

    if tokio::time::timeout(config.shutdown_grace, state.shutdown.wait_for_all_closed())
        .await
        .is_err()
    {
        tracing::warn!(
            remaining = state.shutdown.active_count(),
            "sessions still open after grace period"
        );
    }

    tracing::info!(stats = ?state.relay.stats(), "frame-relay stopped");
    Ok(())
}
