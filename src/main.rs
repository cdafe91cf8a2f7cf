use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use broker_cascade::broker::LoggingBrokerClient;
use broker_cascade::config::{CascadeConfig, STATE_FILE_VAR};
use broker_cascade::maintainer::Maintainer;
use broker_cascade::store::MemoryRepository;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "broker_cascade=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CascadeConfig::from_env();
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return ExitCode::FAILURE;
    }

    let repo = match std::env::var(STATE_FILE_VAR) {
        Ok(path) => match MemoryRepository::open(&path) {
            Ok(repo) => repo,
            Err(e) => {
                error!(error = %e, path = %path, "Failed to open state file");
                return ExitCode::FAILURE;
            }
        },
        Err(_) => {
            info!("{STATE_FILE_VAR} not set, state will not survive a restart");
            MemoryRepository::new()
        }
    };

    let maintainer = Maintainer::new(Arc::new(repo), Arc::new(LoggingBrokerClient), config);

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => on_signal.cancel(),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    maintainer.run(shutdown).await;
    ExitCode::SUCCESS
}
