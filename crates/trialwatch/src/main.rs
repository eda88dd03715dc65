mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use std::future::Future;
use tracing_subscriber::EnvFilter;
use trialwatch_core::config::AppConfig;
use trialwatch_supervisor::{LaunchSpec, Supervisor, SupervisorError};

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "trialwatch=debug,info"
    } else {
        "trialwatch=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let code = match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            1
        }
    };
    drop(runtime);
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => AppConfig::load().context("Failed to load config")?,
    };
    cli.apply(&mut config);

    let spec = match LaunchSpec::from_config(&config) {
        Ok(spec) => spec,
        Err(e) => {
            tracing::error!("{}", e);
            return Ok(e.exit_code());
        }
    };
    // A signal during startup must stop the services already running.
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let handle = match Supervisor::launch(spec, shutdown.as_mut()).await {
        Ok(handle) => handle,
        Err(SupervisorError::Interrupted { status }) => {
            tracing::info!("Startup interrupted, all services stopped");
            return Ok(status);
        }
        Err(e) => {
            tracing::error!("Startup failed: {}", e);
            return Ok(e.exit_code());
        }
    };
    tracing::info!("Press Ctrl+C to stop");

    Ok(handle.wait(shutdown).await)
}

/// Resolves on SIGINT or SIGTERM. The handlers are installed when this is
/// called, not when the future is first polled.
fn shutdown_signal() -> impl Future<Output = ()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let handlers = signal(SignalKind::interrupt())
            .and_then(|interrupt| Ok((interrupt, signal(SignalKind::terminate())?)));
        async move {
            match handlers {
                Ok((mut interrupt, mut terminate)) => {
                    tokio::select! {
                        _ = interrupt.recv() => {}
                        _ = terminate.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("Signal handlers unavailable: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        async {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
