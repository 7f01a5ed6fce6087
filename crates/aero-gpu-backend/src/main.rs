use aero_gpu_backend::{serve, BackendConfig, NullExecutor};
use aero_gpu_notify::Listener;
use anyhow::Context;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BackendConfig::from_args()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let listener = Listener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen))?;
    tracing::info!(
        endpoint = %config.listen,
        features = ?config.features,
        "aero-gpu-backendd listening"
    );

    let resolver = resolver()?;
    serve(
        &listener,
        &config,
        &resolver,
        NullExecutor::default,
        shutdown_signal(),
    )
    .await?;

    tracing::info!("aero-gpu-backendd stopped");
    Ok(())
}

#[cfg(unix)]
fn resolver() -> anyhow::Result<aero_gpu_backend::PosixShmResolver> {
    Ok(aero_gpu_backend::PosixShmResolver)
}

#[cfg(not(unix))]
fn resolver() -> anyhow::Result<aero_gpu_backend::InProcessResolver> {
    anyhow::bail!("named shared memory is only supported on unix hosts")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }
    tracing::info!("shutdown signal received");
}
