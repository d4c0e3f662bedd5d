use crate::config::GatewayConfig;
use crate::control::{server as control_server, ConfigEnvelope, ConfigSource};
use crate::server::{self, GatewayState};
use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments and the runtime sizing decision forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
    pub control_listen: String,
    pub workers: crate::server::runtime::WorkerPlan,
}

/// Gateway lifecycle: init → build state → start listeners → serve →
/// drain → stop background tasks.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = GatewayConfig::load(&args.config_path)?;
    let state = GatewayState::new(config).await?;

    // Worker sizing happened before tracing/metrics existed; report it now.
    args.workers.record();

    // Seed the control plane with the file config so connecting data planes
    // have something to sync against.
    seed_control_config(&state, &args.config_path);

    let shutdown = Arc::new(Notify::new());

    start_admin_server(&state, &args);
    start_control_listener(&state, &args, &shutdown);

    tracing::info!("server: starting gateway, listen={}", args.listen);
    let proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    state.shutdown().await;
    if let Err(e) = proxy_handle.await {
        tracing::error!("server: proxy task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

fn seed_control_config(state: &GatewayState, config_path: &std::path::Path) {
    let Ok(raw) = std::fs::read(config_path) else {
        tracing::info!("control: no config file to seed, starting with empty envelope");
        return;
    };
    let hash = crate::control::envelope_hash(&raw);
    let version = state.control.push_config(ConfigEnvelope {
        version: 0,
        hash,
        yaml: Bytes::from(raw),
        timestamp: chrono::Utc::now(),
        source: ConfigSource::File,
        config: None,
    });
    tracing::info!("control: seeded config from file, version={}", version);
}

fn start_admin_server(state: &GatewayState, args: &BootstrapArgs) {
    let state = state.clone();
    let admin_addr = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, state).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

fn start_control_listener(state: &GatewayState, args: &BootstrapArgs, shutdown: &Arc<Notify>) {
    let plane = state.control.clone();
    let listen = args.control_listen.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = control_server::run_control_listener(&listen, plane, shutdown).await {
            tracing::error!("control: listener failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
