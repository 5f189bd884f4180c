use hostmux::admin::{AdminServer, PKG_NAME, VERSION};
use hostmux::config::Config;
use hostmux::pool::PoolConfig;
use hostmux::proxy::ProxyServer;
use hostmux::reconcile::ConfigReconciler;
use hostmux::registry::ServiceRegistry;
use hostmux::reload;
use hostmux::supervisor::SupervisorSettings;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Pending reload commands before the admin API reports the queue as full
const RELOAD_QUEUE_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hostmux=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("hostmux.toml"));

    let config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    config.mapping.ensure_exists()?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = ServiceRegistry::new(SupervisorSettings::from(&config.launcher));
    let reconciler = ConfigReconciler::new(
        Arc::clone(&registry),
        &config.mapping,
        config.launcher.clone(),
    );

    // Initial pass, then one pass per mapping file change
    let watch_handle = if config.mapping.watch {
        let reconciler = Arc::clone(&reconciler);
        let debounce = config.mapping.watch_debounce();
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = reconciler.watch(debounce, shutdown).await {
                error!(error = %e, "Mapping watcher error");
            }
        }))
    } else {
        reconciler.run_pass().await;
        None
    };

    let (reload_tx, reload_rx) = reload::channel(RELOAD_QUEUE_CAPACITY);
    let reload_handle = tokio::spawn(reload::run_reload_consumer(
        Arc::clone(&registry),
        reload_rx,
        shutdown_rx.clone(),
    ));

    // Admin API on loopback only (if port > 0)
    let admin_handle = if config.server.admin_port > 0 {
        let admin_addr = SocketAddr::from(([127, 0, 0, 1], config.server.admin_port));

        // Generate or use configured admin token
        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });

        let admin_server = AdminServer::new(
            admin_addr,
            Arc::clone(&registry),
            reload_tx.clone(),
            shutdown_rx.clone(),
            admin_token,
        );

        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };
    drop(reload_tx);

    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid proxy bind address");
            anyhow::anyhow!("Invalid proxy bind address: {}", e)
        })?;

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    let proxy = ProxyServer::with_pool_config(
        proxy_addr,
        Arc::clone(&registry),
        shutdown_rx.clone(),
        pool_config,
    );
    let pool_stats = proxy.pool().stats();
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or a mapping re-read (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %reconciler.mapping_path().display(), "Received SIGHUP, reconciling mapping...");
                    reconciler.run_pass().await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for servers and background tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
        if let Some(handle) = watch_handle {
            let _ = handle.await;
        }
        let _ = reload_handle.await;
    })
    .await;

    info!(
        total_requests = pool_stats.get_total_requests(),
        failed_requests = pool_stats.get_failed_requests(),
        "Forwarding statistics"
    );

    // Stop all backends
    info!(count = registry.len(), "Stopping all backends...");
    registry.stop_all().await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(
        name = PKG_NAME,
        version = VERSION,
        "Starting multiplexer"
    );
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = if config.server.admin_port > 0 { Some(config.server.admin_port) } else { None },
        "Server configuration"
    );
    info!(
        path = %config.mapping.path.display(),
        watch = config.mapping.watch,
        debounce_ms = config.mapping.watch_debounce_ms,
        "Mapping settings"
    );
    info!(
        command = %config.launcher.command,
        args = ?config.launcher.args,
        port_env = %config.launcher.port_env,
        restart_delay_ms = config.launcher.restart_delay_ms,
        "Launcher settings"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
}
