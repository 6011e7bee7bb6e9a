use std::net::SocketAddr;

use tokio::time::{self, Duration as TokioDuration};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use torwache::{config, routes, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging (stdout + tägliche Datei-Rotation unter ./logs)
    std::fs::create_dir_all("logs").ok();
    let (stdout_nb, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let file_appender = tracing_appender::rolling::daily("logs", "torwache.log");
    let (file_nb, file_guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(stdout_nb))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_nb))
        .init();
    // Guards am Leben halten, damit die Non-Blocking Writer korrekt flushen
    let _log_guards = (stdout_guard, file_guard);

    // Load configuration (embedded defaults -> torwache.toml -> TORWACHE_CONFIG -> env/.env)
    let app_cfg = config::load()?;
    if app_cfg.identity.secret.is_none() {
        tracing::warn!("identity.secret not set; using the development key for hashing");
    }

    let state = AppState::new(app_cfg.clone());

    // Periodic sweeps keep both stores from holding expired entries until eviction
    {
        let limiter = state.rate_limiter.clone();
        let metrics = state.metrics.clone();
        let every = app_cfg.rate_limit.sweep_interval_secs;
        tokio::spawn(async move {
            let mut ticker = time::interval(TokioDuration::from_secs(every));
            loop {
                ticker.tick().await;
                match limiter.sweep().await {
                    Ok(n) => metrics.add_swept(n),
                    Err(e) => tracing::warn!("rate limit sweep failed: {}", e),
                }
            }
        });
    }
    {
        let csrf = state.csrf.clone();
        let metrics = state.metrics.clone();
        let every = app_cfg.csrf.sweep_interval_secs;
        tokio::spawn(async move {
            let mut ticker = time::interval(TokioDuration::from_secs(every));
            loop {
                ticker.tick().await;
                match csrf.sweep().await {
                    Ok(n) => metrics.add_swept(n),
                    Err(e) => tracing::warn!("csrf sweep failed: {}", e),
                }
            }
        });
    }

    let app = routes::router(state).layer(TraceLayer::new_for_http());

    // Server listen addr (from config)
    let port: u16 = app_cfg.server.port;
    let host: String = app_cfg.server.host.clone();
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen addr {}:{} - {}", host, port, e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(environment = ?app_cfg.server.environment, "Torwache listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown signal received. Stopping server...");
}
