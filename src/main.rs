use std::net::SocketAddr;

use anyhow::Context;
use tarpit::{app, build_state, tls, AppConfig};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging. Reads RUST_LOG environment variable.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = AppConfig::from_env()?;
    let state = build_state(&config).await?;
    let shutdown_state = state.clone();
    let shutdown_rx = state.shutdown_signal();
    let router = app(state);

    let addr = SocketAddr::new(config.bind, config.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown_state.begin_shutdown();
    });

    match &config.tls {
        Some(paths) => {
            let acceptor = tls::load_acceptor(&paths.cert, &paths.key)?;
            tracing::info!("listening on https://{}", addr);
            tls::serve(listener, acceptor, router, shutdown_rx).await;
        }
        None => {
            tracing::info!("listening on http://{}", addr);
            let mut rx = shutdown_rx;
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = rx.wait_for(|stop| *stop).await;
            })
            .await?;
        }
    }
    Ok(())
}
