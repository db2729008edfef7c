//! Optional TLS termination with rustls.  Accepted streams are served by
//! hyper-util's auto builder so both HTTP/1.1 and HTTP/2 reach the router.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;

/// How long a peer gets to finish the TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept` so fd exhaustion does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Build an acceptor from a PEM certificate chain and private key.
pub fn load_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let mut cert_reader = BufReader::new(
        File::open(cert_path).with_context(|| format!("failed to open TLS certificate '{cert_path}'"))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse TLS certificate '{cert_path}'"))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in '{cert_path}'"));
    }

    let mut key_reader = BufReader::new(
        File::open(key_path).with_context(|| format!("failed to open TLS key '{key_path}'"))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("failed to parse TLS key '{key_path}'"))?
        .ok_or_else(|| anyhow!("no private key found in '{key_path}'"))?;

    let mut config =
        rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .context("failed to select TLS protocol versions")?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("failed to build TLS server config")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Accept TLS connections until `shutdown` flips.  Each connection runs on
/// its own task with the peer address attached as [`ConnectInfo`].
///
/// Accept errors are logged and retried; only `shutdown` ends the loop.
pub async fn serve(listener: TcpListener, acceptor: TlsAcceptor, app: Router, shutdown: watch::Receiver<bool>) {
    accept_loop(listener, acceptor, app, shutdown, HANDSHAKE_TIMEOUT).await
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
    handshake_timeout: Duration,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => break,
        };
        let (socket, remote_addr) = match accepted {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = %err, "failed to accept TLS connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let stream = match tokio::time::timeout(handshake_timeout, acceptor.accept(socket)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    tracing::debug!(peer = %remote_addr, error = %err, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    tracing::debug!(peer = %remote_addr, "TLS handshake timed out");
                    return;
                }
            };
            let service = hyper::service::service_fn(move |mut req: Request<Incoming>| {
                req.extensions_mut().insert(ConnectInfo::<SocketAddr>(remote_addr));
                app.clone().oneshot(req)
            });
            let builder = auto::Builder::new(TokioExecutor::new());
            if let Err(err) = builder.serve_connection(TokioIo::new(stream), service).await {
                tracing::debug!(peer = %remote_addr, error = %err, "TLS connection closed with error");
            }
        });
    }
    tracing::info!("TLS listener stopped accepting");
}
