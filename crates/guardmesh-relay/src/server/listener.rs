//! mTLS accept loop with graceful shutdown.
//!
//! Connections speak HTTP/1.1 only, so every request head is bounded by
//! [`HEADER_READ_TIMEOUT`].

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Deadline for a client to finish the TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for a client to send the request head.
pub const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Back-off after a failed `accept`, e.g. when out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Serve `router` on `listener` until `shutdown` flips, then drain open
/// connections for at most `grace` before dropping them.
pub async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
) {
    let graceful = GracefulShutdown::new();
    let mut builder = Builder::new(TokioExecutor::new()).http1_only();
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);

    let mut connections = JoinSet::new();
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Control API listening");
    }

    if !*shutdown.borrow_and_update() {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    let acceptor = acceptor.clone();
                    let service = TowerToHyperService::new(router.clone());
                    let builder = builder.clone();
                    let watcher = graceful.watcher();
                    connections.spawn(async move {
                        let Some(stream) = handshake(&acceptor, stream, remote).await else {
                            return;
                        };
                        let conn = builder.serve_connection(TokioIo::new(stream), service);
                        if let Err(e) = watcher.watch(conn).await {
                            debug!(%remote, error = %e, "Connection ended with error");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }
    }

    drop(listener);
    info!(open = connections.len(), "Control API draining connections");
    tokio::select! {
        () = graceful.shutdown() => info!("Control API connections closed"),
        () = tokio::time::sleep(grace) => {
            warn!(grace_secs = grace.as_secs(), "Grace period elapsed, closing remaining connections");
        }
    }
    connections.abort_all();
    while connections.join_next().await.is_some() {}
    info!("Control API stopped");
}

async fn handshake(
    acceptor: &TlsAcceptor,
    stream: tokio::net::TcpStream,
    remote: SocketAddr,
) -> Option<tokio_rustls::server::TlsStream<tokio::net::TcpStream>> {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
        Ok(Ok(stream)) => {
            let chain = stream.get_ref().1.peer_certificates().map_or(0, <[_]>::len);
            debug!(%remote, chain, "Client authenticated");
            Some(stream)
        }
        Ok(Err(e)) => {
            debug!(%remote, error = %e, "TLS handshake failed");
            None
        }
        Err(_) => {
            debug!(%remote, "TLS handshake timed out");
            None
        }
    }
}
