use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::router::Router;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("{connections} connection(s) still open after {timeout:?}")]
    DeadlineExceeded { connections: usize, timeout: Duration },
}

/// HTTP/1.1 and HTTP/2 listener in front of the [`Router`]
pub struct GatewayServer {
    listener: TcpListener,
    router: Arc<Router>,
    shutdown_timeout: Duration,
}

impl GatewayServer {
    pub async fn bind(
        addr: SocketAddr,
        router: Arc<Router>,
        shutdown_timeout: Duration,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind { addr, source })?;

        Ok(Self {
            listener,
            router,
            shutdown_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `cancel` fires, then drain open connections
    ///
    /// Live connections are asked to finish their in-flight requests; any still
    /// open after the shutdown timeout are aborted and reported.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ShutdownError> {
        if let Ok(addr) = self.local_addr() {
            info!(addr = %addr, "API server listening (HTTP/1.1 and HTTP/2)");
        }

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            let cancel = cancel.clone();
                            connections.spawn(handle_connection(stream, addr, router, cancel));
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = cancel.cancelled() => {
                    info!(open_connections = connections.len(), "API server shutting down");
                    break;
                }
            }
        }

        drop(self.listener);

        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            let remaining = connections.len();
            connections.abort_all();
            warn!(
                connections = remaining,
                timeout_secs = self.shutdown_timeout.as_secs(),
                "Shutdown deadline exceeded, aborting open connections"
            );
            return Err(ShutdownError::DeadlineExceeded {
                connections: remaining,
                timeout: self.shutdown_timeout,
            });
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    router: Arc<Router>,
    cancel: CancellationToken,
) {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { router.handle(req).await }
    });

    let builder = AutoBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        debug!(addr = %addr, error = %e, "Connection error");
    }
}
