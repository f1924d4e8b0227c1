//! HTTP server: accept loop, per-connection workers, graceful shutdown.
//!
//! One independently scheduled task per accepted connection. Workers share
//! nothing mutable: the handler and the CORS layer are immutable after
//! startup, so concurrent requests need no coordination. Killing one
//! connection (a strict-mode PROXY rejection, a peer reset) never touches
//! its siblings or the accept loop.
//!
//! On SIGTERM or Ctrl-C the server stops accepting immediately, lets every
//! in-flight connection task run to completion, and then returns from
//! [`Server::serve`] so `main` can exit cleanly.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tracing::{error, info};

use crate::config::Config;
use crate::cors::Cors;
use crate::error::Result;
use crate::handler::FileServer;
use crate::listener::Listener;
use crate::proxy::{ProxyMode, ProxyStream, RemoteAddr};

/// The HTTP server: a bound listener plus the layers every connection
/// passes through.
pub struct Server {
    listener: Listener,
    handler: Arc<FileServer>,
    cors: Cors,
    proxy_mode: ProxyMode,
    access_log: bool,
}

impl Server {
    /// Binds the configured transport and assembles the connection layers.
    ///
    /// The fatal failure classes (unusable configuration, unbindable
    /// socket) surface here, before a single connection is accepted.
    pub async fn bind(config: &Config) -> Result<Self> {
        let listener = Listener::bind(&config.transport).await?;
        Ok(Self {
            listener,
            handler: Arc::new(FileServer::new(config)),
            cors: Cors::permissive(),
            proxy_mode: ProxyMode::from_flags(config.proxy_protocol, config.proxy_strict),
            access_log: config.access_log,
        })
    }

    /// The address actually bound, for network transports. Lets a caller
    /// that bound port 0 discover the ephemeral port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts and serves connections until a shutdown signal arrives,
    /// then drains in-flight connections before returning.
    pub async fn serve(self) -> Result<()> {
        // JoinSet tracks every spawned connection task so we can wait for
        // them all to finish during graceful shutdown.
        let mut tasks = tokio::task::JoinSet::new();

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // `biased` makes select! check arms top-to-bottom instead of
                // randomly, so a shutdown signal stops the accept loop even
                // if more connections are queued.
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = self.listener.accept() => {
                    let (conn, peer) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    // Layered adapters around the raw byte stream: PROXY
                    // decode first, then the hyper IO bridge. The RemoteAddr
                    // handle is shared with the dispatcher so the address a
                    // later decode reveals is the one that gets logged.
                    let remote = RemoteAddr::new(peer);
                    let stream = ProxyStream::new(conn, remote.clone(), self.proxy_mode);
                    let io = TokioIo::new(stream);

                    let handler = Arc::clone(&self.handler);
                    let cors = self.cors.clone();
                    let access_log = self.access_log;

                    tasks.spawn(async move {
                        let svc_remote = remote.clone();
                        // The closure runs once per request on the
                        // connection, not once per connection.
                        let svc = service_fn(move |req| {
                            let handler = Arc::clone(&handler);
                            let cors = cors.clone();
                            let remote = svc_remote.clone();
                            async move { dispatch(handler, cors, remote, access_log, req).await }
                        });

                        // `auto::Builder` handles both HTTP/1.1 and HTTP/2,
                        // whatever the client negotiates.
                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            // Strict-mode PROXY rejections land here too, as
                            // InvalidData read errors. Scoped to this task;
                            // sibling connections never notice.
                            error!(peer = %remote, "connection error: {e}");
                        }
                    });
                }

                // Reap finished connection tasks so the JoinSet does not
                // grow without bound on long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        // Drain: wait for every in-flight connection before returning.
        while tasks.join_next().await.is_some() {}

        info!("tsuka stopped");
        Ok(())
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Core hot path: one request in, one response out.
///
/// The error type is [`Infallible`]: every failure has already become an
/// HTTP status inside the handler, so hyper never sees an error. CORS wraps
/// the handler on both sides, answering preflights before it runs and
/// decorating its response before the response is flushed.
async fn dispatch(
    handler: Arc<FileServer>,
    cors: Cors,
    remote: RemoteAddr,
    access_log: bool,
    req: http::Request<hyper::body::Incoming>,
) -> std::result::Result<http::Response<Full<Bytes>>, Infallible> {
    let response = match cors.preflight(&req) {
        Some(preflight) => preflight,
        None => {
            let mut response = handler.serve(&req).await;
            cors.decorate(&req, &mut response);
            response
        }
    };

    if access_log {
        info!(
            target: "tsuka::access",
            client = %remote.client(),
            method = %req.method(),
            path = req.uri().path(),
            status = response.status().as_u16(),
            bytes = declared_length(&response),
            "request"
        );
    }

    Ok(response)
}

/// The byte count a response declares, for the access log. Preflights and
/// other body-less responses count as zero.
fn declared_length(response: &http::Response<Full<Bytes>>) -> u64 {
    response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both SIGTERM (init systems, container runtimes)
/// and SIGINT (Ctrl-C, for local use). On other platforms only Ctrl-C is
/// available.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    // `pending()` never resolves, so on non-Unix platforms the SIGTERM arm
    // is effectively disabled.
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
