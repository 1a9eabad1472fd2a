//! HTTP front end.
//!
//! * `/ingress` serves the JSON status document.
//! * Any other path is resolved and forwarded to the matching pod; when
//!   nothing matches, a plain text listing of known pods and rules is
//!   returned instead.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http::header::{CONTENT_TYPE, HOST};
use http::uri::Authority;
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::proxy::{Body, Dispatcher, full};
use crate::resolver::Resolver;
use crate::status::{Listing, StatusReport};

const STATUS_PATH: &str = "/ingress";

/// Serves ingress requests.
#[derive(Debug)]
pub struct Server {
    resolver: Arc<Resolver>,
    dispatcher: Dispatcher,
    miss_status: StatusCode,
}

impl Server {
    /// Creates a server that answers unresolved requests with `200 OK`.
    #[must_use]
    pub fn new(resolver: Arc<Resolver>, dispatcher: Dispatcher) -> Self {
        Self {
            resolver,
            dispatcher,
            miss_status: StatusCode::OK,
        }
    }

    /// Answers unresolved requests with `404 Not Found` instead of `200 OK`.
    #[must_use]
    pub fn strict_not_found(mut self, strict: bool) -> Self {
        self.miss_status = if strict {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::OK
        };
        self
    }

    /// Binds `addr` and serves until `drain` is signaled.
    ///
    /// # Errors
    ///
    /// Fails when the address cannot be bound.
    pub async fn bind_and_serve(self: Arc<Self>, addr: SocketAddr, drain: drain::Watch) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        self.serve(listener, drain).await;
        Ok(())
    }

    /// Accepts connections on `listener` until `drain` is signaled.
    ///
    /// Each connection holds a clone of `drain`; once signaled, connections
    /// finish their in-flight request and close.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, drain: drain::Watch) {
        match listener.local_addr() {
            Ok(addr) => tracing::info!(%addr, "serving ingress"),
            Err(error) => tracing::warn!(%error, "listener has no local address"),
        }

        let shutdown = drain.clone().signaled();
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(error) => {
                        tracing::warn!(%error, "failed to accept connection");
                        continue;
                    }
                },
                release = &mut shutdown => {
                    tracing::info!("no longer accepting connections");
                    drop(release);
                    return;
                }
            };

            let server = Arc::clone(&self);
            let drain = drain.clone();
            tokio::spawn(
                server
                    .serve_connection(stream, drain)
                    .instrument(tracing::debug_span!("conn", %peer)),
            );
        }
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, drain: drain::Watch) {
        let svc = service_fn(move |req| {
            let server = Arc::clone(&self);
            async move { Ok::<_, Infallible>(server.handle(req).await) }
        });

        let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), svc);
        tokio::pin!(conn);

        let signaled = drain.signaled();
        tokio::pin!(signaled);

        let release = tokio::select! {
            res = conn.as_mut() => {
                if let Err(error) = res {
                    tracing::debug!(%error, "connection failed");
                }
                return;
            }
            release = &mut signaled => release,
        };

        conn.as_mut().graceful_shutdown();
        if let Err(error) = conn.await {
            tracing::debug!(%error, "connection failed during shutdown");
        }
        drop(release);
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<Body> {
        if req.uri().path() == STATUS_PATH {
            return self.status();
        }

        let host = request_host(&req).unwrap_or_default();
        let resolution = self.resolver.resolve(&host, req.uri().path());

        let Some(endpoint) = resolution.endpoint else {
            let listing = Listing::collect(&self.resolver, resolution.key);
            return text(self.miss_status, listing.to_string());
        };

        let path_and_query = match req.uri().query() {
            Some(query) => format!("{}?{query}", resolution.rest),
            None => resolution.rest,
        };

        match self.dispatcher.forward(endpoint, req, &path_and_query).await {
            Ok(rsp) => rsp,
            Err(error) => {
                tracing::warn!(%error, "dispatch failed");
                let status = match error {
                    Error::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    _ => StatusCode::BAD_GATEWAY,
                };
                text(status, format!("{error}\n"))
            }
        }
    }

    fn status(&self) -> Response<Body> {
        match StatusReport::collect(&self.resolver).to_json() {
            Ok(json) => {
                let mut rsp = Response::new(full(json));
                rsp.headers_mut().insert(
                    CONTENT_TYPE,
                    http::HeaderValue::from_static("application/json"),
                );
                rsp
            }
            Err(error) => text(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
        }
    }
}

fn text(status: StatusCode, body: String) -> Response<Body> {
    let mut rsp = Response::new(full(body));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    rsp
}

/// Returns the request host without its port, from the URI authority or
/// else the `Host` header.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.to_string());
    }

    let header = req.headers().get(HOST)?.to_str().ok()?;
    let authority = header.parse::<Authority>().ok()?;
    Some(authority.host().to_string())
}
