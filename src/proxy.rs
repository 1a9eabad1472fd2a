//! Forwarding of requests to resolved endpoints.

use std::time::Duration;

use bytes::Bytes;
use http::header::{
    CONNECTION, HOST, HeaderName, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE,
};
use http::{HeaderMap, Request, Response, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::error::Elapsed;
use tokio::time::{Instant, timeout_at};

use crate::directory::Endpoint;
use crate::error::{Error, Result};

/// Response body type shared by the dispatcher and the server.
pub type Body = BoxBody<Bytes, hyper::Error>;

/// Builds a complete body from a chunk.
pub fn full<T: Into<Bytes>>(chunk: T) -> Body {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Headers that describe a single connection and are never forwarded.
static HOP_BY_HOP: [HeaderName; 8] = [
    CONNECTION,
    HeaderName::from_static("keep-alive"),
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

/// Forwards requests to pod endpoints over plain HTTP/1.
///
/// Every exchange is bounded by one deadline covering the connection, the
/// upstream response head and the whole response body.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    client: Client<HttpConnector, Incoming>,
    timeout: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher whose upstream calls are bounded by `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));

        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client, timeout }
    }

    /// Sends `req` to `endpoint` at `path_and_query` and returns the upstream
    /// response.
    ///
    /// The method, headers (except `host` and hop-by-hop headers) and body of
    /// `req` are forwarded. The upstream body is read in full before the
    /// response is returned.
    ///
    /// # Errors
    ///
    /// Fails when the endpoint has no address, the upstream cannot be reached
    /// or does not deliver its complete response in time.
    pub async fn forward(
        &self,
        endpoint: Endpoint,
        req: Request<Incoming>,
        path_and_query: &str,
    ) -> Result<Response<Body>> {
        let addr = endpoint
            .socket_addr()
            .ok_or_else(|| Error::NoAddress(endpoint.logical_name.clone()))?;
        let uri: Uri = format!("http://{addr}{path_and_query}").parse()?;

        let (parts, body) = req.into_parts();
        let mut upstream = Request::builder()
            .method(parts.method)
            .uri(uri)
            .body(body)?;
        *upstream.headers_mut() = parts.headers;
        upstream.headers_mut().remove(HOST);
        strip_hop_by_hop(upstream.headers_mut());

        tracing::debug!(
            endpoint = %endpoint.logical_name,
            %addr,
            method = %upstream.method(),
            uri = %upstream.uri(),
            "forwarding request"
        );

        let deadline = Instant::now() + self.timeout;
        let timed_out = |_: Elapsed| Error::UpstreamTimeout {
            addr,
            timeout: self.timeout,
        };

        let rsp = timeout_at(deadline, self.client.request(upstream))
            .await
            .map_err(timed_out)?
            .map_err(|source| Error::Upstream { addr, source })?;

        let (mut parts, body) = rsp.into_parts();
        let body = timeout_at(deadline, body.collect())
            .await
            .map_err(timed_out)?
            .map_err(|source| Error::UpstreamBody { addr, source })?
            .to_bytes();
        strip_hop_by_hop(&mut parts.headers);

        Ok(Response::from_parts(parts, full(body)))
    }
}

/// Removes hop-by-hop headers, including any named by `connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}
