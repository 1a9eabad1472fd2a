use std::net::SocketAddr;
use std::time::Duration;

/// Error type for ingress failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A watched pod lacks a field required to identify it.
    #[error("pod has no {0}")]
    InvalidPod(&'static str),

    /// A lifecycle handler refused an event.
    #[error("lifecycle handler rejected {identity}: {reason}")]
    Rejected {
        /// Identity carried by the rejected event.
        identity: String,
        /// Why the handler refused it.
        reason: String,
    },

    /// The HTTP listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address the listener was bound to.
        addr: SocketAddr,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// A resolved endpoint has no pod address yet.
    #[error("endpoint {0} has no address")]
    NoAddress(String),

    /// The destination URI built from an endpoint is invalid.
    #[error("invalid upstream uri: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    /// The outbound request could not be built.
    #[error("invalid upstream request: {0}")]
    InvalidRequest(#[from] http::Error),

    /// The upstream did not answer within the configured bound.
    #[error("upstream {addr} did not respond within {timeout:?}")]
    UpstreamTimeout {
        /// Address of the endpoint.
        addr: SocketAddr,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The upstream connection or exchange failed.
    #[error("upstream {addr} unavailable: {source}")]
    Upstream {
        /// Address of the endpoint.
        addr: SocketAddr,
        /// Underlying client error.
        #[source]
        source: hyper_util::client::legacy::Error,
    },

    /// The upstream failed while sending its response body.
    #[error("upstream {addr} body failed: {source}")]
    UpstreamBody {
        /// Address of the endpoint.
        addr: SocketAddr,
        /// Underlying body error.
        #[source]
        source: hyper::Error,
    },
}

/// Result type for ingress operations.
pub type Result<T> = std::result::Result<T, Error>;
