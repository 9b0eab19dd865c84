//! Error taxonomy shared by the gateway and registry crates.

use thiserror::Error;

/// Failures surfaced by the edge layer.
///
/// Every variant maps to a client-visible HTTP status; none of them is
/// allowed to take the process down.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No endpoints are known for the named service.
    #[error("no endpoints known for service '{0}'")]
    Resolution(String),

    /// Endpoints are known for the service, but none is currently healthy.
    #[error("no healthy endpoint for service '{0}'")]
    NoHealthyEndpoint(String),

    /// The per-route deadline elapsed before an upstream response arrived.
    #[error("upstream deadline exceeded after {0} ms")]
    UpstreamTimeout(u64),

    /// All forwarding attempts failed at the connection level.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// A reachable backend answered with a non-2xx/3xx status.
    ///
    /// The forwarder passes such responses through to the caller untouched;
    /// this variant exists for collaborators that need to classify them.
    #[error("upstream returned status {0}")]
    UpstreamError(u16),

    /// No route matches the inbound request.
    #[error("no route matches the request")]
    RouteNotFound,

    /// The external configuration provider is disabled or unreachable.
    #[error("configuration provider unavailable: {0}")]
    ConfigUnavailable(String),
}

impl GatewayError {
    /// Stable machine-readable kind, used in error response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Resolution(_) => "ResolutionError",
            GatewayError::NoHealthyEndpoint(_) => "NoHealthyEndpoint",
            GatewayError::UpstreamTimeout(_) => "UpstreamTimeout",
            GatewayError::UpstreamUnavailable(_) => "UpstreamUnavailable",
            GatewayError::UpstreamError(_) => "UpstreamError",
            GatewayError::RouteNotFound => "RouteNotFound",
            GatewayError::ConfigUnavailable(_) => "ConfigUnavailable",
        }
    }

    /// HTTP status the gateway answers with for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Resolution(_)
            | GatewayError::NoHealthyEndpoint(_)
            | GatewayError::UpstreamUnavailable(_)
            | GatewayError::ConfigUnavailable(_) => 503,
            GatewayError::UpstreamTimeout(_) => 504,
            GatewayError::UpstreamError(status) => *status,
            GatewayError::RouteNotFound => 404,
        }
    }
}
