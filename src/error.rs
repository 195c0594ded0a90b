use http::StatusCode;
use std::fmt;

/// The fixed set of user-visible proxy failures. Every failed request maps to
/// exactly one of these; the tag is emitted in the `X-Resin-Error` header and
/// must stay stable for log consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyError {
    AuthRequired,
    AuthFailed,
    UrlParseError,
    InvalidProtocol,
    InvalidHost,
    PlatformNotFound,
    AccountRejected,
    NoAvailableNodes,
    UpstreamConnectFailed,
    UpstreamTimeout,
    UpstreamRequestFailed,
    Internal,
}

impl ProxyError {
    pub fn http_code(&self) -> StatusCode {
        match self {
            ProxyError::AuthRequired => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            ProxyError::AuthFailed => StatusCode::FORBIDDEN,
            ProxyError::UrlParseError => StatusCode::BAD_REQUEST,
            ProxyError::InvalidProtocol => StatusCode::BAD_REQUEST,
            ProxyError::InvalidHost => StatusCode::BAD_REQUEST,
            ProxyError::PlatformNotFound => StatusCode::NOT_FOUND,
            ProxyError::AccountRejected => StatusCode::FORBIDDEN,
            ProxyError::NoAvailableNodes => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamConnectFailed => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamRequestFailed => StatusCode::BAD_GATEWAY,
            ProxyError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable tag for the `X-Resin-Error` header.
    pub fn tag(&self) -> &'static str {
        match self {
            ProxyError::AuthRequired => "AUTH_REQUIRED",
            ProxyError::AuthFailed => "AUTH_FAILED",
            ProxyError::UrlParseError => "URL_PARSE_ERROR",
            ProxyError::InvalidProtocol => "INVALID_PROTOCOL",
            ProxyError::InvalidHost => "INVALID_HOST",
            ProxyError::PlatformNotFound => "PLATFORM_NOT_FOUND",
            ProxyError::AccountRejected => "ACCOUNT_REJECTED",
            ProxyError::NoAvailableNodes => "NO_AVAILABLE_NODES",
            ProxyError::UpstreamConnectFailed => "UPSTREAM_CONNECT_FAILED",
            ProxyError::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ProxyError::UpstreamRequestFailed => "UPSTREAM_REQUEST_FAILED",
            ProxyError::Internal => "INTERNAL_ERROR",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ProxyError::AuthRequired => "Proxy authentication required",
            ProxyError::AuthFailed => "Proxy authentication failed",
            ProxyError::UrlParseError => "Failed to parse request URL",
            ProxyError::InvalidProtocol => "Protocol must be http or https",
            ProxyError::InvalidHost => "Invalid or empty host",
            ProxyError::PlatformNotFound => "Platform not found",
            ProxyError::AccountRejected => {
                "Account extraction failed and the platform rejects anonymous requests"
            }
            ProxyError::NoAvailableNodes => "No available nodes for routing",
            ProxyError::UpstreamConnectFailed => "Failed to connect to upstream",
            ProxyError::UpstreamTimeout => "Upstream connection or response timed out",
            ProxyError::UpstreamRequestFailed => "Upstream request failed",
            ProxyError::Internal => "Internal proxy error",
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.tag(), self.message())
    }
}

impl std::error::Error for ProxyError {}

/// Errors the router seam can report. Mapped to the response contract by
/// `map_route_error`.
#[derive(Debug)]
pub enum RouteError {
    PlatformNotFound,
    NoAvailableNodes,
    Internal(String),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::PlatformNotFound => write!(f, "platform not found"),
            RouteError::NoAvailableNodes => write!(f, "no available nodes"),
            RouteError::Internal(msg) => write!(f, "routing error: {}", msg),
        }
    }
}

impl std::error::Error for RouteError {}

pub fn map_route_error(err: &RouteError) -> ProxyError {
    match err {
        RouteError::PlatformNotFound => ProxyError::PlatformNotFound,
        RouteError::NoAvailableNodes => ProxyError::NoAvailableNodes,
        RouteError::Internal(_) => ProxyError::Internal,
    }
}

/// Walk an error's source chain looking for a timeout. hyper's legacy client
/// buries the dial error a few levels deep.
fn is_timeout(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if e.is::<tokio::time::error::Elapsed>() {
            return true;
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ) {
                return true;
            }
        }
        cur = e.source();
    }
    false
}

/// True for errors that mean "the peer went away" rather than a protocol or
/// routing failure. These are swallowed on tunnel copies.
pub fn is_benign_close(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
    )
}

/// Classify an upstream round-trip failure.
///
/// `client_cancelled` is the caller's observation that the downstream request
/// was torn down first; those are silent closes, never counted against the
/// node. Timeouts become `UpstreamTimeout`, everything else
/// `UpstreamRequestFailed`.
pub fn classify_upstream_error(
    err: &(dyn std::error::Error + 'static),
    client_cancelled: bool,
) -> Option<ProxyError> {
    if client_cancelled {
        return None;
    }
    if is_timeout(err) {
        return Some(ProxyError::UpstreamTimeout);
    }
    Some(ProxyError::UpstreamRequestFailed)
}

/// CONNECT-specific classification: all residual errors are dial-phase.
pub fn classify_connect_error(
    err: &(dyn std::error::Error + 'static),
    client_cancelled: bool,
) -> Option<ProxyError> {
    if client_cancelled {
        return None;
    }
    if is_timeout(err) {
        return Some(ProxyError::UpstreamTimeout);
    }
    Some(ProxyError::UpstreamConnectFailed)
}
