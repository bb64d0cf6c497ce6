use std::fmt;

#[derive(Debug)]
#[allow(dead_code)]
pub enum ProxyError {
    ClientInvalid(String),
    UpstreamUnreachable(String),
    UpstreamConnect(String),
    UpstreamTimeout,
    RemoteDisconnected,
    LoopDetected(String),
    InterceptSetupFailed(String),
    CodecFailure(String),
    Internal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::ClientInvalid(msg) => write!(f, "invalid client request: {}", msg),
            ProxyError::UpstreamUnreachable(msg) => write!(f, "upstream unreachable: {}", msg),
            ProxyError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            ProxyError::UpstreamTimeout => write!(f, "upstream timeout"),
            ProxyError::RemoteDisconnected => write!(f, "remote disconnected"),
            ProxyError::LoopDetected(host) => write!(f, "reverse proxy loop detected: {}", host),
            ProxyError::InterceptSetupFailed(msg) => {
                write!(f, "tls interception setup failed: {}", msg)
            }
            ProxyError::CodecFailure(msg) => write!(f, "content codec failure: {}", msg),
            ProxyError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProxyError::UpstreamTimeout
        } else if e.is_connect() {
            ProxyError::UpstreamConnect(e.to_string())
        } else if e.is_body() || e.is_request() {
            ProxyError::RemoteDisconnected
        } else {
            ProxyError::UpstreamUnreachable(e.to_string())
        }
    }
}
