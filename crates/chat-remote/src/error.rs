use thiserror::Error;

/// Problems building a remote adapter from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteConfigError {
    #[error("invalid server url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported url scheme '{0}'; expected http, https, ws or wss")]
    UnsupportedScheme(String),
    #[error("failed to build http client: {0}")]
    HttpClient(String),
}

impl RemoteConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidUrl { .. } => "invalid_server_url",
            Self::UnsupportedScheme(_) => "unsupported_url_scheme",
            Self::HttpClient(_) => "http_client_build_error",
        }
    }
}

/// Live frame that could not be encoded or decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("malformed live frame: {0}")]
    Malformed(String),
    #[error("failed to encode live frame: {0}")]
    Encode(String),
}
