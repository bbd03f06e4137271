use std::fmt;
use thiserror::Error;

/// Stage of a proxied HTTP request that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPhase {
    /// The reverse sub-channel could not be opened.
    OpenFailed,
    /// The request could not be written onto the sub-channel.
    WriteFailed,
    /// The backend reply was not a parseable HTTP response.
    ResponseParseFailed,
}

impl fmt::Display for BackendPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendPhase::OpenFailed => f.write_str("open failed"),
            BackendPhase::WriteFailed => f.write_str("write failed"),
            BackendPhase::ResponseParseFailed => f.write_str("response parse failed"),
        }
    }
}

/// Errors produced by the apparea tunnel layer.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("unpack error: truncated input (needed {needed} bytes, {available} available)")]
    TruncatedInput { needed: usize, available: usize },

    #[error("forward request parse error: {0} bytes of trailing data")]
    TrailingData(usize),

    #[error("unpack error: string is not valid UTF-8")]
    InvalidString,

    #[error("could not listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("site name already in use: {0}")]
    HostnameInUse(String),

    #[error("forward request invalid port: {0}")]
    InvalidPort(u32),

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("could not open channel (is the port open?): {0}")]
    ChannelOpen(String),

    #[error("relay error: {0}")]
    Relay(String),

    #[error("backend {phase}: {message}")]
    Backend {
        phase: BackendPhase,
        message: String,
    },

    #[error("tls error: {0}")]
    Tls(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl TunnelError {
    pub fn backend<T: fmt::Display>(phase: BackendPhase, msg: T) -> Self {
        TunnelError::Backend {
            phase,
            message: msg.to_string(),
        }
    }

    /// Whether this error comes from a malformed wire payload.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            TunnelError::TruncatedInput { .. }
                | TunnelError::TrailingData(_)
                | TunnelError::InvalidString
        )
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
