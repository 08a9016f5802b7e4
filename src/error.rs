/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum PushMqError {
    /// Network or request execution error from `reqwest`.
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    /// Network failure reported by a custom [`HttpTransport`](crate::HttpTransport).
    #[error("network error: {0}")]
    Network(String),
    /// Request exceeded its configured timeout.
    #[error("request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    /// Non-success HTTP status code with raw response body.
    #[error("http error {status}: {body}")]
    Http { status: u16, body: String },
    /// The message handler returned an error or panicked.
    #[error("message handler failed: {0}")]
    Handler(String),
    /// The client was closed before the operation could complete.
    #[error("client is closed")]
    Closed,
    /// A configured retry cap was reached.
    #[error("gave up after {attempts} attempts")]
    RetriesExhausted { attempts: usize },
    /// Invalid client configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PushMqError {
    /// Returns `true` for failures of the HTTP exchange itself, as opposed to
    /// handler, lifecycle, or configuration errors.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Network(_) | Self::Timeout { .. } | Self::Http { .. }
        )
    }

    /// HTTP status code, when the error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }
}
