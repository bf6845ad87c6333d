use thiserror::Error;

/// Errors surfaced by the capture → encode → mux → transmit pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),
    /// Encoder, muxer or GPU construction failed while a session was preparing.
    #[error("Session setup failed: {0}")]
    Setup(String),
    /// The hardware encoder faulted mid-session. Never retried.
    #[error("Encoder fault: {0}")]
    Encoder(String),
    #[error("Muxer state error: {0}")]
    MuxerState(String),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("GPU error: {0}")]
    Gpu(String),
    #[error("Invalid destination address: {0}")]
    InvalidAddress(String),
    #[error("Encoder worker unavailable: {0}")]
    WorkerUnavailable(String),
    #[error("A session is already active")]
    AlreadyActive,
}

impl RelayError {
    /// Faults that end the session. Transport send failures are reported but
    /// leave the session running; retry policy belongs to the transport.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RelayError::Transport(_))
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
