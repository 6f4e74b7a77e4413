use crate::channel::Direction;
use crate::session::{BindMode, SessionState};
use thiserror::Error;

/// Failure reported by a control or bulk channel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("Connection closed: {0}")]
    Closed(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Device rejected request (status {status}): {message}")]
    Remote { status: i32, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal, never retried.
    Configuration,
    /// Rejected locally without a remote round trip.
    Precondition,
    /// The session is over.
    Transport,
    /// The device refused; local state is intact and the caller cleans up.
    Remote,
    /// A host-side transform kernel failed inside the graph executor.
    Kernel,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Protocol version check failed: client {local}, device {remote}")]
    VersionMismatch { local: f64, remote: f64 },
    #[error("DevKit {endpoint} is busy serving another session")]
    Busy { endpoint: String },
    #[error("Failed to connect to {endpoint}: {reason}")]
    ConnectFailed { endpoint: String, reason: String },
    #[error("Ping test failed, device answered {0:?}")]
    PingFailed(String),
    #[error("Session lost during {op}: {source}")]
    Disconnected {
        op: &'static str,
        #[source]
        source: ChannelError,
    },
    #[error("{op} is not allowed while the session is {state}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },
    #[error("Device is already bound in {0} mode")]
    AlreadyBound(BindMode),
    #[error("A model is already loaded in this session")]
    ModelAlreadyLoaded,
    #[error("Pipeline archive must be a .tar.gz file, got {0}")]
    InvalidArchive(String),
    #[error("Invalid model contract: {0}")]
    InvalidContract(String),
    #[error("Refusing to allocate a zero-length buffer")]
    ZeroLengthAllocation,
    #[error("Refusing to allocate an empty buffer array")]
    EmptyArray,
    #[error("Refusing to transfer an empty payload")]
    EmptyPayload,
    #[error("{len} bytes do not fit a buffer of {capacity} bytes")]
    LengthExceedsBuffer { len: u64, capacity: u64 },
    #[error("Handle {0} is not live in this session")]
    StaleHandle(u64),
    #[error("{op} expects an {expected} buffer")]
    WrongDirection {
        op: &'static str,
        expected: Direction,
    },
    #[error("Specified batch size {requested} does not match model batch size {expected}")]
    BatchSizeMismatch { requested: usize, expected: usize },
    #[error("Batch size {batch_size} needs as many buffers, got {ifms} inputs and {ofms} outputs")]
    BatchShapeMismatch {
        batch_size: usize,
        ifms: usize,
        ofms: usize,
    },
    #[error("{expected} payloads expected, got {got}")]
    PayloadCountMismatch { expected: usize, got: usize },
    #[error("{op} failed on the device (status {status}): {message}")]
    Remote {
        op: &'static str,
        status: i32,
        message: String,
    },
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::VersionMismatch { .. }
            | SessionError::InvalidArchive(_)
            | SessionError::InvalidContract(_) => ErrorKind::Configuration,
            SessionError::Busy { .. }
            | SessionError::ConnectFailed { .. }
            | SessionError::PingFailed(_)
            | SessionError::Disconnected { .. } => ErrorKind::Transport,
            SessionError::Remote { .. } => ErrorKind::Remote,
            _ => ErrorKind::Precondition,
        }
    }

    /// Whether the session can no longer be used after this error.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Configuration
        )
    }
}
