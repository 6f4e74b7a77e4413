pub mod bulk;
pub mod channel;
pub mod error;
pub mod grpc;
#[cfg(any(test, feature = "test-util"))]
pub mod loopback;
pub mod session;
pub mod transfer;

pub use bulk::DEFAULT_BULK_PORT;
pub use channel::{Direction, FrameData, Link, ScriptOutput, DEFAULT_CALL_TIMEOUT};
pub use error::{ChannelError, ErrorKind, SessionError};
pub use grpc::{GrpcLink, DEFAULT_CONTROL_PORT};
#[cfg(any(test, feature = "test-util"))]
pub use loopback::LoopbackDevice;
pub use session::{
    BindMode, BufferArray, DeviceBinding, ModelContract, ModelHandle, RemoteBuffer,
    RemoteSession, RunReport, SessionState, PROTOCOL_VERSION, REMOTE_STAGING_DIR,
};
pub use transfer::TransferMode;
