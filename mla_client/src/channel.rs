use crate::error::ChannelError;
use std::{fmt, time::Duration};
use tonic::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// What a device handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Ifm,
    Ofm,
    Model,
}

impl From<Direction> for HandleKind {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Input => HandleKind::Ifm,
            Direction::Output => HandleKind::Ofm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VersionCheck {
    pub compatible: bool,
    pub remote_version: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunStatus {
    pub status: i32,
    pub elapsed_us: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchRun {
    pub model: u64,
    pub batch_size: usize,
    pub ifms: Vec<u64>,
    pub ifm_size: u64,
    pub ofms: Vec<u64>,
    pub ofm_size: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptRequest {
    pub command: Vec<String>,
    pub artifact: String,
    pub timeout: Duration,
    pub virtual_env: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScriptOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
    /// The command may still be running on the device.
    pub timed_out: bool,
}

/// Dense f32 tensor exchanged with the pipelined runtime.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameData {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Request/response control channel to the device runtime.
///
/// Every method is one round trip. Implementations map a refused request to
/// [`ChannelError::Remote`] and a lost connection to [`ChannelError::Closed`].
#[async_trait]
pub trait ControlChannel: Send {
    async fn ping(&mut self, message: &str) -> Result<String, ChannelError>;
    async fn check_version(&mut self, version: f64) -> Result<VersionCheck, ChannelError>;
    async fn dv_connect(&mut self, layer_stats_path: Option<&str>) -> Result<(), ChannelError>;
    async fn pm_connect(&mut self, archive: &str) -> Result<(), ChannelError>;
    async fn load_model(&mut self, path: &str) -> Result<u64, ChannelError>;
    async fn allocate(&mut self, kind: HandleKind, length: u64) -> Result<u64, ChannelError>;
    async fn upload(&mut self, handle: u64, data: &[u8]) -> Result<(), ChannelError>;
    async fn upload_announce(&mut self, handle: u64, length: u64) -> Result<(), ChannelError>;
    async fn download(&mut self, handle: u64, length: u64) -> Result<Vec<u8>, ChannelError>;
    async fn download_announce(&mut self, handle: u64, length: u64) -> Result<(), ChannelError>;
    async fn run(&mut self, model: u64, ifm: u64, ofm: u64) -> Result<RunStatus, ChannelError>;
    async fn run_batch(&mut self, batch: &BatchRun) -> Result<RunStatus, ChannelError>;
    async fn free(&mut self, kind: HandleKind, handle: u64) -> Result<(), ChannelError>;
    async fn create_virtual_env(&mut self, name: &str) -> Result<(), ChannelError>;
    async fn delete_virtual_env(&mut self, name: &str) -> Result<(), ChannelError>;
    async fn run_remote_script(
        &mut self,
        request: &ScriptRequest,
    ) -> Result<ScriptOutput, ChannelError>;
    async fn run_pipeline(
        &mut self,
        frames: Vec<FrameData>,
    ) -> Result<Option<FrameData>, ChannelError>;
    async fn pipeline_free_model(&mut self) -> Result<(), ChannelError>;
    async fn pipeline_free_frames(&mut self) -> Result<(), ChannelError>;

    async fn close(&mut self) {}
}

/// Unframed byte pipe for large tensor payloads.
#[async_trait]
pub trait BulkChannel: Send {
    async fn send(&mut self, data: &[u8]) -> Result<(), ChannelError>;
    /// Receives exactly `length` bytes.
    async fn recv(&mut self, length: u64) -> Result<Vec<u8>, ChannelError>;

    async fn close(&mut self) {}
}

/// Deadline for one control round trip unless a link sets its own.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens the channels of one device endpoint.
#[async_trait]
pub trait Link: Send + Sync {
    fn endpoint(&self) -> String;

    /// How long the handshake waits for each answer.
    fn call_timeout(&self) -> Duration {
        DEFAULT_CALL_TIMEOUT
    }

    async fn open_control(&self) -> Result<Box<dyn ControlChannel>, ChannelError>;
    async fn open_bulk(&self) -> Result<Box<dyn BulkChannel>, ChannelError>;
}
