use crate::channel::{
    BatchRun, ControlChannel, Direction, FrameData, HandleKind, Link, ScriptOutput, ScriptRequest,
};
use crate::error::{ChannelError, SessionError};
use crate::transfer::{BufferTransport, BulkTransfer, ControlTransfer, TransferMode};
use std::{
    collections::HashMap,
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tokio::time::{timeout, Duration};
use tracing::instrument;

pub const PROTOCOL_VERSION: f64 = 1.07;
pub const REMOTE_STAGING_DIR: &str = "/home/sima";

const PING_MESSAGE: &str = "ping";
const PING_REPLY: &str = "pong";
const SCRIPT_TIMEOUT_MARKER: &str = "Command timed out";
const SCRIPT_GRACE: Duration = Duration::from_secs(5);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    /// Host drives the accelerator buffer by buffer.
    Direct,
    /// The device runs a whole pre/MLA/post pipeline from an archive.
    Pipelined,
}

impl fmt::Display for BindMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindMode::Direct => write!(f, "direct"),
            BindMode::Pipelined => write!(f, "pipelined"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    DeviceBound(BindMode),
    ModelLoaded,
    Running,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::DeviceBound(mode) => write!(f, "bound ({})", mode),
            SessionState::ModelLoaded => write!(f, "model loaded"),
            SessionState::Running => write!(f, "running"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceBinding {
    Direct {
        layer_stats: Option<String>,
        transfer: TransferMode,
    },
    Pipelined {
        archive: String,
    },
}

/// Per-inference buffer sizes the loaded model expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelContract {
    pub ifm_size: u64,
    pub ofm_size: u64,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunReport {
    /// Execution time measured on the device.
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Orphan {
    kind: HandleKind,
    handle: u64,
}

type ReleaseQueue = Arc<Mutex<Vec<Orphan>>>;

/// Ownership token of one device handle. Dropping it without an explicit
/// free hands the handle back to the session's release queue.
#[derive(Debug)]
struct Lease {
    orphan: Orphan,
    session_id: u64,
    queue: ReleaseQueue,
    armed: bool,
}

impl Lease {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.queue.lock() {
            Ok(mut queue) => queue.push(self.orphan),
            Err(poisoned) => poisoned.into_inner().push(self.orphan),
        }
    }
}

/// Device memory reference, valid between allocate and free.
#[derive(Debug)]
pub struct RemoteBuffer {
    lease: Lease,
    length: u64,
    direction: Direction,
}

impl RemoteBuffer {
    pub fn handle(&self) -> u64 {
        self.lease.orphan.handle
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn session_id(&self) -> u64 {
        self.lease.session_id
    }
}

/// Equal-length buffers sharing one lifecycle.
#[derive(Debug)]
pub struct BufferArray {
    buffers: Vec<RemoteBuffer>,
    length: u64,
    direction: Direction,
}

impl BufferArray {
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffer_len(&self) -> u64 {
        self.length
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteBuffer> {
        self.buffers.iter()
    }

    fn handles(&self) -> Vec<u64> {
        self.buffers.iter().map(RemoteBuffer::handle).collect()
    }
}

#[derive(Debug)]
pub struct ModelHandle {
    lease: Lease,
    contract: ModelContract,
}

impl ModelHandle {
    pub fn handle(&self) -> u64 {
        self.lease.orphan.handle
    }

    pub fn contract(&self) -> ModelContract {
        self.contract
    }

    pub fn session_id(&self) -> u64 {
        self.lease.session_id
    }
}

/// One exclusive session with a DevKit.
pub struct RemoteSession {
    id: u64,
    endpoint: String,
    link: Box<dyn Link>,
    control: Box<dyn ControlChannel>,
    transport: Option<Box<dyn BufferTransport>>,
    remote_version: f64,
    alive: bool,
    binding: Option<BindMode>,
    model: Option<(u64, ModelContract)>,
    buffers: HashMap<u64, (HandleKind, u64)>,
    pipeline_model: bool,
    pipeline_frames: bool,
    orphans: ReleaseQueue,
}

fn remote_path(path: &str) -> String {
    let name = Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path);
    format!("{}/{}", REMOTE_STAGING_DIR, name)
}

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}

impl RemoteSession {
    /// Opens the control channel and performs the ping and version handshake.
    pub async fn connect<L: Link + 'static>(link: L) -> Result<Self, SessionError> {
        let endpoint = link.endpoint();
        let mut control = link
            .open_control()
            .await
            .map_err(|e| SessionError::ConnectFailed {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;

        let limit = link.call_timeout();
        let ping = match timeout(limit, control.ping(PING_MESSAGE)).await {
            Ok(ping) => ping,
            Err(_) => {
                control.close().await;
                return Err(SessionError::ConnectFailed {
                    endpoint,
                    reason: format!("no answer to ping within {:?}", limit),
                });
            }
        };
        match ping {
            Ok(reply) if reply == PING_REPLY => {}
            Ok(reply) => {
                control.close().await;
                return Err(SessionError::PingFailed(reply));
            }
            Err(ChannelError::Closed(reason)) => {
                tracing::error!("DevKit {} closed the connection: {}", endpoint, reason);
                return Err(SessionError::Busy { endpoint });
            }
            Err(e) => {
                return Err(SessionError::ConnectFailed {
                    endpoint,
                    reason: e.to_string(),
                })
            }
        }

        let check = match timeout(limit, control.check_version(PROTOCOL_VERSION)).await {
            Ok(Ok(check)) => check,
            Err(_) => {
                control.close().await;
                return Err(SessionError::ConnectFailed {
                    endpoint,
                    reason: format!("no answer to the version check within {:?}", limit),
                });
            }
            Ok(Err(e)) => {
                control.close().await;
                return Err(SessionError::ConnectFailed {
                    endpoint,
                    reason: e.to_string(),
                });
            }
        };
        if !check.compatible {
            control.close().await;
            return Err(SessionError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: check.remote_version,
            });
        }

        tracing::info!(
            "Connected to DevKit {} (protocol {})",
            endpoint,
            check.remote_version
        );

        Ok(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            link: Box::new(link),
            control,
            transport: None,
            remote_version: check.remote_version,
            alive: true,
            binding: None,
            model: None,
            buffers: HashMap::new(),
            pipeline_model: false,
            pipeline_frames: false,
            orphans: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn protocol_version(&self) -> f64 {
        self.remote_version
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn state(&self) -> SessionState {
        if !self.alive {
            return SessionState::Disconnected;
        }
        match (self.binding, self.model.is_some()) {
            (None, _) => SessionState::Connected,
            (Some(_), true) if !self.buffers.is_empty() => SessionState::Running,
            (Some(_), true) => SessionState::ModelLoaded,
            (Some(mode), false) => SessionState::DeviceBound(mode),
        }
    }

    /// Handles the session still owns on the device.
    pub fn outstanding(&self) -> usize {
        self.buffers.len() + usize::from(self.model.is_some())
    }

    /// Dropped handles waiting for the next round trip.
    pub fn pending_orphans(&self) -> usize {
        match self.orphans.lock() {
            Ok(queue) => queue.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn fail(&mut self, op: &'static str, error: ChannelError) -> SessionError {
        match error {
            ChannelError::Remote { status, message } => SessionError::Remote {
                op,
                status,
                message,
            },
            source => {
                tracing::error!("Session with {} lost during {}: {}", self.endpoint, op, source);
                self.alive = false;
                SessionError::Disconnected { op, source }
            }
        }
    }

    fn invalid(&self, op: &'static str) -> SessionError {
        SessionError::InvalidState {
            op,
            state: self.state(),
        }
    }

    fn ensure_alive(&self, op: &'static str) -> Result<(), SessionError> {
        if self.alive {
            Ok(())
        } else {
            Err(self.invalid(op))
        }
    }

    fn ensure_direct(&self, op: &'static str) -> Result<(), SessionError> {
        if self.alive && self.binding == Some(BindMode::Direct) {
            Ok(())
        } else {
            Err(self.invalid(op))
        }
    }

    fn ensure_model(&self, op: &'static str) -> Result<ModelContract, SessionError> {
        self.ensure_direct(op)?;
        match self.model {
            Some((_, contract)) => Ok(contract),
            None => Err(self.invalid(op)),
        }
    }

    fn ensure_live(&self, buffer: &RemoteBuffer) -> Result<(), SessionError> {
        if buffer.session_id() != self.id || !self.buffers.contains_key(&buffer.handle()) {
            return Err(SessionError::StaleHandle(buffer.handle()));
        }
        Ok(())
    }

    fn ensure_buffer(
        &self,
        op: &'static str,
        buffer: &RemoteBuffer,
        expected: Direction,
    ) -> Result<(), SessionError> {
        self.ensure_live(buffer)?;
        if buffer.direction() != expected {
            return Err(SessionError::WrongDirection { op, expected });
        }
        Ok(())
    }

    fn ensure_array(
        &self,
        op: &'static str,
        array: &BufferArray,
        expected: Direction,
    ) -> Result<(), SessionError> {
        array
            .iter()
            .try_for_each(|buffer| self.ensure_buffer(op, buffer, expected))
    }

    fn ensure_model_handle(&self, model: &ModelHandle) -> Result<(), SessionError> {
        match self.model {
            Some((handle, _)) if model.session_id() == self.id && handle == model.handle() => {
                Ok(())
            }
            _ => Err(SessionError::StaleHandle(model.handle())),
        }
    }

    fn lease(&self, kind: HandleKind, handle: u64) -> Lease {
        Lease {
            orphan: Orphan { kind, handle },
            session_id: self.id,
            queue: self.orphans.clone(),
            armed: true,
        }
    }

    fn take_orphans(&self) -> Vec<Orphan> {
        match self.orphans.lock() {
            Ok(mut queue) => std::mem::take(&mut *queue),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    /// Frees handles whose owners were dropped without an explicit free.
    async fn reclaim_orphans(&mut self) -> Result<(), SessionError> {
        for orphan in self.take_orphans() {
            let live = match orphan.kind {
                HandleKind::Model => matches!(self.model, Some((h, _)) if h == orphan.handle),
                _ => self.buffers.contains_key(&orphan.handle),
            };
            if !live {
                continue;
            }
            tracing::debug!("Releasing dropped {:?} handle {}", orphan.kind, orphan.handle);
            self.forget(orphan);
            let result = self.control.free(orphan.kind, orphan.handle).await;
            if let Err(e) = result {
                let error = self.fail("free", e);
                if !self.alive {
                    return Err(error);
                }
                tracing::warn!("Failed to release handle {}: {}", orphan.handle, error);
            }
        }
        Ok(())
    }

    fn forget(&mut self, orphan: Orphan) {
        match orphan.kind {
            HandleKind::Model => self.model = None,
            _ => {
                self.buffers.remove(&orphan.handle);
            }
        }
    }

    pub async fn bind_device(&mut self, binding: DeviceBinding) -> Result<(), SessionError> {
        self.ensure_alive("bind_device")?;
        if let Some(mode) = self.binding {
            return Err(SessionError::AlreadyBound(mode));
        }

        match binding {
            DeviceBinding::Direct {
                layer_stats,
                transfer,
            } => {
                let layer_stats = layer_stats.map(|path| remote_path(&path));
                let result = self.control.dv_connect(layer_stats.as_deref()).await;
                result.map_err(|e| self.fail("bind_device", e))?;

                let transport: Box<dyn BufferTransport> = match transfer {
                    TransferMode::Bulk => {
                        let result = self.link.open_bulk().await;
                        let bulk = result.map_err(|e| self.fail("bind_device", e))?;
                        Box::new(BulkTransfer::new(bulk))
                    }
                    TransferMode::Control => Box::new(ControlTransfer),
                };
                tracing::info!(
                    "Bound {} in direct mode with {:?} transfers",
                    self.endpoint,
                    transport.mode()
                );
                self.transport = Some(transport);
                self.binding = Some(BindMode::Direct);
            }
            DeviceBinding::Pipelined { archive } => {
                if !archive.ends_with(".tar.gz") {
                    return Err(SessionError::InvalidArchive(archive));
                }
                let result = self.control.pm_connect(basename(&archive)).await;
                result.map_err(|e| self.fail("bind_device", e))?;

                tracing::info!("Bound {} in pipelined mode with {}", self.endpoint, archive);
                self.binding = Some(BindMode::Pipelined);
                self.pipeline_model = true;
            }
        }
        Ok(())
    }

    /// Loads a model staged under the remote staging directory.
    pub async fn load_model(
        &mut self,
        path: &str,
        contract: ModelContract,
    ) -> Result<ModelHandle, SessionError> {
        self.ensure_direct("load_model")?;
        if self.model.is_some() {
            return Err(SessionError::ModelAlreadyLoaded);
        }
        if contract.ifm_size == 0 || contract.ofm_size == 0 || contract.batch_size == 0 {
            return Err(SessionError::InvalidContract(format!(
                "ifm_size {}, ofm_size {} and batch_size {} must all be non-zero",
                contract.ifm_size, contract.ofm_size, contract.batch_size
            )));
        }
        self.reclaim_orphans().await?;

        let remote = remote_path(path);
        let result = self.control.load_model(&remote).await;
        let handle = result.map_err(|e| self.fail("load_model", e))?;

        tracing::info!("Loaded model {} as handle {}", remote, handle);
        self.model = Some((handle, contract));
        Ok(ModelHandle {
            lease: self.lease(HandleKind::Model, handle),
            contract,
        })
    }

    pub async fn allocate(
        &mut self,
        direction: Direction,
        length: u64,
    ) -> Result<RemoteBuffer, SessionError> {
        if length == 0 {
            return Err(SessionError::ZeroLengthAllocation);
        }
        self.ensure_model("allocate")?;
        self.reclaim_orphans().await?;
        self.allocate_one(direction, length).await
    }

    async fn allocate_one(
        &mut self,
        direction: Direction,
        length: u64,
    ) -> Result<RemoteBuffer, SessionError> {
        let kind = HandleKind::from(direction);
        let result = self.control.allocate(kind, length).await;
        let handle = result.map_err(|e| self.fail("allocate", e))?;

        self.buffers.insert(handle, (kind, length));
        Ok(RemoteBuffer {
            lease: self.lease(kind, handle),
            length,
            direction,
        })
    }

    /// Allocates `count` buffers; a partial failure frees what this call got.
    pub async fn allocate_array(
        &mut self,
        direction: Direction,
        length: u64,
        count: usize,
    ) -> Result<BufferArray, SessionError> {
        if count == 0 {
            return Err(SessionError::EmptyArray);
        }
        if length == 0 {
            return Err(SessionError::ZeroLengthAllocation);
        }
        self.ensure_model("allocate_array")?;
        self.reclaim_orphans().await?;

        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            match self.allocate_one(direction, length).await {
                Ok(buffer) => buffers.push(buffer),
                Err(e) => {
                    tracing::warn!(
                        "Allocation failed after {} of {} buffers, rolling back",
                        buffers.len(),
                        count
                    );
                    for buffer in buffers {
                        self.free(buffer).await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(BufferArray {
            buffers,
            length,
            direction,
        })
    }

    pub async fn upload(&mut self, buffer: &RemoteBuffer, data: &[u8]) -> Result<(), SessionError> {
        if data.is_empty() {
            return Err(SessionError::EmptyPayload);
        }
        self.ensure_model("upload")?;
        self.ensure_live(buffer)?;
        if data.len() as u64 > buffer.len() {
            return Err(SessionError::LengthExceedsBuffer {
                len: data.len() as u64,
                capacity: buffer.len(),
            });
        }
        self.reclaim_orphans().await?;
        self.upload_unchecked(buffer.handle(), data).await
    }

    async fn upload_unchecked(&mut self, handle: u64, data: &[u8]) -> Result<(), SessionError> {
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => return Err(self.invalid("upload")),
        };
        let result = transport.upload(self.control.as_mut(), handle, data).await;
        result.map_err(|e| self.fail("upload", e))
    }

    pub async fn download(
        &mut self,
        buffer: &RemoteBuffer,
        length: u64,
    ) -> Result<Vec<u8>, SessionError> {
        if length == 0 {
            return Err(SessionError::EmptyPayload);
        }
        self.ensure_model("download")?;
        self.ensure_live(buffer)?;
        if length > buffer.len() {
            return Err(SessionError::LengthExceedsBuffer {
                len: length,
                capacity: buffer.len(),
            });
        }
        self.reclaim_orphans().await?;
        self.download_unchecked(buffer.handle(), length).await
    }

    async fn download_unchecked(
        &mut self,
        handle: u64,
        length: u64,
    ) -> Result<Vec<u8>, SessionError> {
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => return Err(self.invalid("download")),
        };
        let result = transport
            .download(self.control.as_mut(), handle, length)
            .await;
        result.map_err(|e| self.fail("download", e))
    }

    pub async fn upload_array<P>(
        &mut self,
        array: &BufferArray,
        payloads: &[P],
    ) -> Result<(), SessionError>
    where
        P: AsRef<[u8]> + Sync,
    {
        if payloads.len() != array.len() {
            return Err(SessionError::PayloadCountMismatch {
                expected: array.len(),
                got: payloads.len(),
            });
        }
        self.ensure_model("upload_array")?;
        array.iter().try_for_each(|buffer| self.ensure_live(buffer))?;
        for payload in payloads {
            let payload = payload.as_ref();
            if payload.is_empty() {
                return Err(SessionError::EmptyPayload);
            }
            if payload.len() as u64 > array.buffer_len() {
                return Err(SessionError::LengthExceedsBuffer {
                    len: payload.len() as u64,
                    capacity: array.buffer_len(),
                });
            }
        }
        self.reclaim_orphans().await?;

        for (buffer, payload) in array.iter().zip(payloads) {
            self.upload_unchecked(buffer.handle(), payload.as_ref())
                .await?;
        }
        Ok(())
    }

    pub async fn download_array(
        &mut self,
        array: &BufferArray,
        length: u64,
    ) -> Result<Vec<Vec<u8>>, SessionError> {
        if length == 0 {
            return Err(SessionError::EmptyPayload);
        }
        self.ensure_model("download_array")?;
        array.iter().try_for_each(|buffer| self.ensure_live(buffer))?;
        if length > array.buffer_len() {
            return Err(SessionError::LengthExceedsBuffer {
                len: length,
                capacity: array.buffer_len(),
            });
        }
        self.reclaim_orphans().await?;

        let mut outputs = Vec::with_capacity(array.len());
        for buffer in array.iter() {
            outputs.push(self.download_unchecked(buffer.handle(), length).await?);
        }
        Ok(outputs)
    }

    #[instrument(level = "debug", skip_all, fields(ifm = ifm.handle(), ofm = ofm.handle()))]
    pub async fn run(
        &mut self,
        model: &ModelHandle,
        ifm: &RemoteBuffer,
        ofm: &RemoteBuffer,
    ) -> Result<RunReport, SessionError> {
        self.ensure_model("run")?;
        self.ensure_model_handle(model)?;
        self.ensure_buffer("run", ifm, Direction::Input)?;
        self.ensure_buffer("run", ofm, Direction::Output)?;
        self.reclaim_orphans().await?;

        let result = self
            .control
            .run(model.handle(), ifm.handle(), ofm.handle())
            .await;
        let status = result.map_err(|e| self.fail("run", e))?;
        run_report("run", status.status, status.elapsed_us)
    }

    #[instrument(level = "debug", skip_all, fields(batch_size = batch_size))]
    pub async fn run_batch(
        &mut self,
        model: &ModelHandle,
        ifms: &BufferArray,
        ofms: &BufferArray,
        batch_size: usize,
    ) -> Result<RunReport, SessionError> {
        let contract = self.ensure_model("run_batch")?;
        if batch_size != contract.batch_size {
            return Err(SessionError::BatchSizeMismatch {
                requested: batch_size,
                expected: contract.batch_size,
            });
        }
        if ifms.len() != batch_size || ofms.len() != batch_size {
            return Err(SessionError::BatchShapeMismatch {
                batch_size,
                ifms: ifms.len(),
                ofms: ofms.len(),
            });
        }
        self.ensure_model_handle(model)?;
        self.ensure_array("run_batch", ifms, Direction::Input)?;
        self.ensure_array("run_batch", ofms, Direction::Output)?;
        self.reclaim_orphans().await?;

        let batch = BatchRun {
            model: model.handle(),
            batch_size,
            ifms: ifms.handles(),
            ifm_size: ifms.buffer_len(),
            ofms: ofms.handles(),
            ofm_size: ofms.buffer_len(),
        };
        let result = self.control.run_batch(&batch).await;
        let status = result.map_err(|e| self.fail("run_batch", e))?;
        run_report("run_batch", status.status, status.elapsed_us)
    }

    async fn release_handle(&mut self, kind: HandleKind, handle: u64) {
        if !self.alive {
            return;
        }
        if let Err(e) = self.reclaim_orphans().await {
            tracing::warn!("Failed to release handle {}: {}", handle, e);
            return;
        }
        let result = self.control.free(kind, handle).await;
        if let Err(e) = result {
            let error = self.fail("free", e);
            tracing::warn!("Failed to release handle {}: {}", handle, error);
        }
    }

    /// Never fails; a handle that is no longer live is ignored.
    pub async fn free(&mut self, mut buffer: RemoteBuffer) {
        buffer.lease.disarm();
        if buffer.session_id() != self.id
            || self.buffers.remove(&buffer.handle()).is_none()
        {
            tracing::debug!("Buffer {} is not live, nothing to free", buffer.handle());
            return;
        }
        self.release_handle(buffer.lease.orphan.kind, buffer.handle())
            .await;
    }

    pub async fn free_array(&mut self, array: BufferArray) {
        for buffer in array.buffers {
            self.free(buffer).await;
        }
    }

    pub async fn free_model(&mut self, mut model: ModelHandle) {
        model.lease.disarm();
        if self.ensure_model_handle(&model).is_err() {
            tracing::debug!("Model {} is not live, nothing to free", model.handle());
            return;
        }
        self.model = None;
        self.release_handle(HandleKind::Model, model.handle()).await;
    }

    pub async fn create_virtual_env(&mut self, name: &str) -> Result<(), SessionError> {
        self.ensure_alive("create_virtual_env")?;
        let result = self.control.create_virtual_env(name).await;
        result.map_err(|e| self.fail("create_virtual_env", e))
    }

    pub async fn delete_virtual_env(&mut self, name: &str) -> Result<(), SessionError> {
        self.ensure_alive("delete_virtual_env")?;
        let result = self.control.delete_virtual_env(name).await;
        result.map_err(|e| self.fail("delete_virtual_env", e))
    }

    /// Runs a command on the device. A timeout reports the script as
    /// possibly still running instead of failing.
    pub async fn run_remote_script(
        &mut self,
        command: Vec<String>,
        artifact: &str,
        script_timeout: Duration,
        virtual_env: &str,
    ) -> Result<ScriptOutput, SessionError> {
        self.ensure_alive("run_remote_script")?;
        let request = ScriptRequest {
            command,
            artifact: basename(artifact).to_string(),
            timeout: script_timeout,
            virtual_env: virtual_env.to_string(),
        };

        let deadline = script_timeout.saturating_add(SCRIPT_GRACE);
        let result = timeout(deadline, self.control.run_remote_script(&request)).await;
        match result {
            Ok(Ok(mut output)) => {
                if output.stderr.contains(SCRIPT_TIMEOUT_MARKER) {
                    output.timed_out = true;
                }
                Ok(output)
            }
            Ok(Err(ChannelError::Timeout(reason))) => {
                tracing::warn!("Remote script timed out: {}", reason);
                Ok(timed_out_output())
            }
            Ok(Err(e)) => Err(self.fail("run_remote_script", e)),
            Err(_) => {
                tracing::warn!("Remote script still running after {:?}", deadline);
                Ok(timed_out_output())
            }
        }
    }

    pub async fn run_pipeline(
        &mut self,
        frames: Vec<FrameData>,
    ) -> Result<Option<FrameData>, SessionError> {
        if !self.alive || self.binding != Some(BindMode::Pipelined) || !self.pipeline_model {
            return Err(self.invalid("run_pipeline"));
        }
        let result = self.control.run_pipeline(frames).await;
        let output = result.map_err(|e| self.fail("run_pipeline", e))?;
        self.pipeline_frames = true;
        Ok(output)
    }

    pub async fn free_pipeline_frames(&mut self) {
        if !self.alive || !self.pipeline_frames {
            return;
        }
        self.pipeline_frames = false;
        let result = self.control.pipeline_free_frames().await;
        if let Err(e) = result {
            let error = self.fail("pipeline_free_frames", e);
            tracing::warn!("Failed to free pipeline frames: {}", error);
        }
    }

    pub async fn free_pipeline_model(&mut self) {
        if !self.alive || !self.pipeline_model {
            return;
        }
        self.pipeline_model = false;
        let result = self.control.pipeline_free_model().await;
        if let Err(e) = result {
            let error = self.fail("pipeline_free_model", e);
            tracing::warn!("Failed to free pipeline model: {}", error);
        }
    }

    /// Best-effort teardown of everything the session still owns.
    pub async fn release(&mut self) {
        if self.alive {
            if let Err(e) = self.reclaim_orphans().await {
                tracing::warn!("Failed to release dropped handles: {}", e);
            }

            let mut handles: Vec<(u64, HandleKind)> = self
                .buffers
                .iter()
                .map(|(&handle, &(kind, _))| (handle, kind))
                .collect();
            handles.sort_unstable_by_key(|&(handle, _)| handle);
            for (handle, kind) in handles {
                self.buffers.remove(&handle);
                self.release_handle(kind, handle).await;
            }
            if let Some((handle, _)) = self.model.take() {
                self.release_handle(HandleKind::Model, handle).await;
            }
            self.free_pipeline_frames().await;
            self.free_pipeline_model().await;

            if let Some(mut transport) = self.transport.take() {
                transport.close().await;
            }
            self.control.close().await;
            tracing::info!("Released session with {}", self.endpoint);
        }

        self.alive = false;
        self.buffers.clear();
        self.model = None;
        self.pipeline_frames = false;
        self.pipeline_model = false;
        self.take_orphans();
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if self.alive && self.outstanding() > 0 {
            tracing::warn!(
                "Session with {} dropped with {} handles still on the device",
                self.endpoint,
                self.outstanding()
            );
        }
    }
}

fn run_report(op: &'static str, status: i32, elapsed_us: f64) -> Result<RunReport, SessionError> {
    if status != 0 {
        return Err(SessionError::Remote {
            op,
            status,
            message: "accelerator returned a failure status".to_string(),
        });
    }
    Ok(RunReport {
        elapsed: Duration::from_secs_f64(elapsed_us.max(0.0) / 1e6),
    })
}

fn timed_out_output() -> ScriptOutput {
    ScriptOutput {
        status: -1,
        timed_out: true,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::loopback::LoopbackDevice;

    const CONTRACT: ModelContract = ModelContract {
        ifm_size: 16,
        ofm_size: 8,
        batch_size: 1,
    };

    fn direct(transfer: TransferMode) -> DeviceBinding {
        DeviceBinding::Direct {
            layer_stats: None,
            transfer,
        }
    }

    async fn loaded_session(
        device: &LoopbackDevice,
        transfer: TransferMode,
        contract: ModelContract,
    ) -> (RemoteSession, ModelHandle) {
        device.stage_file("/home/sima/model.lm");
        let mut session = RemoteSession::connect(device.clone()).await.unwrap();
        session.bind_device(direct(transfer)).await.unwrap();
        let model = session
            .load_model("build/model.lm", contract)
            .await
            .unwrap();
        (session, model)
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        let device = LoopbackDevice::new();
        let session = RemoteSession::connect(device.clone()).await.unwrap();

        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.protocol_version(), PROTOCOL_VERSION);
        assert_eq!(device.calls_to("ping"), 1);
        assert_eq!(device.calls_to("check_version"), 1);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_terminal() {
        let device = LoopbackDevice::new();
        device.set_version(1.05, false);

        let error = RemoteSession::connect(device.clone()).await.err().unwrap();
        assert!(matches!(error, SessionError::VersionMismatch { .. }));
        assert_eq!(error.kind(), ErrorKind::Configuration);
        assert!(error.is_terminal());
    }

    #[tokio::test]
    async fn test_second_session_is_busy() {
        let device = LoopbackDevice::new();
        let mut first = RemoteSession::connect(device.clone()).await.unwrap();

        let error = RemoteSession::connect(device.clone()).await.err().unwrap();
        assert!(matches!(error, SessionError::Busy { .. }));
        assert_eq!(error.kind(), ErrorKind::Transport);

        first.release().await;
        assert!(RemoteSession::connect(device.clone()).await.is_ok());
    }

    #[tokio::test]
    async fn test_out_of_order_operations_fail_locally() {
        let device = LoopbackDevice::new();
        let mut session = RemoteSession::connect(device.clone()).await.unwrap();
        let calls = device.calls();

        let error = session
            .load_model("model.lm", CONTRACT)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            error,
            SessionError::InvalidState {
                state: SessionState::Connected,
                ..
            }
        ));
        let error = session.allocate(Direction::Input, 16).await.err().unwrap();
        assert!(matches!(error, SessionError::InvalidState { .. }));
        assert_eq!(device.calls(), calls);
    }

    #[tokio::test]
    async fn test_state_follows_live_handles() {
        let device = LoopbackDevice::new();
        let (mut session, model) =
            loaded_session(&device, TransferMode::Bulk, CONTRACT).await;
        assert_eq!(session.state(), SessionState::ModelLoaded);

        let ifm = session.allocate(Direction::Input, 16).await.unwrap();
        let ofm = session.allocate(Direction::Output, 8).await.unwrap();
        assert_eq!(session.state(), SessionState::Running);

        session.free(ifm).await;
        assert_eq!(session.state(), SessionState::Running);
        session.free(ofm).await;
        assert_eq!(session.state(), SessionState::ModelLoaded);

        session.free_model(model).await;
        assert_eq!(
            session.state(),
            SessionState::DeviceBound(BindMode::Direct)
        );
        assert_eq!(session.outstanding(), 0);
        assert_eq!(device.live_handles(), 0);

        session.release().await;
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_zero_length_allocation_makes_no_remote_call() {
        let device = LoopbackDevice::new();
        let (mut session, _model) =
            loaded_session(&device, TransferMode::Bulk, CONTRACT).await;
        let calls = device.calls();

        let error = session.allocate(Direction::Input, 0).await.err().unwrap();
        assert!(matches!(error, SessionError::ZeroLengthAllocation));
        assert_eq!(error.kind(), ErrorKind::Precondition);
        assert_eq!(device.calls(), calls);

        session.release().await;
    }

    #[tokio::test]
    async fn test_allocate_free_leaves_no_handles() {
        let device = LoopbackDevice::new();
        let (mut session, model) =
            loaded_session(&device, TransferMode::Bulk, CONTRACT).await;

        for _ in 0..5 {
            let ifms = session
                .allocate_array(Direction::Input, 16, 3)
                .await
                .unwrap();
            let ofm = session.allocate(Direction::Output, 8).await.unwrap();
            session.free_array(ifms).await;
            session.free(ofm).await;
        }
        session.free_model(model).await;

        assert_eq!(session.outstanding(), 0);
        assert_eq!(device.live_handles(), 0);
        session.release().await;
    }

    #[tokio::test]
    async fn test_bulk_round_trip() {
        let device = LoopbackDevice::new();
        let (mut session, model) =
            loaded_session(&device, TransferMode::Bulk, CONTRACT).await;
        let payload: Vec<u8> = (0..16).collect();

        let ifm = session.allocate(Direction::Input, 16).await.unwrap();
        let ofm = session.allocate(Direction::Output, 16).await.unwrap();
        session.upload(&ifm, &payload).await.unwrap();
        session.run(&model, &ifm, &ofm).await.unwrap();
        let output = session.download(&ofm, 16).await.unwrap();

        assert_eq!(output, payload);
        assert_eq!(device.bulk_bytes(), 32);
        assert_eq!(device.control_payload_bytes(), 0);
        session.release().await;
    }

    #[tokio::test]
    async fn test_control_round_trip() {
        let device = LoopbackDevice::new();
        let (mut session, model) =
            loaded_session(&device, TransferMode::Control, CONTRACT).await;
        let payload: Vec<u8> = (0..16).rev().collect();

        let ifm = session.allocate(Direction::Input, 16).await.unwrap();
        let ofm = session.allocate(Direction::Output, 16).await.unwrap();
        session.upload(&ifm, &payload).await.unwrap();
        session.run(&model, &ifm, &ofm).await.unwrap();
        let output = session.download(&ofm, 16).await.unwrap();

        assert_eq!(output, payload);
        assert_eq!(device.bulk_bytes(), 0);
        assert_eq!(device.control_payload_bytes(), 32);
        session.release().await;
    }

    #[tokio::test]
    async fn test_same_buffer_round_trip_on_both_transports() {
        for transfer in [TransferMode::Bulk, TransferMode::Control] {
            let device = LoopbackDevice::new();
            let (mut session, _model) = loaded_session(&device, transfer, CONTRACT).await;
            let payload: Vec<u8> = (0..CONTRACT.ofm_size as u8).map(|b| b * 3).collect();

            let ofm = session
                .allocate(Direction::Output, CONTRACT.ofm_size)
                .await
                .unwrap();
            session.upload(&ofm, &payload).await.unwrap();
            let echoed = session.download(&ofm, CONTRACT.ofm_size).await.unwrap();

            assert_eq!(echoed, payload);
            session.free(ofm).await;
            session.release().await;
        }
    }

    #[tokio::test]
    async fn test_upload_larger_than_buffer() {
        let device = LoopbackDevice::new();
        let (mut session, _model) =
            loaded_session(&device, TransferMode::Bulk, CONTRACT).await;
        let ifm = session.allocate(Direction::Input, 4).await.unwrap();

        let error = session.upload(&ifm, &[0; 5]).await.err().unwrap();
        assert!(matches!(
            error,
            SessionError::LengthExceedsBuffer {
                len: 5,
                capacity: 4
            }
        ));
        session.release().await;
    }

    #[tokio::test]
    async fn test_run_reports_device_time_in_seconds() {
        let device = LoopbackDevice::new();
        device.set_elapsed_us(500_000.0);
        let (mut session, model) =
            loaded_session(&device, TransferMode::Bulk, CONTRACT).await;

        let ifm = session.allocate(Direction::Input, 16).await.unwrap();
        let ofm = session.allocate(Direction::Output, 8).await.unwrap();
        let report = session.run(&model, &ifm, &ofm).await.unwrap();
        assert_eq!(report.elapsed, Duration::from_millis(500));

        device.set_run_status(3);
        let error = session.run(&model, &ifm, &ofm).await.err().unwrap();
        assert!(matches!(error, SessionError::Remote { status: 3, .. }));
        assert!(session.is_alive());
        session.release().await;
    }

    #[tokio::test]
    async fn test_batch_size_mismatch_without_remote_contact() {
        let device = LoopbackDevice::new();
        let contract = ModelContract {
            batch_size: 4,
            ..CONTRACT
        };
        let (mut session, model) = loaded_session(&device, TransferMode::Bulk, contract).await;
        let ifms = session
            .allocate_array(Direction::Input, 16, 4)
            .await
            .unwrap();
        let ofms = session
            .allocate_array(Direction::Output, 8, 4)
            .await
            .unwrap();
        let calls = device.calls();

        let error = session
            .run_batch(&model, &ifms, &ofms, 2)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            error,
            SessionError::BatchSizeMismatch {
                requested: 2,
                expected: 4
            }
        ));
        assert_eq!(device.calls(), calls);

        session.run_batch(&model, &ifms, &ofms, 4).await.unwrap();
        let batch = device.last_batch().unwrap();
        assert_eq!(batch.ifms, ifms.handles());
        assert_eq!(batch.ifm_size, 16);
        assert_eq!(batch.ofm_size, 8);
        session.release().await;
    }

    #[tokio::test]
    async fn test_partial_array_allocation_rolls_back() {
        let device = LoopbackDevice::new();
        let (mut session, _model) =
            loaded_session(&device, TransferMode::Bulk, CONTRACT).await;
        device.fail_allocations_after(2);

        let error = session
            .allocate_array(Direction::Input, 16, 4)
            .await
            .err()
            .unwrap();
        assert_eq!(error.kind(), ErrorKind::Remote);
        assert_eq!(session.state(), SessionState::ModelLoaded);
        // Only the model is left on the device.
        assert_eq!(device.live_handles(), 1);
        session.release().await;
    }

    #[tokio::test]
    async fn test_dropped_buffer_is_released_on_next_round_trip() {
        let device = LoopbackDevice::new();
        let (mut session, _model) =
            loaded_session(&device, TransferMode::Bulk, CONTRACT).await;

        let ifm = session.allocate(Direction::Input, 16).await.unwrap();
        drop(ifm);
        assert_eq!(session.pending_orphans(), 1);
        assert_eq!(device.live_handles(), 2);

        let ofm = session.allocate(Direction::Output, 8).await.unwrap();
        assert_eq!(session.pending_orphans(), 0);
        assert_eq!(device.live_handles(), 2);

        session.free(ofm).await;
        session.release().await;
        assert_eq!(device.live_handles(), 0);
    }

    #[tokio::test]
    async fn test_handle_from_another_session_is_stale() {
        let first_device = LoopbackDevice::new();
        let second_device = LoopbackDevice::new();
        let (mut first, _first_model) =
            loaded_session(&first_device, TransferMode::Bulk, CONTRACT).await;
        let (mut second, _second_model) =
            loaded_session(&second_device, TransferMode::Bulk, CONTRACT).await;

        let foreign = first.allocate(Direction::Input, 16).await.unwrap();
        let error = second.upload(&foreign, &[1; 4]).await.err().unwrap();
        assert!(matches!(error, SessionError::StaleHandle(_)));

        second.free(foreign).await;
        assert_eq!(first_device.live_handles(), 2);
        first.release().await;
        second.release().await;
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let device = LoopbackDevice::new();
        let (mut session, _model) =
            loaded_session(&device, TransferMode::Bulk, CONTRACT).await;
        let _ifm = session.allocate(Direction::Input, 16).await.unwrap();

        session.release().await;
        let calls = device.calls();
        session.release().await;

        assert_eq!(device.calls(), calls);
        assert_eq!(device.live_handles(), 0);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_marks_session_dead() {
        let device = LoopbackDevice::new();
        let (mut session, model) =
            loaded_session(&device, TransferMode::Control, CONTRACT).await;
        let ifm = session.allocate(Direction::Input, 16).await.unwrap();
        let ofm = session.allocate(Direction::Output, 8).await.unwrap();

        device.disconnect();
        let error = session.run(&model, &ifm, &ofm).await.err().unwrap();
        assert!(matches!(error, SessionError::Disconnected { op: "run", .. }));
        assert_eq!(session.state(), SessionState::Disconnected);

        // Teardown after a lost session must stay quiet.
        session.free(ifm).await;
        session.release().await;
    }

    #[tokio::test]
    async fn test_load_model_uses_staged_basename() {
        let device = LoopbackDevice::new();
        let mut session = RemoteSession::connect(device.clone()).await.unwrap();
        session
            .bind_device(DeviceBinding::Direct {
                layer_stats: Some("out/layer_stats.yaml".into()),
                transfer: TransferMode::Control,
            })
            .await
            .unwrap();
        assert_eq!(
            device.layer_stats().as_deref(),
            Some("/home/sima/layer_stats.yaml")
        );

        let error = session
            .load_model("missing.lm", CONTRACT)
            .await
            .err()
            .unwrap();
        assert_eq!(error.kind(), ErrorKind::Remote);

        device.stage_file("/home/sima/model.lm");
        session
            .load_model("/tmp/compiled/model.lm", CONTRACT)
            .await
            .unwrap();
        let error = session
            .load_model("/tmp/compiled/model.lm", CONTRACT)
            .await
            .err()
            .unwrap();
        assert!(matches!(error, SessionError::ModelAlreadyLoaded));
        session.release().await;
    }

    #[tokio::test]
    async fn test_bind_only_once() {
        let device = LoopbackDevice::new();
        let mut session = RemoteSession::connect(device.clone()).await.unwrap();

        let error = session
            .bind_device(DeviceBinding::Pipelined {
                archive: "project.zip".into(),
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(error, SessionError::InvalidArchive(_)));

        session
            .bind_device(DeviceBinding::Pipelined {
                archive: "out/project_mpk.tar.gz".into(),
            })
            .await
            .unwrap();
        assert_eq!(device.archive().as_deref(), Some("project_mpk.tar.gz"));

        let error = session
            .bind_device(direct(TransferMode::Bulk))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            error,
            SessionError::AlreadyBound(BindMode::Pipelined)
        ));
        session.release().await;
    }

    #[tokio::test]
    async fn test_pipelined_run() {
        let device = LoopbackDevice::new();
        let mut session = RemoteSession::connect(device.clone()).await.unwrap();
        session
            .bind_device(DeviceBinding::Pipelined {
                archive: "project_mpk.tar.gz".into(),
            })
            .await
            .unwrap();

        let frame = FrameData {
            shape: vec![1, 2, 2, 1],
            data: vec![0.5, 1.0, 1.5, 2.0],
        };
        let output = session.run_pipeline(vec![frame.clone()]).await.unwrap();
        assert_eq!(output, Some(frame));

        session.free_pipeline_frames().await;
        session.free_pipeline_model().await;
        assert_eq!(device.calls_to("pipeline_free_frames"), 1);
        assert_eq!(device.calls_to("pipeline_free_model"), 1);

        let error = session.run_pipeline(Vec::new()).await.err().unwrap();
        assert!(matches!(error, SessionError::InvalidState { .. }));
        session.release().await;
        assert_eq!(device.calls_to("pipeline_free_model"), 1);
    }

    #[tokio::test]
    async fn test_remote_script_timeout_is_not_a_failure() {
        let device = LoopbackDevice::new();
        let mut session = RemoteSession::connect(device.clone()).await.unwrap();
        session.create_virtual_env("sima_env").await.unwrap();

        let output = session
            .run_remote_script(
                vec!["run.py".into(), "--run_args".into()],
                "build/model.tar.gz",
                Duration::from_secs(60),
                "sima_env",
            )
            .await
            .unwrap();
        assert!(!output.timed_out);
        assert_eq!(output.status, 0);

        device.set_script_runtime(Duration::from_secs(120));
        let output = session
            .run_remote_script(
                vec!["run.py".into()],
                "model.tar.gz",
                Duration::from_secs(60),
                "sima_env",
            )
            .await
            .unwrap();
        assert!(output.timed_out);

        session.delete_virtual_env("sima_env").await.unwrap();
        assert!(device.virtual_envs().is_empty());
        session.release().await;
    }

    #[tokio::test]
    async fn test_unbounded_script_timeout_does_not_overflow() {
        let device = LoopbackDevice::new();
        let mut session = RemoteSession::connect(device.clone()).await.unwrap();

        let output = session
            .run_remote_script(vec!["run.py".into()], "model.tar.gz", Duration::MAX, "env")
            .await
            .unwrap();

        assert_eq!(output.status, 0);
        assert_eq!(device.scripts()[0].timeout, Duration::MAX);
        session.release().await;
    }

    #[tokio::test]
    async fn test_silent_device_fails_connect() {
        let device = LoopbackDevice::new();
        device.go_silent();
        device.set_call_timeout(Duration::from_millis(50));

        let error = timeout(Duration::from_secs(5), RemoteSession::connect(device.clone()))
            .await
            .expect("connect must give up on its own")
            .err()
            .unwrap();

        assert!(matches!(error, SessionError::ConnectFailed { .. }));
        assert_eq!(error.kind(), ErrorKind::Transport);
        assert!(error.to_string().contains("no answer to ping"));
    }
}
