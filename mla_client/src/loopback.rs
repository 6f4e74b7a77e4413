//! In-process DevKit stand-in.
//!
//! Serves the control and bulk channels from memory so that sessions,
//! executors and evaluation loops can be driven without hardware. It keeps
//! the device-side rules that matter to the host: one owning connection at a
//! time, handles that must exist, staged artifacts, and bulk payloads that
//! are consumed by the announcing control call.

use crate::channel::{
    BatchRun, BulkChannel, ControlChannel, FrameData, HandleKind, Link, RunStatus, ScriptOutput,
    ScriptRequest, VersionCheck, DEFAULT_CALL_TIMEOUT,
};
use crate::error::ChannelError;
use crate::session::PROTOCOL_VERSION;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tonic::async_trait;

#[derive(Debug)]
struct DeviceState {
    next_connection: u64,
    owner: Option<u64>,
    connected: bool,
    version: f64,
    compatible: bool,
    calls: Vec<&'static str>,
    next_handle: u64,
    staged: HashSet<String>,
    models: HashMap<u64, String>,
    buffers: HashMap<u64, (HandleKind, Vec<u8>)>,
    allocations: usize,
    allocation_limit: Option<usize>,
    run_output: Option<Vec<u8>>,
    run_status: i32,
    elapsed_us: f64,
    last_batch: Option<BatchRun>,
    layer_stats: Option<String>,
    archive: Option<String>,
    pipeline_model: bool,
    pipeline_frames: usize,
    pipeline_output: Option<Option<FrameData>>,
    inbox: VecDeque<u8>,
    outbox: VecDeque<u8>,
    bulk_bytes: u64,
    control_payload_bytes: u64,
    virtual_envs: Vec<String>,
    script_runtime: Duration,
    scripts: Vec<ScriptRequest>,
    silent: bool,
    call_timeout: Duration,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            next_connection: 1,
            owner: None,
            connected: true,
            version: PROTOCOL_VERSION,
            compatible: true,
            calls: Vec::new(),
            next_handle: 1,
            staged: HashSet::new(),
            models: HashMap::new(),
            buffers: HashMap::new(),
            allocations: 0,
            allocation_limit: None,
            run_output: None,
            run_status: 0,
            elapsed_us: 1000.0,
            last_batch: None,
            layer_stats: None,
            archive: None,
            pipeline_model: false,
            pipeline_frames: 0,
            pipeline_output: None,
            inbox: VecDeque::new(),
            outbox: VecDeque::new(),
            bulk_bytes: 0,
            control_payload_bytes: 0,
            virtual_envs: Vec::new(),
            script_runtime: Duration::from_secs(1),
            scripts: Vec::new(),
            silent: false,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

fn refused(message: impl Into<String>) -> ChannelError {
    ChannelError::Remote {
        status: -1,
        message: message.into(),
    }
}

impl DeviceState {
    fn new_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn buffer_mut(&mut self, handle: u64) -> Result<&mut Vec<u8>, ChannelError> {
        self.buffers
            .get_mut(&handle)
            .map(|(_, data)| data)
            .ok_or_else(|| refused(format!("unknown buffer handle {}", handle)))
    }

    fn execute(&mut self, model: u64, ifm: u64, ofm: u64) -> Result<(), ChannelError> {
        if !self.models.contains_key(&model) {
            return Err(refused(format!("unknown model handle {}", model)));
        }
        let input = self.buffer_mut(ifm)?.clone();
        let mut fill = self.run_output.clone().unwrap_or(input);
        let output = self.buffer_mut(ofm)?;
        fill.resize(output.len(), 0);
        *output = fill;
        Ok(())
    }
}

/// Shared handle on one emulated device. Clones observe the same device.
#[derive(Debug, Clone, Default)]
pub struct LoopbackDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl LoopbackDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Makes a file available on the device, by absolute remote path.
    pub fn stage_file(&self, path: &str) {
        self.lock().staged.insert(path.to_string());
    }

    pub fn set_version(&self, version: f64, compatible: bool) {
        let mut state = self.lock();
        state.version = version;
        state.compatible = compatible;
    }

    /// Refuses every allocation once `count` more have succeeded.
    pub fn fail_allocations_after(&self, count: usize) {
        let mut state = self.lock();
        state.allocation_limit = Some(state.allocations + count);
    }

    /// Bytes every run writes to its output buffers; by default a run copies
    /// its input.
    pub fn set_run_output(&self, output: Vec<u8>) {
        self.lock().run_output = Some(output);
    }

    pub fn set_run_status(&self, status: i32) {
        self.lock().run_status = status;
    }

    pub fn set_elapsed_us(&self, elapsed_us: f64) {
        self.lock().elapsed_us = elapsed_us;
    }

    /// Output of the pipelined runtime; by default it echoes the first frame.
    pub fn set_pipeline_output(&self, output: Option<FrameData>) {
        self.lock().pipeline_output = Some(output);
    }

    pub fn set_script_runtime(&self, runtime: Duration) {
        self.lock().script_runtime = runtime;
    }

    /// Accepts connections but never answers a ping.
    pub fn go_silent(&self) {
        self.lock().silent = true;
    }

    pub fn set_call_timeout(&self, call_timeout: Duration) {
        self.lock().call_timeout = call_timeout;
    }

    /// Drops every connection; later requests fail as closed.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.connected = false;
        state.owner = None;
    }

    pub fn calls(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn calls_to(&self, rpc: &str) -> usize {
        self.lock().calls.iter().filter(|&&name| name == rpc).count()
    }

    /// Buffers and models currently allocated on the device.
    pub fn live_handles(&self) -> usize {
        let state = self.lock();
        state.buffers.len() + state.models.len()
    }

    pub fn bulk_bytes(&self) -> u64 {
        self.lock().bulk_bytes
    }

    pub fn control_payload_bytes(&self) -> u64 {
        self.lock().control_payload_bytes
    }

    pub fn last_batch(&self) -> Option<BatchRun> {
        self.lock().last_batch.clone()
    }

    pub fn layer_stats(&self) -> Option<String> {
        self.lock().layer_stats.clone()
    }

    pub fn archive(&self) -> Option<String> {
        self.lock().archive.clone()
    }

    pub fn pipeline_frames(&self) -> usize {
        self.lock().pipeline_frames
    }

    pub fn virtual_envs(&self) -> Vec<String> {
        self.lock().virtual_envs.clone()
    }

    pub fn scripts(&self) -> Vec<ScriptRequest> {
        self.lock().scripts.clone()
    }
}

#[async_trait]
impl Link for LoopbackDevice {
    fn endpoint(&self) -> String {
        "loopback".to_string()
    }

    fn call_timeout(&self) -> Duration {
        self.lock().call_timeout
    }

    async fn open_control(&self) -> Result<Box<dyn ControlChannel>, ChannelError> {
        let mut state = self.lock();
        state.connected = true;
        let connection = state.next_connection;
        state.next_connection += 1;
        Ok(Box::new(LoopbackControl {
            device: self.clone(),
            connection,
        }))
    }

    async fn open_bulk(&self) -> Result<Box<dyn BulkChannel>, ChannelError> {
        Ok(Box::new(LoopbackBulk {
            device: self.clone(),
        }))
    }
}

struct LoopbackControl {
    device: LoopbackDevice,
    connection: u64,
}

impl LoopbackControl {
    /// Records the call and rejects connections that do not own the device.
    fn enter(&self, rpc: &'static str) -> Result<MutexGuard<'_, DeviceState>, ChannelError> {
        let mut state = self.device.lock();
        state.calls.push(rpc);
        if !state.connected {
            return Err(ChannelError::Closed("connection reset by peer".into()));
        }
        match state.owner {
            Some(owner) if owner != self.connection => {
                Err(ChannelError::Closed("device serves another session".into()))
            }
            Some(_) => Ok(state),
            None if rpc == "ping" => {
                state.owner = Some(self.connection);
                Ok(state)
            }
            None => Err(ChannelError::Closed("connection not established".into())),
        }
    }
}

#[async_trait]
impl ControlChannel for LoopbackControl {
    async fn ping(&mut self, message: &str) -> Result<String, ChannelError> {
        let silent = self.enter("ping")?.silent;
        if silent {
            std::future::pending::<()>().await;
        }
        Ok(if message == "ping" { "pong" } else { message }.to_string())
    }

    async fn check_version(&mut self, _version: f64) -> Result<VersionCheck, ChannelError> {
        let state = self.enter("check_version")?;
        Ok(VersionCheck {
            compatible: state.compatible,
            remote_version: state.version,
        })
    }

    async fn dv_connect(&mut self, layer_stats_path: Option<&str>) -> Result<(), ChannelError> {
        let mut state = self.enter("dv_connect")?;
        state.layer_stats = layer_stats_path.map(str::to_string);
        Ok(())
    }

    async fn pm_connect(&mut self, archive: &str) -> Result<(), ChannelError> {
        let mut state = self.enter("pm_connect")?;
        state.archive = Some(archive.to_string());
        state.pipeline_model = true;
        Ok(())
    }

    async fn load_model(&mut self, path: &str) -> Result<u64, ChannelError> {
        let mut state = self.enter("load_model")?;
        if !state.staged.contains(path) {
            return Err(refused(format!("{}: no such file", path)));
        }
        let handle = state.new_handle();
        state.models.insert(handle, path.to_string());
        Ok(handle)
    }

    async fn allocate(&mut self, kind: HandleKind, length: u64) -> Result<u64, ChannelError> {
        let mut state = self.enter("allocate")?;
        if matches!(state.allocation_limit, Some(limit) if state.allocations >= limit) {
            return Err(refused("out of device memory"));
        }
        state.allocations += 1;
        let handle = state.new_handle();
        state.buffers.insert(handle, (kind, vec![0; length as usize]));
        Ok(handle)
    }

    async fn upload(&mut self, handle: u64, data: &[u8]) -> Result<(), ChannelError> {
        let mut state = self.enter("upload")?;
        state.control_payload_bytes += data.len() as u64;
        let buffer = state.buffer_mut(handle)?;
        buffer[..data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn upload_announce(&mut self, handle: u64, length: u64) -> Result<(), ChannelError> {
        let mut state = self.enter("upload_announce")?;
        let length = length as usize;
        if state.inbox.len() < length {
            return Err(refused(format!(
                "announced {} bytes, bulk channel holds {}",
                length,
                state.inbox.len()
            )));
        }
        let payload: Vec<u8> = state.inbox.drain(..length).collect();
        let buffer = state.buffer_mut(handle)?;
        buffer[..length].copy_from_slice(&payload);
        Ok(())
    }

    async fn download(&mut self, handle: u64, length: u64) -> Result<Vec<u8>, ChannelError> {
        let mut state = self.enter("download")?;
        state.control_payload_bytes += length;
        let buffer = state.buffer_mut(handle)?;
        Ok(buffer[..length as usize].to_vec())
    }

    async fn download_announce(&mut self, handle: u64, length: u64) -> Result<(), ChannelError> {
        let mut state = self.enter("download_announce")?;
        let payload = state.buffer_mut(handle)?[..length as usize].to_vec();
        state.outbox.extend(payload);
        Ok(())
    }

    async fn run(&mut self, model: u64, ifm: u64, ofm: u64) -> Result<RunStatus, ChannelError> {
        let mut state = self.enter("run")?;
        state.execute(model, ifm, ofm)?;
        Ok(RunStatus {
            status: state.run_status,
            elapsed_us: state.elapsed_us,
        })
    }

    async fn run_batch(&mut self, batch: &BatchRun) -> Result<RunStatus, ChannelError> {
        let mut state = self.enter("run_batch")?;
        for (&ifm, &ofm) in batch.ifms.iter().zip(&batch.ofms) {
            state.execute(batch.model, ifm, ofm)?;
        }
        state.last_batch = Some(batch.clone());
        Ok(RunStatus {
            status: state.run_status,
            elapsed_us: state.elapsed_us,
        })
    }

    async fn free(&mut self, kind: HandleKind, handle: u64) -> Result<(), ChannelError> {
        let mut state = self.enter("free")?;
        let removed = match kind {
            HandleKind::Model => state.models.remove(&handle).is_some(),
            _ => state.buffers.remove(&handle).is_some(),
        };
        if removed {
            Ok(())
        } else {
            Err(refused(format!("unknown {:?} handle {}", kind, handle)))
        }
    }

    async fn create_virtual_env(&mut self, name: &str) -> Result<(), ChannelError> {
        let mut state = self.enter("create_virtual_env")?;
        if !state.virtual_envs.iter().any(|env| env == name) {
            state.virtual_envs.push(name.to_string());
        }
        Ok(())
    }

    async fn delete_virtual_env(&mut self, name: &str) -> Result<(), ChannelError> {
        let mut state = self.enter("delete_virtual_env")?;
        let before = state.virtual_envs.len();
        state.virtual_envs.retain(|env| env != name);
        if state.virtual_envs.len() == before {
            return Err(refused(format!("no virtual environment {}", name)));
        }
        Ok(())
    }

    async fn run_remote_script(
        &mut self,
        request: &ScriptRequest,
    ) -> Result<ScriptOutput, ChannelError> {
        let mut state = self.enter("run_remote_script")?;
        state.scripts.push(request.clone());
        if state.script_runtime > request.timeout {
            return Ok(ScriptOutput {
                status: 124,
                stdout: String::new(),
                stderr: format!(
                    "Command timed out after {} seconds",
                    request.timeout.as_secs()
                ),
                timed_out: false,
            });
        }
        Ok(ScriptOutput {
            status: 0,
            stdout: format!("ran {}", request.command.join(" ")),
            stderr: String::new(),
            timed_out: false,
        })
    }

    async fn run_pipeline(
        &mut self,
        frames: Vec<FrameData>,
    ) -> Result<Option<FrameData>, ChannelError> {
        let mut state = self.enter("run_pipeline")?;
        if !state.pipeline_model {
            return Err(refused("no pipeline loaded"));
        }
        state.pipeline_frames += 1;
        Ok(match &state.pipeline_output {
            Some(output) => output.clone(),
            None => frames.into_iter().next(),
        })
    }

    async fn pipeline_free_model(&mut self) -> Result<(), ChannelError> {
        let mut state = self.enter("pipeline_free_model")?;
        state.pipeline_model = false;
        Ok(())
    }

    async fn pipeline_free_frames(&mut self) -> Result<(), ChannelError> {
        let mut state = self.enter("pipeline_free_frames")?;
        state.pipeline_frames = 0;
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.device.lock();
        if state.owner == Some(self.connection) {
            state.owner = None;
        }
    }
}

struct LoopbackBulk {
    device: LoopbackDevice,
}

#[async_trait]
impl BulkChannel for LoopbackBulk {
    async fn send(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let mut state = self.device.lock();
        if !state.connected {
            return Err(ChannelError::Closed("bulk channel reset".into()));
        }
        state.bulk_bytes += data.len() as u64;
        state.inbox.extend(data.iter().copied());
        Ok(())
    }

    async fn recv(&mut self, length: u64) -> Result<Vec<u8>, ChannelError> {
        let mut state = self.device.lock();
        let length = length as usize;
        if !state.connected || state.outbox.len() < length {
            return Err(ChannelError::Closed("bulk channel ended early".into()));
        }
        state.bulk_bytes += length as u64;
        Ok(state.outbox.drain(..length).collect())
    }
}
