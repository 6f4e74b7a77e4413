use crate::bulk::{TcpBulkChannel, DEFAULT_BULK_PORT};
use crate::channel::{
    BatchRun, BulkChannel, ControlChannel, FrameData, HandleKind, Link, RunStatus, ScriptOutput,
    ScriptRequest, VersionCheck, DEFAULT_CALL_TIMEOUT,
};
use crate::error::ChannelError;
use mla_proto::{
    AllocateRequest, AnnounceRequest, BufferKind, DownloadRequest, DvConnectRequest, Empty,
    FreeRequest, HandleReply, LoadModelRequest, MlaRuntimeClient, PingRequest, PipelineRequest,
    PmConnectRequest, RunBatchRequest, RunRequest, StatusReply, TensorFrame, UploadRequest,
    VersionRequest, VirtualEnvRequest,
};
use std::future::Future;
use tokio::time::{timeout, Duration};
use tonic::{async_trait, transport::Channel, Code, Response, Status};

pub const DEFAULT_CONTROL_PORT: u16 = 8000;

/// Control and bulk endpoints of one DevKit.
#[derive(Debug, Clone)]
pub struct GrpcLink {
    host: String,
    port: u16,
    bulk_port: u16,
    connect_timeout: Duration,
    call_timeout: Duration,
}

impl GrpcLink {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            bulk_port: DEFAULT_BULK_PORT,
            connect_timeout: Duration::from_secs(5),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_bulk_port(mut self, bulk_port: u16) -> Self {
        self.bulk_port = bulk_port;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Deadline for every control call except remote scripts, which get
    /// their own run time on top.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    fn control_address(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    fn bulk_address(&self) -> String {
        format!("{}:{}", self.host, self.bulk_port)
    }
}

#[async_trait]
impl Link for GrpcLink {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    async fn open_control(&self) -> Result<Box<dyn ControlChannel>, ChannelError> {
        let address = self.control_address();
        match timeout(
            self.connect_timeout,
            MlaRuntimeClient::connect(address.clone()),
        )
        .await
        {
            Ok(Ok(client)) => Ok(Box::new(GrpcControlChannel {
                client,
                call_timeout: self.call_timeout,
            })),
            Ok(Err(e)) => Err(ChannelError::Closed(format!("{}: {}", address, e))),
            Err(_) => Err(ChannelError::Timeout(format!("connecting to {}", address))),
        }
    }

    async fn open_bulk(&self) -> Result<Box<dyn BulkChannel>, ChannelError> {
        let channel = TcpBulkChannel::connect(self.bulk_address(), self.connect_timeout).await?;
        Ok(Box::new(channel))
    }
}

pub struct GrpcControlChannel {
    client: MlaRuntimeClient<Channel>,
    call_timeout: Duration,
}

/// Awaits one unary call, giving up after `limit`.
async fn bounded<T>(
    limit: Duration,
    rpc: &str,
    call: impl Future<Output = Result<Response<T>, Status>>,
) -> Result<T, ChannelError> {
    match timeout(limit, call).await {
        Ok(Ok(response)) => Ok(response.into_inner()),
        Ok(Err(status)) => Err(map_status(status)),
        Err(_) => Err(ChannelError::Timeout(format!(
            "{} got no answer within {:?}",
            rpc, limit
        ))),
    }
}

fn map_status(status: Status) -> ChannelError {
    match status.code() {
        Code::Unavailable | Code::Cancelled | Code::Aborted => {
            ChannelError::Closed(status.message().to_string())
        }
        Code::DeadlineExceeded => ChannelError::Timeout(status.message().to_string()),
        Code::Unknown if is_transport_message(status.message()) => {
            ChannelError::Closed(status.message().to_string())
        }
        code => ChannelError::Remote {
            status: code as i32,
            message: status.message().to_string(),
        },
    }
}

fn is_transport_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("connection") || message.contains("transport") || message.contains("broken pipe")
}

fn check_reply(reply: StatusReply) -> Result<(), ChannelError> {
    if reply.ok {
        Ok(())
    } else {
        Err(ChannelError::Remote {
            status: -1,
            message: reply.message,
        })
    }
}

fn check_handle(reply: HandleReply) -> Result<u64, ChannelError> {
    if reply.handle == 0 {
        Err(ChannelError::Remote {
            status: -1,
            message: reply.message,
        })
    } else {
        Ok(reply.handle)
    }
}

fn buffer_kind(kind: HandleKind) -> BufferKind {
    match kind {
        HandleKind::Ifm => BufferKind::Ifm,
        HandleKind::Ofm => BufferKind::Ofm,
        HandleKind::Model => BufferKind::Model,
    }
}

pub(crate) fn encode_frame(frame: FrameData) -> TensorFrame {
    let mut data = Vec::with_capacity(frame.data.len() * 4);
    for value in frame.data {
        data.extend_from_slice(&value.to_le_bytes());
    }
    TensorFrame {
        shape: frame.shape.iter().map(|&d| d as u64).collect(),
        data,
    }
}

pub(crate) fn decode_frame(frame: TensorFrame) -> Result<FrameData, ChannelError> {
    let shape: Vec<usize> = frame.shape.iter().map(|&d| d as usize).collect();
    let expected: usize = shape.iter().product();
    if frame.data.len() != expected * 4 {
        return Err(ChannelError::Remote {
            status: -1,
            message: format!(
                "tensor of shape {:?} carries {} bytes",
                shape,
                frame.data.len()
            ),
        });
    }
    let data = frame
        .data
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok(FrameData { shape, data })
}

#[async_trait]
impl ControlChannel for GrpcControlChannel {
    async fn ping(&mut self, message: &str) -> Result<String, ChannelError> {
        let request = PingRequest {
            message: message.to_string(),
        };
        let reply = bounded(self.call_timeout, "Ping", self.client.ping(request)).await?;
        Ok(reply.message)
    }

    async fn check_version(&mut self, version: f64) -> Result<VersionCheck, ChannelError> {
        let request = VersionRequest { version };
        let reply = bounded(
            self.call_timeout,
            "CheckVersion",
            self.client.check_version(request),
        )
        .await?;
        Ok(VersionCheck {
            compatible: reply.compatible,
            remote_version: reply.server_version,
        })
    }

    async fn dv_connect(&mut self, layer_stats_path: Option<&str>) -> Result<(), ChannelError> {
        let request = DvConnectRequest {
            layer_stats_path: layer_stats_path.unwrap_or_default().to_string(),
        };
        check_reply(bounded(self.call_timeout, "DvConnect", self.client.dv_connect(request)).await?)
    }

    async fn pm_connect(&mut self, archive: &str) -> Result<(), ChannelError> {
        let request = PmConnectRequest {
            archive: archive.to_string(),
        };
        check_reply(bounded(self.call_timeout, "PmConnect", self.client.pm_connect(request)).await?)
    }

    async fn load_model(&mut self, path: &str) -> Result<u64, ChannelError> {
        let request = LoadModelRequest {
            path: path.to_string(),
        };
        check_handle(bounded(self.call_timeout, "LoadModel", self.client.load_model(request)).await?)
    }

    async fn allocate(&mut self, kind: HandleKind, length: u64) -> Result<u64, ChannelError> {
        let request = AllocateRequest {
            kind: buffer_kind(kind) as i32,
            length,
        };
        check_handle(bounded(self.call_timeout, "Allocate", self.client.allocate(request)).await?)
    }

    async fn upload(&mut self, handle: u64, data: &[u8]) -> Result<(), ChannelError> {
        let request = UploadRequest {
            handle,
            data: data.to_vec(),
        };
        check_reply(bounded(self.call_timeout, "Upload", self.client.upload(request)).await?)
    }

    async fn upload_announce(&mut self, handle: u64, length: u64) -> Result<(), ChannelError> {
        let request = AnnounceRequest { handle, length };
        check_reply(
            bounded(
                self.call_timeout,
                "UploadAnnounce",
                self.client.upload_announce(request),
            )
            .await?,
        )
    }

    async fn download(&mut self, handle: u64, length: u64) -> Result<Vec<u8>, ChannelError> {
        let request = DownloadRequest { handle, length };
        let reply = bounded(self.call_timeout, "Download", self.client.download(request)).await?;
        if reply.data.len() as u64 != length {
            return Err(ChannelError::Remote {
                status: -1,
                message: format!("expected {} bytes, got {}", length, reply.data.len()),
            });
        }
        Ok(reply.data)
    }

    async fn download_announce(&mut self, handle: u64, length: u64) -> Result<(), ChannelError> {
        let request = AnnounceRequest { handle, length };
        check_reply(
            bounded(
                self.call_timeout,
                "DownloadAnnounce",
                self.client.download_announce(request),
            )
            .await?,
        )
    }

    async fn run(&mut self, model: u64, ifm: u64, ofm: u64) -> Result<RunStatus, ChannelError> {
        let request = RunRequest { model, ifm, ofm };
        let reply = bounded(self.call_timeout, "Run", self.client.run(request)).await?;
        Ok(RunStatus {
            status: reply.status,
            elapsed_us: reply.elapsed_us,
        })
    }

    async fn run_batch(&mut self, batch: &BatchRun) -> Result<RunStatus, ChannelError> {
        let request = RunBatchRequest {
            model: batch.model,
            batch_size: batch.batch_size as u32,
            ifms: batch.ifms.clone(),
            ifm_size: batch.ifm_size,
            ofms: batch.ofms.clone(),
            ofm_size: batch.ofm_size,
        };
        let reply = bounded(self.call_timeout, "RunBatch", self.client.run_batch(request)).await?;
        Ok(RunStatus {
            status: reply.status,
            elapsed_us: reply.elapsed_us,
        })
    }

    async fn free(&mut self, kind: HandleKind, handle: u64) -> Result<(), ChannelError> {
        let request = FreeRequest {
            kind: buffer_kind(kind) as i32,
            handle,
        };
        check_reply(bounded(self.call_timeout, "Free", self.client.free(request)).await?)
    }

    async fn create_virtual_env(&mut self, name: &str) -> Result<(), ChannelError> {
        let request = VirtualEnvRequest {
            name: name.to_string(),
        };
        let reply = bounded(
            self.call_timeout,
            "CreateVirtualEnv",
            self.client.create_virtual_env(request),
        )
        .await?;
        if reply.status != 0 {
            return Err(ChannelError::Remote {
                status: reply.status,
                message: reply.stderr,
            });
        }
        Ok(())
    }

    async fn delete_virtual_env(&mut self, name: &str) -> Result<(), ChannelError> {
        let request = VirtualEnvRequest {
            name: name.to_string(),
        };
        check_reply(
            bounded(
                self.call_timeout,
                "DeleteVirtualEnv",
                self.client.delete_virtual_env(request),
            )
            .await?,
        )
    }

    async fn run_remote_script(
        &mut self,
        request: &ScriptRequest,
    ) -> Result<ScriptOutput, ChannelError> {
        let limit = request.timeout.saturating_add(self.call_timeout);
        let request = mla_proto::ScriptRequest {
            command: request.command.clone(),
            artifact: request.artifact.clone(),
            timeout_secs: request.timeout.as_secs(),
            virtual_env: request.virtual_env.clone(),
        };
        let reply = bounded(limit, "RunRemoteScript", self.client.run_remote_script(request)).await?;
        Ok(ScriptOutput {
            status: reply.status,
            stdout: reply.stdout,
            stderr: reply.stderr,
            timed_out: false,
        })
    }

    async fn run_pipeline(
        &mut self,
        frames: Vec<FrameData>,
    ) -> Result<Option<FrameData>, ChannelError> {
        let request = PipelineRequest {
            frames: frames.into_iter().map(encode_frame).collect(),
        };
        let reply = bounded(self.call_timeout, "RunPipeline", self.client.run_pipeline(request)).await?;
        reply.output.map(decode_frame).transpose()
    }

    async fn pipeline_free_model(&mut self) -> Result<(), ChannelError> {
        check_reply(
            bounded(
                self.call_timeout,
                "PipelineFreeModel",
                self.client.pipeline_free_model(Empty {}),
            )
            .await?,
        )
    }

    async fn pipeline_free_frames(&mut self) -> Result<(), ChannelError> {
        check_reply(
            bounded(
                self.call_timeout,
                "PipelineFreeFrames",
                self.client.pipeline_free_frames(Empty {}),
            )
            .await?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, SessionError};
    use crate::session::RemoteSession;
    use tokio::net::TcpListener;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status(Status::unavailable("connection reset")),
            ChannelError::Closed(_)
        ));
        assert!(matches!(
            map_status(Status::deadline_exceeded("slow")),
            ChannelError::Timeout(_)
        ));
        assert!(matches!(
            map_status(Status::unknown("transport error")),
            ChannelError::Closed(_)
        ));
        assert!(matches!(
            map_status(Status::not_found("model.lm")),
            ChannelError::Remote { .. }
        ));
    }

    #[test]
    fn test_frame_encoding_is_little_endian() {
        let frame = FrameData {
            shape: vec![1, 2],
            data: vec![1.0, -2.5],
        };
        let encoded = encode_frame(frame.clone());
        assert_eq!(encoded.shape, vec![1, 2]);
        assert_eq!(&encoded.data[..4], &1.0f32.to_le_bytes());

        let decoded = decode_frame(encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_truncated_frame_is_rejected() {
        let frame = TensorFrame {
            shape: vec![2, 2],
            data: vec![0; 8],
        };
        assert!(decode_frame(frame).is_err());
    }

    #[tokio::test]
    async fn test_silent_endpoint_fails_connect_within_deadline() {
        // Accepts TCP and then never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let link = GrpcLink::new("127.0.0.1", port)
            .with_connect_timeout(Duration::from_secs(1))
            .with_call_timeout(Duration::from_millis(200));
        let result = timeout(Duration::from_secs(10), RemoteSession::connect(link)).await;
        server.abort();

        let error = result.expect("connect must not hang").err().unwrap();
        assert!(
            matches!(error, SessionError::ConnectFailed { .. }),
            "unexpected error: {}",
            error
        );
        assert_eq!(error.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_slow_call_maps_to_timeout() {
        let result: Result<(), ChannelError> = bounded(
            Duration::from_millis(20),
            "Run",
            std::future::pending::<Result<Response<()>, Status>>(),
        )
        .await;
        assert!(matches!(result, Err(ChannelError::Timeout(_))));
    }

    #[test]
    fn test_zero_handle_is_a_refusal() {
        let reply = HandleReply {
            handle: 0,
            message: "no memory".into(),
        };
        assert_eq!(
            check_handle(reply),
            Err(ChannelError::Remote {
                status: -1,
                message: "no memory".into()
            })
        );
    }
}
