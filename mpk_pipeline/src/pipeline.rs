use crate::error::GraphError;
use crate::graph::PluginGraph;
use crate::tensor::{Tensor, Value};
use mla_client::{Direction, ModelHandle, RemoteBuffer, RemoteSession, SessionError};
use std::time::{Duration, Instant};

/// Where the time of one inference cycle went.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CycleTimings {
    pub preprocess: Duration,
    pub upload: Duration,
    /// As measured by the device.
    pub device: Duration,
    pub download: Duration,
    pub postprocess: Duration,
}

impl CycleTimings {
    pub fn total(&self) -> Duration {
        self.preprocess + self.upload + self.device + self.download + self.postprocess
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inference {
    pub output: Value,
    pub timings: CycleTimings,
}

/// Runs the manifest graph around one loaded model: pre-processing on the
/// host, the accelerator on the device, post-processing on the host.
pub struct PrePostPipeline {
    session: RemoteSession,
    graph: PluginGraph,
    model: Option<ModelHandle>,
    ifm: Option<RemoteBuffer>,
    ofm: Option<RemoteBuffer>,
}

impl PrePostPipeline {
    /// Takes a session already bound in direct mode. On failure everything
    /// acquired here is freed and the session is released.
    pub async fn open(
        mut session: RemoteSession,
        model_path: &str,
        graph: PluginGraph,
    ) -> Result<Self, GraphError> {
        let model = match session.load_model(model_path, graph.contract()).await {
            Ok(model) => model,
            Err(e) => {
                session.release().await;
                return Err(e.into());
            }
        };

        let ifm = match session.allocate(Direction::Input, graph.ifm_size()).await {
            Ok(ifm) => ifm,
            Err(e) => {
                session.free_model(model).await;
                session.release().await;
                return Err(e.into());
            }
        };

        let ofm = match session.allocate(Direction::Output, graph.ofm_size()).await {
            Ok(ofm) => ofm,
            Err(e) => {
                tracing::error!("Failed to allocate OFM: {}", e);
                session.free(ifm).await;
                session.free_model(model).await;
                session.release().await;
                return Err(e.into());
            }
        };

        tracing::info!(
            "Pipeline ready on {}: ifm {} bytes, ofm {} bytes",
            session.endpoint(),
            graph.ifm_size(),
            graph.ofm_size()
        );
        Ok(Self {
            session,
            graph,
            model: Some(model),
            ifm: Some(ifm),
            ofm: Some(ofm),
        })
    }

    pub fn graph(&self) -> &PluginGraph {
        &self.graph
    }

    pub fn session(&self) -> &RemoteSession {
        &self.session
    }

    /// Uploads `ifm`, runs the model and downloads the raw OFM bytes.
    pub async fn run_accelerator(
        &mut self,
        ifm_bytes: &[u8],
        timings: &mut CycleTimings,
    ) -> Result<Vec<u8>, GraphError> {
        let ofm_size = self.graph.ofm_size();
        let (model, ifm, ofm) = match (&self.model, &self.ifm, &self.ofm) {
            (Some(model), Some(ifm), Some(ofm)) => (model, ifm, ofm),
            _ => {
                return Err(GraphError::Session(SessionError::InvalidState {
                    op: "run_accelerator",
                    state: self.session.state(),
                }))
            }
        };

        let start = Instant::now();
        self.session.upload(ifm, ifm_bytes).await?;
        timings.upload = start.elapsed();

        let report = self.session.run(model, ifm, ofm).await?;
        timings.device = report.elapsed;

        let start = Instant::now();
        let bytes = self.session.download(ofm, ofm_size).await?;
        timings.download = start.elapsed();
        Ok(bytes)
    }

    pub async fn infer(&mut self, frame: Tensor) -> Result<Inference, GraphError> {
        let mut timings = CycleTimings::default();

        let start = Instant::now();
        let ifm = self.graph.preprocess(frame)?.to_bytes();
        timings.preprocess = start.elapsed();

        let ofm = self.run_accelerator(&ifm, &mut timings).await?;

        let start = Instant::now();
        let output = self.graph.postprocess(&ofm)?;
        timings.postprocess = start.elapsed();

        tracing::debug!("Cycle done in {:?}: {}", timings.total(), output.shape_summary());
        Ok(Inference { output, timings })
    }

    /// Frees the buffers and the model, then releases the session. Safe to
    /// call more than once.
    pub async fn release(&mut self) {
        if let Some(ofm) = self.ofm.take() {
            self.session.free(ofm).await;
        }
        if let Some(ifm) = self.ifm.take() {
            self.session.free(ifm).await;
        }
        if let Some(model) = self.model.take() {
            self.session.free_model(model).await;
        }
        self.session.release().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use crate::registry::TransformRegistry;
    use mla_client::{DeviceBinding, LoopbackDevice, SessionState, TransferMode};
    use ndarray::{ArrayD, IxDyn};

    const MANIFEST: &str = r#"{
        "plugins": [
            {"processor": "EV74", "config_params": {"kernel": "quantization_transform",
                "params": {"channel_params": [[0.5, 0]], "num_bits": 8}},
             "input_nodes": [{"name": "frame", "size": 64}],
             "output_nodes": [{"name": "ifm", "size": 16}]},
            {"processor": "MLA", "config_params": {"kernel": "mla"},
             "input_nodes": [{"name": "ifm", "size": 16}],
             "output_nodes": [{"name": "ofm", "size": 8}]},
            {"processor": "EV74", "config_params": {"kernel": "dequantization_transform",
                "params": {"channel_params": [[0.5, 0]]}},
             "input_nodes": [{"name": "ofm", "size": 8}],
             "output_nodes": [{"name": "scores", "size": 32}]}
        ]
    }"#;

    async fn bound_session(device: &LoopbackDevice) -> RemoteSession {
        device.stage_file("/home/sima/model.lm");
        let mut session = RemoteSession::connect(device.clone()).await.unwrap();
        session
            .bind_device(DeviceBinding::Direct {
                layer_stats: None,
                transfer: TransferMode::Bulk,
            })
            .await
            .unwrap();
        session
    }

    fn graph() -> PluginGraph {
        let manifest = Manifest::from_json(MANIFEST).unwrap();
        PluginGraph::from_manifest(&manifest, TransformRegistry::default()).unwrap()
    }

    #[tokio::test]
    async fn test_infer_runs_pre_accelerator_post() {
        let device = LoopbackDevice::new();
        device.set_elapsed_us(2_000_000.0);
        let session = bound_session(&device).await;
        let mut pipeline = PrePostPipeline::open(session, "model.lm", graph()).await.unwrap();

        let frame = ArrayD::from_shape_vec(IxDyn(&[1, 2, 2, 4]), (0..16).map(|v| v as f32).collect())
            .unwrap();
        let inference = pipeline.infer(Tensor::F32(frame)).await.unwrap();

        // The loopback device copies the first OFM-size bytes of the IFM.
        let expected = ArrayD::from_shape_vec(IxDyn(&[8]), (0..8).map(|v| v as f32).collect())
            .unwrap();
        assert_eq!(inference.output, Value::Tensor(Tensor::F32(expected)));
        assert_eq!(inference.timings.device, Duration::from_secs(2));
        assert_eq!(device.bulk_bytes(), 16 + 8);

        pipeline.release().await;
        pipeline.release().await;
        assert_eq!(device.live_handles(), 0);
        assert_eq!(pipeline.session().state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_ofm_allocation_cleans_up() {
        let device = LoopbackDevice::new();
        device.fail_allocations_after(1);
        let session = bound_session(&device).await;

        let error = PrePostPipeline::open(session, "model.lm", graph())
            .await
            .err()
            .unwrap();

        assert_eq!(error.kind(), mla_client::ErrorKind::Remote);
        assert_eq!(device.live_handles(), 0);
        assert_eq!(device.calls_to("free"), 2);
    }

    #[tokio::test]
    async fn test_kernel_failure_surfaces_as_kernel_error() {
        let device = LoopbackDevice::new();
        let session = bound_session(&device).await;
        let mut pipeline = PrePostPipeline::open(session, "model.lm", graph()).await.unwrap();

        let error = pipeline
            .infer(Tensor::I8(ArrayD::zeros(IxDyn(&[1, 2, 2, 4]))))
            .await
            .err()
            .unwrap();
        assert_eq!(error.kind(), mla_client::ErrorKind::Kernel);
        assert_eq!(device.calls_to("run"), 0);
        pipeline.release().await;
    }
}
