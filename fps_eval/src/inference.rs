use crate::config::{DetectionConfig, EvalMode, ModelConfig};
use mla_client::{
    BufferArray, DeviceBinding, Direction, ErrorKind, FrameData, ModelContract, ModelHandle,
    RemoteSession, SessionError,
};
use mpk_pipeline::{
    flatten_outputs, yolox_detections, DetectionError, GraphError, Manifest, ManifestError,
    MpkAttributes, PluginGraph, PrePostPipeline, Tensor, TransformRegistry,
};
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EvalError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl EvalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EvalError::Session(e) => e.kind(),
            EvalError::Graph(e) => e.kind(),
            EvalError::Detection(_) => ErrorKind::Kernel,
            EvalError::Manifest(_) | EvalError::Config(_) => ErrorKind::Configuration,
        }
    }
}

/// Outcome of one evaluation cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cycle {
    pub frames: u64,
    pub elapsed: Duration,
    pub detections: Option<usize>,
}

fn random_frame(shape: [usize; 4]) -> ArrayD<f32> {
    let mut rng = rand::rng();
    ArrayD::from_shape_simple_fn(IxDyn(&shape), || rng.random::<f32>())
}

fn random_payloads(count: usize, len: u64) -> Vec<Vec<u8>> {
    let mut rng = rand::rng();
    (0..count)
        .map(|_| {
            let mut payload = vec![0u8; len as usize];
            rng.fill(payload.as_mut_slice());
            payload
        })
        .collect()
}

/// Batched accelerator runs on pre-allocated, pre-filled buffers; FPS from
/// the device-side run time.
pub struct MlaOnlyEval {
    session: RemoteSession,
    model: Option<ModelHandle>,
    ifms: Option<BufferArray>,
    ofms: Option<BufferArray>,
    batch_size: usize,
}

impl MlaOnlyEval {
    pub async fn open(
        mut session: RemoteSession,
        config: &ModelConfig,
        attributes: &MpkAttributes,
    ) -> Result<Self, EvalError> {
        match Self::setup(&mut session, config, attributes).await {
            Ok((model, ifms, ofms)) => Ok(Self {
                session,
                model: Some(model),
                ifms: Some(ifms),
                ofms: Some(ofms),
                batch_size: config.batch_size,
            }),
            Err(e) => {
                session.release().await;
                Err(e)
            }
        }
    }

    async fn setup(
        session: &mut RemoteSession,
        config: &ModelConfig,
        attributes: &MpkAttributes,
    ) -> Result<(ModelHandle, BufferArray, BufferArray), EvalError> {
        session
            .bind_device(DeviceBinding::Direct {
                layer_stats: config.layer_stats.clone(),
                transfer: config.transfer.into(),
            })
            .await?;

        let contract = ModelContract {
            ifm_size: attributes.ifm_size,
            ofm_size: attributes.ofm_size,
            batch_size: attributes.batch_size,
        };
        let model = session.load_model(&config.model_file, contract).await?;

        let ifm_size = attributes.ifm_size_per_frame();
        let ofm_size = attributes.ofm_size_per_frame();
        let ifms = session
            .allocate_array(Direction::Input, ifm_size, config.batch_size)
            .await?;
        let ofms = session
            .allocate_array(Direction::Output, ofm_size, config.batch_size)
            .await?;

        session
            .upload_array(&ifms, &random_payloads(config.batch_size, ifm_size))
            .await?;
        tracing::info!(
            "MLA-only evaluation ready: batch {}, ifm {} bytes, ofm {} bytes per frame",
            config.batch_size,
            ifm_size,
            ofm_size
        );
        Ok((model, ifms, ofms))
    }

    pub async fn cycle(&mut self) -> Result<Cycle, EvalError> {
        let (Some(model), Some(ifms), Some(ofms)) = (&self.model, &self.ifms, &self.ofms) else {
            return Err(EvalError::Config("evaluation already released".into()));
        };
        let report = self
            .session
            .run_batch(model, ifms, ofms, self.batch_size)
            .await?;
        Ok(Cycle {
            frames: self.batch_size as u64,
            elapsed: report.elapsed,
            detections: None,
        })
    }

    pub async fn release(&mut self) {
        if let Some(ofms) = self.ofms.take() {
            self.session.free_array(ofms).await;
        }
        if let Some(ifms) = self.ifms.take() {
            self.session.free_array(ifms).await;
        }
        if let Some(model) = self.model.take() {
            self.session.free_model(model).await;
        }
        self.session.release().await;
    }
}

/// MLA plus A65 pipeline, one synthetic frame per cycle, wall-clock timed.
pub struct PipelinedEval {
    session: RemoteSession,
    frame_shape: [usize; 4],
}

impl PipelinedEval {
    pub async fn open(mut session: RemoteSession, config: &ModelConfig) -> Result<Self, EvalError> {
        let bound = session
            .bind_device(DeviceBinding::Pipelined {
                archive: config.model_file.clone(),
            })
            .await;
        if let Err(e) = bound {
            session.release().await;
            return Err(e.into());
        }
        Ok(Self {
            session,
            frame_shape: config.frame_shape(),
        })
    }

    pub async fn cycle(&mut self) -> Result<Cycle, EvalError> {
        let frame = FrameData {
            shape: self.frame_shape.to_vec(),
            data: random_frame(self.frame_shape).into_raw_vec_and_offset().0,
        };

        let start = Instant::now();
        let output = self.session.run_pipeline(vec![frame]).await?;
        let elapsed = start.elapsed();
        if output.is_none() {
            tracing::debug!("Pipeline returned no output frame");
        }
        Ok(Cycle {
            frames: 1,
            elapsed,
            detections: None,
        })
    }

    pub async fn release(&mut self) {
        self.session.free_pipeline_frames().await;
        self.session.free_pipeline_model().await;
        self.session.release().await;
    }
}

/// Manifest graph on the host around the accelerator, optionally decoding
/// YOLOX detections.
pub struct PrePostEval {
    pipeline: PrePostPipeline,
    frame_shape: [usize; 4],
    detection: DetectionConfig,
}

impl PrePostEval {
    pub async fn open(
        mut session: RemoteSession,
        config: &ModelConfig,
        detection: &DetectionConfig,
        graph: PluginGraph,
    ) -> Result<Self, EvalError> {
        let bound = session
            .bind_device(DeviceBinding::Direct {
                layer_stats: None,
                transfer: config.transfer.into(),
            })
            .await;
        if let Err(e) = bound {
            session.release().await;
            return Err(e.into());
        }

        let pipeline = PrePostPipeline::open(session, &config.model_file, graph).await?;
        Ok(Self {
            pipeline,
            frame_shape: config.frame_shape(),
            detection: detection.clone(),
        })
    }

    pub async fn cycle(&mut self) -> Result<Cycle, EvalError> {
        let frame = Tensor::F32(random_frame(self.frame_shape));
        let inference = self.pipeline.infer(frame).await?;

        let detections = if self.detection.enabled {
            let outputs = flatten_outputs(&inference.output.into_tensors())?;
            let detections = yolox_detections(
                &outputs,
                self.detection.img_size(),
                self.detection.nms_thr,
                self.detection.score_thr,
            )?;
            tracing::debug!("Decoded {} detections", detections.len());
            Some(detections.len())
        } else {
            None
        };

        Ok(Cycle {
            frames: 1,
            elapsed: inference.timings.total(),
            detections,
        })
    }

    pub async fn release(&mut self) {
        self.pipeline.release().await;
    }
}

/// Everything a mode takes from the manifest, checked before the device is
/// touched.
pub enum EvalPlan {
    MlaOnly(MpkAttributes),
    Pipelined,
    PrePost(PluginGraph),
}

impl EvalPlan {
    pub fn from_config(config: &ModelConfig) -> Result<Self, EvalError> {
        let manifest = match (config.eval_mode(), &config.mpk_manifest) {
            (EvalMode::Pipelined, _) => return Ok(Self::Pipelined),
            (_, Some(path)) => Manifest::from_path(path)?,
            (_, None) => return Err(EvalError::Config("mpk_manifest is not set".into())),
        };
        Self::from_manifest(config, &manifest)
    }

    pub fn from_manifest(config: &ModelConfig, manifest: &Manifest) -> Result<Self, EvalError> {
        match config.eval_mode() {
            EvalMode::Pipelined => Ok(Self::Pipelined),
            EvalMode::MlaOnly => {
                let attributes = MpkAttributes::from_manifest(manifest)?;
                if config.batch_size != attributes.batch_size {
                    return Err(SessionError::BatchSizeMismatch {
                        requested: config.batch_size,
                        expected: attributes.batch_size,
                    }
                    .into());
                }
                Ok(Self::MlaOnly(attributes))
            }
            EvalMode::Prepost => Ok(Self::PrePost(PluginGraph::from_manifest(
                manifest,
                TransformRegistry::default(),
            )?)),
        }
    }
}

pub enum Evaluator {
    MlaOnly(MlaOnlyEval),
    Pipelined(PipelinedEval),
    PrePost(PrePostEval),
}

impl Evaluator {
    pub async fn open(
        session: RemoteSession,
        config: &ModelConfig,
        detection: &DetectionConfig,
        plan: EvalPlan,
    ) -> Result<Self, EvalError> {
        tracing::info!(
            "Opening {:?} evaluation of {}",
            config.eval_mode(),
            config.model_file
        );
        match plan {
            EvalPlan::Pipelined => Ok(Self::Pipelined(PipelinedEval::open(session, config).await?)),
            EvalPlan::MlaOnly(attributes) => Ok(Self::MlaOnly(
                MlaOnlyEval::open(session, config, &attributes).await?,
            )),
            EvalPlan::PrePost(graph) => Ok(Self::PrePost(
                PrePostEval::open(session, config, detection, graph).await?,
            )),
        }
    }

    /// Layer stats are collected from a single run.
    pub fn single_shot(config: &ModelConfig) -> bool {
        config.eval_mode() == EvalMode::MlaOnly && config.layer_stats.is_some()
    }

    pub async fn cycle(&mut self) -> Result<Cycle, EvalError> {
        match self {
            Evaluator::MlaOnly(eval) => eval.cycle().await,
            Evaluator::Pipelined(eval) => eval.cycle().await,
            Evaluator::PrePost(eval) => eval.cycle().await,
        }
    }

    pub async fn release(&mut self) {
        match self {
            Evaluator::MlaOnly(eval) => eval.release().await,
            Evaluator::Pipelined(eval) => eval.release().await,
            Evaluator::PrePost(eval) => eval.release().await,
        }
    }
}
