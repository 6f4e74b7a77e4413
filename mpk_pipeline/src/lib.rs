pub mod detection;
pub mod error;
pub mod graph;
pub mod kernels;
pub mod manifest;
pub mod pipeline;
pub mod registry;
pub mod tensor;

pub use detection::{
    decode_outputs, flatten_outputs, heatmap_topk, multiclass_nms, yolox_detections, Detection,
    Letterbox,
};
pub use error::{DetectionError, GraphError, KernelError, ManifestError};
pub use graph::{PluginGraph, PluginNode};
pub use manifest::{Manifest, MpkAttributes, Processor};
pub use pipeline::{CycleTimings, Inference, PrePostPipeline};
pub use registry::{KernelArgs, KernelSpec, TransformRegistry, PASS_THROUGH};
pub use tensor::{Tensor, Value};
