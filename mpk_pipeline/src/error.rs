use mla_client::{ErrorKind, SessionError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Manifest is empty")]
    EmptyManifest,
    #[error("Malformed manifest: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{0} is not a supported processor. Use either `EV74` or `MLA`.")]
    UnknownProcessor(String),
    #[error("Manifest attribute missing: {0}")]
    MissingAttribute(String),
}

/// Failure raised inside one transform kernel.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("missing parameter `{0}`")]
    MissingParameter(String),
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("unsupported input: {0}")]
    UnsupportedInput(String),
    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum GraphError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("Manifest has no MLA node")]
    MissingAcceleratorNode,
    #[error("Manifest has {0} MLA nodes, exactly one is required")]
    DuplicateAcceleratorNode(usize),
    #[error("Kernel {0} is not implemented")]
    UnknownKernel(String),
    #[error("Kernel {kernel} needs parameter `{param}`, which the manifest does not provide")]
    MissingParameter { kernel: String, param: String },
    #[error("Kernel {kernel} declares {outputs} outputs, only unpack_transform may fan out")]
    MultipleOutputs { kernel: String, outputs: usize },
    #[error("Kernel {kernel} declares no {what} nodes")]
    MissingNodes { kernel: String, what: &'static str },
    #[error("Kernel {kernel} produced {got} outputs, manifest declares {expected}")]
    OutputCountMismatch {
        kernel: String,
        expected: usize,
        got: usize,
    },
    #[error("Input node {0} does not name any live output")]
    UnresolvedInput(String),
    #[error("Output table is inconsistent after post-processing: {0}")]
    InconsistentOutputs(String),
    #[error("Pre-processing must end in a single tensor, got {0}")]
    NotATensor(String),
    #[error("Accelerator returned no output bytes")]
    EmptyOutput,
    #[error("Failed to execute {kernel}, with params {params}, data shape {shape}: {source}")]
    Kernel {
        kernel: String,
        params: String,
        shape: String,
        #[source]
        source: KernelError,
    },
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl GraphError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::Session(e) => e.kind(),
            GraphError::Kernel { .. } | GraphError::NotATensor(_) => ErrorKind::Kernel,
            GraphError::EmptyOutput => ErrorKind::Remote,
            _ => ErrorKind::Configuration,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum DetectionError {
    #[error("Expected {expected}, got shape {shape:?}")]
    Shape {
        expected: &'static str,
        shape: Vec<usize>,
    },
    #[error("Outputs hold {got} anchors, image size {img_size:?} needs {expected}")]
    AnchorCount {
        img_size: (usize, usize),
        expected: usize,
        got: usize,
    },
}
