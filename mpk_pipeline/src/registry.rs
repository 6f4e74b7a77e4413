use crate::error::{GraphError, KernelError};
use crate::kernels;
use crate::tensor::{Tensor, Value};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;

/// Kernel name that marks an identity node.
pub const PASS_THROUGH: &str = "pass_through";

/// Parameter names that receive the live tensor instead of a manifest value.
pub const DATA_KEYS: [&str; 3] = ["data", "frames", "q_frames"];

/// Arguments bound for one kernel call.
pub struct KernelArgs {
    pub data: Value,
    params: Map<String, JsonValue>,
}

impl KernelArgs {
    pub fn new(data: Value, params: Map<String, JsonValue>) -> Self {
        Self { data, params }
    }

    pub fn param<T: DeserializeOwned>(&self, name: &str) -> Result<T, KernelError> {
        let value = self
            .params
            .get(name)
            .ok_or_else(|| KernelError::MissingParameter(name.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|e| KernelError::InvalidParameter {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn tensor(&self) -> Result<&Tensor, KernelError> {
        self.data.as_tensor().ok_or_else(|| {
            KernelError::UnsupportedInput(format!(
                "expected a single tensor, got {}",
                self.data.shape_summary()
            ))
        })
    }
}

pub type KernelFn = fn(KernelArgs) -> Result<Value, KernelError>;

#[derive(Clone, Copy)]
pub struct KernelSpec {
    pub name: &'static str,
    /// Ordered parameter names; data keys receive the tensor.
    pub params: &'static [&'static str],
    /// Skips the promotion of 3-D inputs to a batch of one.
    pub accepts_unbatched: bool,
    pub func: KernelFn,
}

impl std::fmt::Debug for KernelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSpec")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("accepts_unbatched", &self.accepts_unbatched)
            .finish()
    }
}

impl KernelSpec {
    pub fn static_params(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.params
            .iter()
            .copied()
            .filter(|name| !DATA_KEYS.contains(name))
    }
}

/// Maps kernel names to their implementation and parameter contract.
#[derive(Debug, Clone)]
pub struct TransformRegistry {
    kernels: HashMap<&'static str, KernelSpec>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for spec in kernels::reference_kernels() {
            registry.register(spec);
        }
        registry
    }
}

impl TransformRegistry {
    pub fn empty() -> Self {
        Self {
            kernels: HashMap::new(),
        }
    }

    pub fn register(&mut self, spec: KernelSpec) {
        self.kernels.insert(spec.name, spec);
    }

    pub fn get(&self, kernel: &str) -> Result<&KernelSpec, GraphError> {
        self.kernels
            .get(kernel)
            .ok_or_else(|| GraphError::UnknownKernel(kernel.to_string()))
    }

    /// Checks that the parameter bag covers every static parameter.
    pub fn check_params(
        &self,
        spec: &KernelSpec,
        params: &Map<String, JsonValue>,
    ) -> Result<(), GraphError> {
        match spec.static_params().find(|name| !params.contains_key(*name)) {
            Some(missing) => Err(GraphError::MissingParameter {
                kernel: spec.name.to_string(),
                param: missing.to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn invoke(
        &self,
        spec: &KernelSpec,
        params: &Map<String, JsonValue>,
        data: Value,
    ) -> Result<Value, GraphError> {
        self.check_params(spec, params)?;

        let data = match data {
            Value::Tensor(tensor) if tensor.ndim() == 3 && !spec.accepts_unbatched => {
                Value::Tensor(tensor.insert_batch_axis())
            }
            other => other,
        };
        let shape = data.shape_summary();
        let bound: Map<String, JsonValue> = spec
            .static_params()
            .filter_map(|name| params.get(name).map(|v| (name.to_string(), v.clone())))
            .collect();

        tracing::trace!("Running {} on {}", spec.name, shape);
        (spec.func)(KernelArgs::new(data, bound)).map_err(|source| GraphError::Kernel {
            kernel: spec.name.to_string(),
            params: JsonValue::Object(params.clone()).to_string(),
            shape,
            source,
        })
    }
}
