use crate::error::GraphError;
use crate::manifest::{Manifest, NodeDesc, Processor};
use crate::registry::{KernelSpec, TransformRegistry, PASS_THROUGH};
use crate::tensor::{Tensor, Value};
use mla_client::ModelContract;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;

const UNPACK: &str = "unpack_transform";

/// One manifest plugin with its kernel resolved.
#[derive(Debug, Clone)]
pub struct PluginNode {
    pub position: usize,
    pub processor: Processor,
    pub kernel: String,
    pub params: Map<String, JsonValue>,
    pub inputs: Vec<NodeDesc>,
    pub outputs: Vec<NodeDesc>,
    spec: Option<KernelSpec>,
}

impl PluginNode {
    pub fn is_pass_through(&self) -> bool {
        self.kernel == PASS_THROUGH
    }

    fn label(&self) -> String {
        format!("{} (plugin {})", self.kernel, self.position)
    }
}

/// Live outputs of the post-processing pass, keyed by output-node name.
///
/// Every name maps to exactly one filled slot and every filled slot has
/// exactly one name.
struct NodeOutputTable<V> {
    names: HashMap<String, usize>,
    slots: Vec<Option<V>>,
}

impl<V> NodeOutputTable<V> {
    fn new(name: &str, value: V) -> Self {
        Self {
            names: HashMap::from([(name.to_string(), 0)]),
            slots: vec![Some(value)],
        }
    }

    fn take_slot(&mut self, slot: usize, name: &str) -> Result<V, GraphError> {
        self.slots
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or_else(|| GraphError::InconsistentOutputs(format!("{} names an empty slot", name)))
    }

    /// Hands the accelerator output to the first post-processing node.
    fn take_initial(&mut self) -> Result<(usize, V), GraphError> {
        self.names.retain(|_, slot| *slot != 0);
        Ok((0, self.take_slot(0, "accelerator output")?))
    }

    fn take(&mut self, name: &str) -> Result<(usize, V), GraphError> {
        let slot = self
            .names
            .remove(name)
            .ok_or_else(|| GraphError::UnresolvedInput(name.to_string()))?;
        Ok((slot, self.take_slot(slot, name)?))
    }

    fn put(&mut self, slot: usize, name: &str, value: V) {
        self.slots[slot] = Some(value);
        self.names.insert(name.to_string(), slot);
    }

    fn push(&mut self, name: &str, value: V) {
        self.slots.push(Some(value));
        self.names.insert(name.to_string(), self.slots.len() - 1);
    }

    fn check(&self) -> Result<(), GraphError> {
        let filled = self.slots.iter().filter(|slot| slot.is_some()).count();
        if filled != self.names.len() {
            return Err(GraphError::InconsistentOutputs(format!(
                "{} names for {} outputs",
                self.names.len(),
                filled
            )));
        }
        match self
            .names
            .iter()
            .find(|(_, &slot)| !matches!(self.slots.get(slot), Some(Some(_))))
        {
            Some((name, _)) => Err(GraphError::InconsistentOutputs(format!(
                "{} has no value",
                name
            ))),
            None => Ok(()),
        }
    }

    fn into_values(self) -> Vec<V> {
        self.slots.into_iter().flatten().collect()
    }
}

/// Output names of pass-through nodes, mapped to the input they forward.
/// Pass-through nodes never touch the output table.
#[derive(Debug, Default)]
struct PassThroughAliases(HashMap<String, String>);

impl PassThroughAliases {
    fn record(&mut self, node: &PluginNode) {
        if let (Some(input), Some(output)) = (node.inputs.first(), node.outputs.first()) {
            self.0.insert(output.name.clone(), input.name.clone());
        }
    }

    /// Follows pass-through hops until a name the table holds.
    fn resolve<'a, V>(&'a self, table: &NodeOutputTable<V>, mut name: &'a str) -> &'a str {
        for _ in 0..=self.0.len() {
            if table.names.contains_key(name) {
                break;
            }
            match self.0.get(name) {
                Some(input) => name = input,
                None => break,
            }
        }
        name
    }
}

/// Executable form of an MPK manifest: pre-processing nodes, the single
/// accelerator node and post-processing nodes, in manifest order.
#[derive(Debug, Clone)]
pub struct PluginGraph {
    registry: TransformRegistry,
    preprocess: Vec<PluginNode>,
    accelerator: PluginNode,
    postprocess: Vec<PluginNode>,
    batch_size: usize,
}

impl PluginGraph {
    pub fn from_manifest(
        manifest: &Manifest,
        registry: TransformRegistry,
    ) -> Result<Self, GraphError> {
        let mut nodes = Vec::with_capacity(manifest.plugins.len());
        for (position, plugin) in manifest.plugins.iter().enumerate() {
            nodes.push(PluginNode {
                position,
                processor: plugin.processor()?,
                kernel: plugin.kernel().to_string(),
                params: plugin.config_params.params.clone(),
                inputs: plugin.input_nodes.clone(),
                outputs: plugin.output_nodes.clone(),
                spec: None,
            });
        }

        let accelerators: Vec<usize> = nodes
            .iter()
            .filter(|node| node.processor == Processor::Mla)
            .map(|node| node.position)
            .collect();
        let mla_position = match accelerators.as_slice() {
            [] => return Err(GraphError::MissingAcceleratorNode),
            [position] => *position,
            many => return Err(GraphError::DuplicateAcceleratorNode(many.len())),
        };

        let postprocess = nodes.split_off(mla_position + 1);
        let accelerator = nodes.pop().ok_or(GraphError::MissingAcceleratorNode)?;
        let preprocess = nodes;

        for (what, list) in [("input", &accelerator.inputs), ("output", &accelerator.outputs)] {
            if list.is_empty() {
                return Err(GraphError::MissingNodes {
                    kernel: accelerator.label(),
                    what,
                });
            }
        }

        let mut graph = Self {
            batch_size: manifest.plugins[mla_position]
                .config_params
                .actual_batch_size
                .unwrap_or(1)
                .max(1),
            registry,
            preprocess,
            accelerator,
            postprocess,
        };
        graph.resolve_kernels()?;
        graph.walk_postprocess((), |node, ()| Ok(vec![(); node.outputs.len()]))?;

        tracing::debug!(
            "Plugin graph ready: {} pre-processing, {} post-processing nodes",
            graph.preprocess.len(),
            graph.postprocess.len()
        );
        Ok(graph)
    }

    fn resolve_kernels(&mut self) -> Result<(), GraphError> {
        let registry = &self.registry;
        let first_post = self
            .postprocess
            .iter()
            .position(|node| !node.is_pass_through());

        for node in self.preprocess.iter_mut() {
            Self::resolve_node(registry, node)?;
        }
        for (index, node) in self.postprocess.iter_mut().enumerate() {
            Self::resolve_node(registry, node)?;
            if node.is_pass_through() {
                continue;
            }
            if node.outputs.is_empty() {
                return Err(GraphError::MissingNodes {
                    kernel: node.label(),
                    what: "output",
                });
            }
            if Some(index) != first_post && node.inputs.is_empty() {
                return Err(GraphError::MissingNodes {
                    kernel: node.label(),
                    what: "input",
                });
            }
        }
        Ok(())
    }

    fn resolve_node(registry: &TransformRegistry, node: &mut PluginNode) -> Result<(), GraphError> {
        if node.is_pass_through() {
            return Ok(());
        }
        let spec = *registry.get(&node.kernel)?;
        registry.check_params(&spec, &node.params)?;
        if node.outputs.len() > 1 && spec.name != UNPACK {
            return Err(GraphError::MultipleOutputs {
                kernel: node.label(),
                outputs: node.outputs.len(),
            });
        }
        node.spec = Some(spec);
        Ok(())
    }

    /// Runs the post-processing nodes over the output table. `apply` turns one
    /// consumed value into the node's outputs; the dry run at construction
    /// uses `()` values to check name resolution.
    fn walk_postprocess<V>(
        &self,
        initial: V,
        mut apply: impl FnMut(&PluginNode, V) -> Result<Vec<V>, GraphError>,
    ) -> Result<Vec<V>, GraphError> {
        let initial_name = self
            .accelerator
            .outputs
            .first()
            .map(|node| node.name.as_str())
            .unwrap_or_default();
        let mut table = NodeOutputTable::new(initial_name, initial);
        let mut aliases = PassThroughAliases::default();
        let mut consumed_initial = false;

        for node in &self.postprocess {
            if node.is_pass_through() {
                aliases.record(node);
                continue;
            }

            let (slot, value) = if consumed_initial {
                let input = node.inputs.first().map(|n| n.name.as_str()).unwrap_or_default();
                let input = aliases.resolve(&table, input);
                table.take(input)?
            } else {
                consumed_initial = true;
                table.take_initial()?
            };

            let outputs = apply(node, value)?;
            if outputs.len() != node.outputs.len() {
                return Err(GraphError::OutputCountMismatch {
                    kernel: node.label(),
                    expected: node.outputs.len(),
                    got: outputs.len(),
                });
            }
            if let [single] = node.outputs.as_slice() {
                if let Some(value) = outputs.into_iter().next() {
                    table.put(slot, &single.name, value);
                }
            } else {
                for (desc, value) in node.outputs.iter().zip(outputs) {
                    table.push(&desc.name, value);
                }
            }
        }

        table.check()?;
        Ok(table.into_values())
    }

    fn invoke(&self, node: &PluginNode, data: Value) -> Result<Value, GraphError> {
        match &node.spec {
            Some(spec) => self.registry.invoke(spec, &node.params, data),
            None => Ok(data),
        }
    }

    /// Runs the pre-processing nodes on one frame and returns the tensor to
    /// upload.
    pub fn preprocess(&self, frame: Tensor) -> Result<Tensor, GraphError> {
        let mut value = Value::Tensor(frame);
        for node in self.preprocess.iter().filter(|node| !node.is_pass_through()) {
            value = self.invoke(node, value)?;
        }
        match value {
            Value::Tensor(tensor) => Ok(tensor),
            Value::List(mut tensors) if tensors.len() == 1 => {
                tensors.pop().ok_or(GraphError::NotATensor("empty list".into()))
            }
            other => Err(GraphError::NotATensor(other.shape_summary())),
        }
    }

    /// Reinterprets downloaded OFM bytes as the accelerator's int8 output.
    pub fn decode_ofm(&self, bytes: &[u8]) -> Result<Tensor, GraphError> {
        if bytes.is_empty() {
            return Err(GraphError::EmptyOutput);
        }
        Ok(Tensor::from_i8_bytes(bytes, self.ofm_size() as usize))
    }

    pub fn postprocess(&self, ofm: &[u8]) -> Result<Value, GraphError> {
        let initial = Value::Tensor(self.decode_ofm(ofm)?);
        let mut outputs = self.walk_postprocess(initial, |node, value| {
            let result = self.invoke(node, value)?;
            Ok(match result {
                Value::List(tensors) if node.outputs.len() > 1 => {
                    tensors.into_iter().map(Value::Tensor).collect()
                }
                single => vec![single],
            })
        })?;

        if outputs.len() == 1 {
            return outputs.pop().ok_or(GraphError::EmptyOutput);
        }
        Ok(Value::List(
            outputs.into_iter().flat_map(Value::into_tensors).collect(),
        ))
    }

    pub fn ifm_size(&self) -> u64 {
        self.accelerator.inputs.first().map_or(0, |node| node.size)
    }

    pub fn ofm_size(&self) -> u64 {
        self.accelerator.outputs.first().map_or(0, |node| node.size)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn contract(&self) -> ModelContract {
        ModelContract {
            ifm_size: self.ifm_size(),
            ofm_size: self.ofm_size(),
            batch_size: self.batch_size,
        }
    }

    pub fn preprocess_nodes(&self) -> &[PluginNode] {
        &self.preprocess
    }

    pub fn postprocess_nodes(&self) -> &[PluginNode] {
        &self.postprocess
    }
}
