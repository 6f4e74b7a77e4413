use crate::error::ManifestError;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processor {
    /// General purpose vector core running pre/post transforms.
    Ev74,
    /// The accelerator itself.
    Mla,
}

impl Processor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Processor::Ev74 => "EV74",
            Processor::Mla => "MLA",
        }
    }
}

impl TryFrom<&str> for Processor {
    type Error = ManifestError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "EV74" => Ok(Self::Ev74),
            "MLA" => Ok(Self::Mla),
            other => Err(ManifestError::UnknownProcessor(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NodeDesc {
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ConfigParams {
    pub kernel: String,
    #[serde(default)]
    pub params: Map<String, JsonValue>,
    #[serde(default)]
    pub actual_batch_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Plugin {
    #[serde(default)]
    pub name: Option<String>,
    pub processor: String,
    pub config_params: ConfigParams,
    #[serde(default)]
    pub input_nodes: Vec<NodeDesc>,
    #[serde(default)]
    pub output_nodes: Vec<NodeDesc>,
}

impl Plugin {
    pub fn processor(&self) -> Result<Processor, ManifestError> {
        Processor::try_from(self.processor.as_str())
    }

    pub fn kernel(&self) -> &str {
        &self.config_params.kernel
    }
}

/// Ordered plugin list of an MPK manifest. Order is significant.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Manifest {
    pub plugins: Vec<Plugin>,
}

impl Manifest {
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        if json.trim().is_empty() {
            return Err(ManifestError::EmptyManifest);
        }
        let value: JsonValue = serde_json::from_str(json)?;
        let is_empty = match &value {
            JsonValue::Object(map) => {
                map.is_empty() || map.values().all(is_empty_value)
            }
            JsonValue::Null => true,
            _ => false,
        };
        if is_empty {
            return Err(ManifestError::EmptyManifest);
        }

        let manifest: Manifest = serde_json::from_value(value)?;
        if manifest.plugins.is_empty() {
            return Err(ManifestError::EmptyManifest);
        }
        Ok(manifest)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }
}

fn is_empty_value(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
        JsonValue::String(s) => s.is_empty(),
        _ => false,
    }
}

/// What an MLA-only throughput run needs from a manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct MpkAttributes {
    pub slice_height: u64,
    pub slice_width: u64,
    pub slice_channels: u64,
    pub align_c16: bool,
    /// Total input bytes for all frames of a batch.
    pub ifm_size: u64,
    /// Total output bytes for all frames of a batch.
    pub ofm_size: u64,
    pub batch_size: usize,
}

impl MpkAttributes {
    /// Reads the tessellation node and the MLA node that must follow it.
    pub fn from_manifest(manifest: &Manifest) -> Result<Self, ManifestError> {
        let index = manifest
            .plugins
            .iter()
            .position(|plugin| plugin.kernel() == "tessellation_transform")
            .ok_or_else(|| {
                ManifestError::MissingAttribute("tessellation_transform plugin".into())
            })?;
        let tessellation = &manifest.plugins[index];
        let params = &tessellation.config_params.params;

        let slice_shape: Vec<u64> = params
            .get("slice_shape")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .filter(|shape: &Vec<u64>| shape.len() >= 3)
            .ok_or_else(|| ManifestError::MissingAttribute("slice_shape".into()))?;
        let align_c16 = params
            .get("align_c16")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        let ifm_size = tessellation
            .output_nodes
            .first()
            .map(|node| node.size)
            .ok_or_else(|| ManifestError::MissingAttribute("tessellation output node".into()))?;

        let mla = manifest
            .plugins
            .get(index + 1)
            .filter(|plugin| matches!(plugin.processor(), Ok(Processor::Mla)))
            .ok_or_else(|| {
                ManifestError::MissingAttribute("MLA plugin after tessellation".into())
            })?;
        let ofm_size = mla
            .output_nodes
            .first()
            .map(|node| node.size)
            .ok_or_else(|| ManifestError::MissingAttribute("MLA output node".into()))?;

        Ok(Self {
            slice_height: slice_shape[0],
            slice_width: slice_shape[1],
            slice_channels: slice_shape[2],
            align_c16,
            ifm_size,
            ofm_size,
            batch_size: mla.config_params.actual_batch_size.unwrap_or(1),
        })
    }

    pub fn ifm_size_per_frame(&self) -> u64 {
        self.ifm_size / self.batch_size.max(1) as u64
    }

    pub fn ofm_size_per_frame(&self) -> u64 {
        self.ofm_size / self.batch_size.max(1) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MLA_ONLY: &str = r#"{
        "plugins": [
            {"processor": "EV74", "config_params": {"kernel": "quantization_transform",
                "params": {"channel_params": [[1.0, 0]], "num_bits": 8}},
             "input_nodes": [{"name": "input", "size": 4800}],
             "output_nodes": [{"name": "quant", "size": 1200}]},
            {"processor": "EV74", "config_params": {"kernel": "tessellation_transform",
                "params": {"slice_shape": [20, 20, 3], "align_c16": false}},
             "input_nodes": [{"name": "quant", "size": 1200}],
             "output_nodes": [{"name": "tess", "size": 4800}]},
            {"processor": "MLA", "config_params": {"kernel": "mla", "params": {},
                "actual_batch_size": 4},
             "input_nodes": [{"name": "tess", "size": 4800}],
             "output_nodes": [{"name": "ofm", "size": 1600}]}
        ]
    }"#;

    #[test]
    fn test_empty_manifests() {
        for json in ["", "   ", "{}", "null", r#"{"plugins": []}"#] {
            assert!(
                matches!(Manifest::from_json(json), Err(ManifestError::EmptyManifest)),
                "{:?} should be empty",
                json
            );
        }
    }

    #[test]
    fn test_malformed_manifest() {
        assert!(matches!(
            Manifest::from_json("{\"plugins\": ["),
            Err(ManifestError::Malformed(_))
        ));
        assert!(matches!(
            Manifest::from_json(r#"{"plugins": [{"processor": "EV74"}]}"#),
            Err(ManifestError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_processor() {
        let manifest = Manifest::from_json(
            r#"{"plugins": [{"processor": "A65", "config_params": {"kernel": "x"}}]}"#,
        )
        .unwrap();
        assert!(matches!(
            manifest.plugins[0].processor(),
            Err(ManifestError::UnknownProcessor(name)) if name == "A65"
        ));
    }

    #[test]
    fn test_mpk_attributes() {
        let manifest = Manifest::from_json(MLA_ONLY).unwrap();
        let attributes = MpkAttributes::from_manifest(&manifest).unwrap();

        assert_eq!(attributes.slice_height, 20);
        assert_eq!(attributes.slice_channels, 3);
        assert!(!attributes.align_c16);
        assert_eq!(attributes.ifm_size, 4800);
        assert_eq!(attributes.ofm_size, 1600);
        assert_eq!(attributes.batch_size, 4);
        assert_eq!(attributes.ifm_size_per_frame(), 1200);
        assert_eq!(attributes.ofm_size_per_frame(), 400);
    }

    #[test]
    fn test_mpk_attributes_need_tessellation() {
        let manifest = Manifest::from_json(
            r#"{"plugins": [{"processor": "MLA", "config_params": {"kernel": "mla"}}]}"#,
        )
        .unwrap();
        assert!(matches!(
            MpkAttributes::from_manifest(&manifest),
            Err(ManifestError::MissingAttribute(_))
        ));
    }
}
