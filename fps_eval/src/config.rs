use mla_client::TransferMode;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub devkit: DevkitConfig,
    pub model: Option<ModelConfig>,
    #[serde(default)]
    pub detection: DetectionConfig,
    pub runner: Option<RunnerConfig>,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct DevkitConfig {
    pub host: String,
    #[serde(default = "default_control_port")]
    pub port: u16,
    #[serde(default = "default_bulk_port")]
    pub bulk_port: u16,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_control_port() -> u16 {
    mla_client::DEFAULT_CONTROL_PORT
}

fn default_bulk_port() -> u16 {
    mla_client::DEFAULT_BULK_PORT
}

fn default_connect_timeout_secs() -> u64 {
    5
}

impl DevkitConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvalMode {
    /// Batched accelerator runs on pre-allocated buffers.
    MlaOnly,
    /// MLA plus A65 pipeline driven by a `.tar.gz` archive.
    Pipelined,
    /// Manifest pre/post-processing on the host around the accelerator.
    Prepost,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferSetting {
    #[default]
    Bulk,
    Control,
}

impl From<TransferSetting> for TransferMode {
    fn from(setting: TransferSetting) -> Self {
        match setting {
            TransferSetting::Bulk => TransferMode::Bulk,
            TransferSetting::Control => TransferMode::Control,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// `.elf`/`.lm` model or `.tar.gz` pipeline archive, staged on the device.
    pub model_file: String,
    pub mpk_manifest: Option<PathBuf>,
    pub mode: Option<EvalMode>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Zero runs until interrupted.
    #[serde(default)]
    pub max_frames: u64,
    pub layer_stats: Option<String>,
    #[serde(default)]
    pub transfer: TransferSetting,
    /// Synthetic frame size as `[H, W, C]`.
    #[serde(default = "default_image_size")]
    pub image_size: Vec<usize>,
}

fn default_batch_size() -> usize {
    1
}

fn default_image_size() -> Vec<usize> {
    vec![640, 640, 3]
}

impl ModelConfig {
    /// Explicit mode, or the one implied by the model file extension.
    pub fn eval_mode(&self) -> EvalMode {
        match self.mode {
            Some(mode) => mode,
            None if self.model_file.ends_with(".tar.gz") => EvalMode::Pipelined,
            None => EvalMode::MlaOnly,
        }
    }

    pub fn frame_shape(&self) -> [usize; 4] {
        match self.image_size.as_slice() {
            [h, w, c] => [1, *h, *w, *c],
            _ => [1, 640, 640, 3],
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.image_size.len() != 3 || self.image_size.contains(&0) {
            return Err(format!(
                "image_size must be three non-zero values H W C, got {:?}",
                self.image_size
            ));
        }
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1".into());
        }
        let mode = self.eval_mode();
        if mode != EvalMode::MlaOnly && self.layer_stats.is_some() {
            return Err("Layer stats only supported with MLA Only mode".into());
        }
        if mode == EvalMode::Pipelined && !self.model_file.ends_with(".tar.gz") {
            return Err(format!(
                "Pipelined mode needs a .tar.gz archive, got {}",
                self.model_file
            ));
        }
        if mode != EvalMode::Pipelined {
            match &self.mpk_manifest {
                Some(path) if path.exists() => {}
                Some(path) => return Err(format!("MPK manifest not found: {:?}", path)),
                None => return Err("mpk_manifest is required outside pipelined mode".into()),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_threshold")]
    pub nms_thr: f32,
    #[serde(default = "default_threshold")]
    pub score_thr: f32,
    /// Model input as `[H, W]`.
    #[serde(default = "default_input_size")]
    pub input_size: Vec<usize>,
}

fn default_threshold() -> f32 {
    0.5
}

fn default_input_size() -> Vec<usize> {
    vec![640, 640]
}

impl DetectionConfig {
    pub fn img_size(&self) -> (usize, usize) {
        match self.input_size.as_slice() {
            [h, w] => (*h, *w),
            _ => (640, 640),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            nms_thr: default_threshold(),
            score_thr: default_threshold(),
            input_size: default_input_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    pub model_command: String,
    pub model_archive: String,
    /// Zero falls back to 60 seconds.
    #[serde(default = "default_run_time_secs")]
    pub run_time_secs: u64,
    #[serde(default = "default_virtual_env")]
    pub virtual_env: String,
}

fn default_run_time_secs() -> u64 {
    60
}

fn default_virtual_env() -> String {
    "sima_env".into()
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("Failed to determine the current directory: {}", e))
    })?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("EVAL")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize::<Config>()
    }

    #[test]
    fn test_base_configuration_parses() {
        let config = parse(include_str!("../configuration/base.yaml")).unwrap();

        assert_eq!(config.devkit.port, 8000);
        assert_eq!(config.devkit.bulk_port, 43777);
        let model = config.model.unwrap();
        assert_eq!(model.eval_mode(), EvalMode::MlaOnly);
        assert_eq!(model.batch_size, 1);
        assert_eq!(model.frame_shape(), [1, 640, 640, 3]);
        assert_eq!(config.runner.unwrap().run_time_secs, 60);
    }

    #[test]
    fn test_defaults_and_mode_from_extension() {
        let config = parse(
            r#"
log_level: debug
devkit:
  host: devkit.local
model:
  model_file: yolox_mpk.tar.gz
"#,
        )
        .unwrap();

        assert_eq!(config.devkit.get_address(), "devkit.local:8000");
        assert!(!config.detection.enabled);
        let model = config.model.unwrap();
        assert_eq!(model.eval_mode(), EvalMode::Pipelined);
        assert_eq!(model.transfer, TransferSetting::Bulk);
        assert!(model.validate().is_ok());
    }

    #[test]
    fn test_layer_stats_need_mla_only_mode() {
        let config = parse(
            r#"
log_level: info
devkit:
  host: devkit.local
model:
  model_file: yolox_mpk.tar.gz
  layer_stats: stats.yaml
"#,
        )
        .unwrap();
        assert!(config.model.unwrap().validate().is_err());
    }

    #[test]
    fn test_unknown_log_level_is_rejected() {
        assert!(parse("log_level: trace\ndevkit:\n  host: h\n").is_err());
        let environment: Result<Environment, _> = "staging".to_string().try_into();
        assert!(environment.is_err());
    }
}
