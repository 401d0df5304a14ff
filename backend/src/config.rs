use std::env;
use std::path::PathBuf;
use tch::Device;

use crate::pipeline::config::ClassificationConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub media_dir: PathBuf,
    pub model_path: PathBuf,
    pub device: Device,
    pub classification: ClassificationConfig,
}

impl AppConfig {
    /// Builds the configuration from the process environment (after `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = match env::var("PORT") {
            Ok(port) => port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("PORT is not a port number: {}", port)))?,
            Err(_) => 8000,
        };
        let media_dir = env::var("MEDIA_DIR").unwrap_or_else(|_| "media".to_string());
        let model_path = env::var("MODEL_PATH")
            .unwrap_or_else(|_| "model/efficientnet_b0.safetensors".to_string());
        let device = parse_device(&env::var("MODEL_DEVICE").unwrap_or_else(|_| "auto".into()))?;
        let classification_path = env::var("CLASSIFICATION_CONFIG").ok().map(PathBuf::from);
        let classification = ClassificationConfig::load(classification_path.as_deref())?;

        Ok(Self {
            host,
            port,
            media_dir: PathBuf::from(media_dir),
            model_path: PathBuf::from(model_path),
            device,
            classification,
        })
    }
}

pub fn parse_device(value: &str) -> Result<Device, ConfigError> {
    match value.to_lowercase().as_str() {
        "auto" => Ok(Device::cuda_if_available()),
        "cpu" => Ok(Device::Cpu),
        "cuda" | "gpu" => Ok(Device::Cuda(0)),
        other => Err(ConfigError::Invalid(format!(
            "MODEL_DEVICE must be auto, cpu or cuda, got {}",
            other
        ))),
    }
}
