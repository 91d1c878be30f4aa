use thiserror::Error;

/// Model construction failed
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unable to fetch model from `{url}`: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("model at `{url}` is malformed: {reason}")]
    Malformed { url: String, reason: String },

    #[error("backend `{backend}` cannot be initialized: {reason}")]
    Backend { backend: String, reason: String },

    #[error("invalid model request: {0}")]
    InvalidRequest(#[from] ConfigError),
}

/// The capture device cannot deliver frames
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("capture device unavailable: {0}")]
    Unavailable(String),

    #[error("capture stream closed")]
    Closed,
}

/// The detector rejected a frame or produced unusable output
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("detector rejected frame {sequence}: {reason}")]
    Rejected { sequence: u64, reason: String },

    #[error("detector produced malformed output: {0}")]
    MalformedOutput(String),

    #[error("detector used after dispose")]
    Disposed,
}

/// A frame was requested before the capture source produced its first sample
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("capture source has not produced its first frame yet")]
pub struct NotReadyError;

/// Rejected configuration value
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown model `{0}`")]
    UnknownModel(String),

    #[error("model {model} has no type `{value}`")]
    UnknownModelType { model: String, value: String },

    #[error("backend `{backend}` is not supported by {model}")]
    UnsupportedBackend { model: String, backend: String },

    #[error("target frame rate must be within 1..=120, got {0}")]
    InvalidTargetFps(u32),

    #[error("unknown capture size `{0}`")]
    UnknownSize(String),

    #[error("max poses must be at least 1, got {0}")]
    InvalidMaxPoses(u32),

    #[error("unable to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid json configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid yaml configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that stop the orchestrator
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("orchestrator is not running")]
    NotRunning,
}
