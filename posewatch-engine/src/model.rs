//! Model selection and the detector collaborator contracts.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use posewatch_common::{BodyLayout, Frame, PoseResult, Resolution};

use crate::config::{Configuration, ModelKind, TrackerSettings};
use crate::error::{ConfigError, InferenceError, LoadError};

/// Published location of the mediapipe pose solution
pub const MEDIAPIPE_SOLUTION_PATH: &str = "https://cdn.jsdelivr.net/npm/@mediapipe/pose";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimationOptions {
    pub max_poses: u32,
    pub flip_horizontal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveNetType {
    SinglePoseLightning,
    SinglePoseThunder,
    MultiPoseLightning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveNetParams {
    pub model_type: MoveNetType,
    /// Only present for custom models
    pub model_url: Option<String>,
    /// Only present for the multi-pose model
    pub enable_tracking: Option<bool>,
    pub tracker: Option<TrackerSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoseNetArchitecture {
    MobileNetV1,
    ResNet50,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseNetParams {
    pub architecture: PoseNetArchitecture,
    pub output_stride: u32,
    pub input_resolution: Resolution,
    pub multiplier: f32,
    pub quant_bytes: u32,
}

impl Default for PoseNetParams {
    fn default() -> Self {
        Self {
            architecture: PoseNetArchitecture::MobileNetV1,
            output_stride: 16,
            input_resolution: Resolution::new(500, 500),
            multiplier: 0.75,
            quant_bytes: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlazePoseRuntime {
    MediaPipe,
    Tfjs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlazePoseType {
    Lite,
    Full,
    Heavy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlazePoseParams {
    pub runtime: BlazePoseRuntime,
    pub model_type: BlazePoseType,
    /// Only present for the mediapipe runtime
    pub solution_path: Option<String>,
}

/// Everything the factory needs to build one detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model")]
pub enum ModelRequest {
    PoseNet(PoseNetParams),
    BlazePose(BlazePoseParams),
    MoveNet(MoveNetParams),
}

impl ModelRequest {
    pub fn from_config(config: &Configuration) -> Result<Self, ConfigError> {
        let model_type = config.model_config.model_type.as_str();
        let unknown_type = || ConfigError::UnknownModelType {
            model: config.model.to_string(),
            value: model_type.to_string(),
        };

        Ok(match config.model {
            ModelKind::PoseNet => ModelRequest::PoseNet(PoseNetParams::default()),

            ModelKind::BlazePose => {
                // The runtime is the backend prefix, e.g. `mediapipe-gpu`
                let runtime = match config.backend.split('-').next() {
                    Some("mediapipe") => BlazePoseRuntime::MediaPipe,
                    Some("tfjs") => BlazePoseRuntime::Tfjs,
                    _ => {
                        return Err(ConfigError::UnsupportedBackend {
                            model: config.model.to_string(),
                            backend: config.backend.clone(),
                        })
                    }
                };
                let model_type = match model_type {
                    "lite" => BlazePoseType::Lite,
                    "full" => BlazePoseType::Full,
                    "heavy" => BlazePoseType::Heavy,
                    _ => return Err(unknown_type()),
                };
                let solution_path = match runtime {
                    BlazePoseRuntime::MediaPipe => Some(MEDIAPIPE_SOLUTION_PATH.to_string()),
                    BlazePoseRuntime::Tfjs => None,
                };
                ModelRequest::BlazePose(BlazePoseParams {
                    runtime,
                    model_type,
                    solution_path,
                })
            }

            ModelKind::MoveNet => {
                let model_type = match model_type {
                    "lightning" => MoveNetType::SinglePoseLightning,
                    "thunder" => MoveNetType::SinglePoseThunder,
                    "multipose" => MoveNetType::MultiPoseLightning,
                    _ => return Err(unknown_type()),
                };
                let custom = config.model_config.custom_model_url.trim();
                let model_url = (!custom.is_empty()).then(|| custom.to_string());
                let multi = model_type == MoveNetType::MultiPoseLightning;
                ModelRequest::MoveNet(MoveNetParams {
                    model_type,
                    model_url,
                    enable_tracking: multi.then_some(config.tracker.enabled),
                    tracker: (multi && config.tracker.enabled).then_some(config.tracker),
                })
            }
        })
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            ModelRequest::PoseNet(_) => ModelKind::PoseNet,
            ModelRequest::BlazePose(_) => ModelKind::BlazePose,
            ModelRequest::MoveNet(_) => ModelKind::MoveNet,
        }
    }

    pub fn layout(&self) -> BodyLayout {
        match self {
            ModelRequest::BlazePose(_) => BodyLayout::BlazePose33,
            _ => BodyLayout::Coco17,
        }
    }
}

/// A loaded pose estimation model
pub trait Detector: Send {
    fn estimate<'a>(
        &'a mut self,
        frame: &'a Frame,
        options: EstimationOptions,
    ) -> BoxFuture<'a, Result<PoseResult, InferenceError>>;

    /// Release the model, calling it twice must be harmless
    fn dispose(&mut self) -> BoxFuture<'_, ()>;
}

/// Builds detectors and configures the inference runtime
pub trait DetectorFactory: Send {
    /// Select the backend and set its runtime flags before a detector is built
    fn apply_backend<'a>(
        &'a mut self,
        backend: &'a str,
        flags: &'a crate::config::RuntimeFlags,
    ) -> BoxFuture<'a, Result<(), LoadError>>;

    fn create<'a>(
        &'a mut self,
        request: &'a ModelRequest,
    ) -> BoxFuture<'a, Result<Box<dyn Detector>, LoadError>>;
}

/// Identifies a detector generation, advanced on every replacement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Self {
        Epoch(self.0 + 1)
    }
}

/// The detector owned by the orchestrator and the generation it belongs to
pub(crate) struct LiveDetector {
    pub detector: Box<dyn Detector>,
    pub request: ModelRequest,
    pub epoch: Epoch,
}

impl LiveDetector {
    pub async fn dispose(mut self) {
        tracing::debug!(epoch = self.epoch.0, "disposing detector");
        self.detector.dispose().await;
    }
}

/// Poses tagged with the generation of the detector that produced them
#[derive(Debug, Clone)]
pub(crate) struct Estimation {
    pub poses: PoseResult,
    pub epoch: Epoch,
}
