//! Shared configuration written by the control panel and reconciled by the
//! orchestrator.
//!
//! Every value has exactly one writer: the panel setters of [`ConfigHandle`]
//! write values and raise the matching change-flag, the orchestrator is the
//! only one that clears change-flags.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use posewatch_common::Resolution;

use crate::error::ConfigError;
use crate::model::EstimationOptions;

/// Supported pose estimation model families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    PoseNet,
    BlazePose,
    MoveNet,
}

impl ModelKind {
    /// Valid values of `model_config.type`
    pub fn types(&self) -> &'static [&'static str] {
        match self {
            ModelKind::PoseNet => &[],
            ModelKind::BlazePose => &["lite", "full", "heavy"],
            ModelKind::MoveNet => &["lightning", "thunder", "multipose"],
        }
    }

    pub fn default_type(&self) -> &'static str {
        match self {
            ModelKind::PoseNet => "",
            ModelKind::BlazePose => "full",
            ModelKind::MoveNet => "lightning",
        }
    }

    /// Backends able to run the model, the first one is the default
    pub fn backends(&self) -> &'static [&'static str] {
        match self {
            ModelKind::PoseNet => &["tfjs-webgl", "tfjs-webgpu"],
            ModelKind::BlazePose => &["mediapipe-gpu", "tfjs-webgl", "tfjs-webgpu"],
            ModelKind::MoveNet => &["tfjs-webgl", "tfjs-wasm", "tfjs-webgpu"],
        }
    }

    /// Minimum keypoint score drawn by the overlay
    pub fn default_score_threshold(&self) -> f32 {
        match self {
            ModelKind::PoseNet => 0.5,
            ModelKind::BlazePose => 0.65,
            ModelKind::MoveNet => 0.3,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelKind::PoseNet => "PoseNet",
            ModelKind::BlazePose => "BlazePose",
            ModelKind::MoveNet => "MoveNet",
        };
        f.write_str(name)
    }
}

impl FromStr for ModelKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "posenet" => Ok(ModelKind::PoseNet),
            "blazepose" => Ok(ModelKind::BlazePose),
            "movenet" => Ok(ModelKind::MoveNet),
            _ => Err(ConfigError::UnknownModel(s.to_string())),
        }
    }
}

/// Value of a runtime backend flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

pub type RuntimeFlags = BTreeMap<String, FlagValue>;

/// Capture sizes offered by the camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeOption {
    #[serde(rename = "640 X 480")]
    Vga,
    #[serde(rename = "640 X 360")]
    Wide,
    #[serde(rename = "360 X 270")]
    Small,
}

impl SizeOption {
    pub fn resolution(&self) -> Resolution {
        match self {
            SizeOption::Vga => Resolution::new(640, 480),
            SizeOption::Wide => Resolution::new(640, 360),
            SizeOption::Small => Resolution::new(360, 270),
        }
    }
}

impl FromStr for SizeOption {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        match compact.as_str() {
            "640x480" => Ok(SizeOption::Vga),
            "640x360" => Ok(SizeOption::Wide),
            "360x270" => Ok(SizeOption::Small),
            _ => Err(ConfigError::UnknownSize(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureParams {
    pub target_fps: u32,
    pub size: SizeOption,
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self {
            target_fps: 60,
            size: SizeOption::Vga,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerKind {
    Keypoint,
    BoundingBox,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Maximum number of people tracked at once
    pub max_tracks: u32,
    /// How long a track survives without a matching detection
    pub max_age_ms: u64,
    /// Minimum similarity to link a detection to an existing track
    pub min_similarity: f32,
}

impl TrackerConfig {
    pub fn for_kind(kind: TrackerKind) -> Self {
        match kind {
            TrackerKind::Keypoint => Self {
                max_tracks: 18,
                max_age_ms: 1000,
                min_similarity: 0.2,
            },
            TrackerKind::BoundingBox => Self {
                max_tracks: 18,
                max_age_ms: 1000,
                min_similarity: 0.15,
            },
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::for_kind(TrackerKind::Keypoint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: TrackerKind,
    #[serde(rename = "tracker_config")]
    pub config: TrackerConfig,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: TrackerKind::Keypoint,
            config: TrackerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Left empty by a file that does not name one, resolved to the model's default
    #[serde(rename = "type", default)]
    pub model_type: String,
    /// Url of a custom model, empty to use the published one
    pub custom_model_url: String,
    pub max_poses: u32,
    /// Overrides the model's default overlay threshold
    pub score_threshold: Option<f32>,
    pub flip_horizontal: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_type: ModelKind::MoveNet.default_type().to_string(),
            custom_model_url: String::new(),
            max_poses: 1,
            score_threshold: None,
            flip_horizontal: false,
        }
    }
}

impl ModelConfig {
    fn unresolved() -> Self {
        Self {
            model_type: String::new(),
            ..Self::default()
        }
    }
}

/// Complete user-selected configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub model: ModelKind,
    pub backend: String,
    pub flags: RuntimeFlags,
    #[serde(default = "ModelConfig::unresolved")]
    pub model_config: ModelConfig,
    pub tracker: TrackerSettings,
    pub capture: CaptureParams,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            model: ModelKind::MoveNet,
            backend: ModelKind::MoveNet.backends()[0].to_string(),
            flags: RuntimeFlags::new(),
            model_config: ModelConfig::default(),
            tracker: TrackerSettings::default(),
            capture: CaptureParams::default(),
        }
    }
}

impl Configuration {
    /// Load a configuration file, yaml if the extension says so, json otherwise
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if is_yaml {
            Self::from_yaml(&text)
        } else {
            Self::from_json(&text)
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.resolved()
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.resolved()
    }

    /// Fill in what a file left out, then validate
    fn resolved(mut self) -> Result<Self, ConfigError> {
        if self.model_config.model_type.is_empty() {
            self.model_config.model_type = self.model.default_type().to_string();
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_model_type(self.model, &self.model_config.model_type)?;
        validate_backend(self.model, &self.backend)?;
        validate_target_fps(self.capture.target_fps)?;
        validate_max_poses(self.model_config.max_poses)?;
        Ok(())
    }

    pub fn estimation_options(&self) -> EstimationOptions {
        EstimationOptions {
            max_poses: self.model_config.max_poses,
            flip_horizontal: self.model_config.flip_horizontal,
        }
    }

    pub fn score_threshold(&self) -> f32 {
        self.model_config
            .score_threshold
            .unwrap_or_else(|| self.model.default_score_threshold())
    }
}

fn validate_model_type(model: ModelKind, value: &str) -> Result<(), ConfigError> {
    let types = model.types();
    // PoseNet has a single published architecture
    if types.is_empty() || types.contains(&value) {
        return Ok(());
    }
    Err(ConfigError::UnknownModelType {
        model: model.to_string(),
        value: value.to_string(),
    })
}

fn validate_backend(model: ModelKind, backend: &str) -> Result<(), ConfigError> {
    if model.backends().contains(&backend) {
        return Ok(());
    }
    Err(ConfigError::UnsupportedBackend {
        model: model.to_string(),
        backend: backend.to_string(),
    })
}

fn validate_target_fps(fps: u32) -> Result<(), ConfigError> {
    if (1..=120).contains(&fps) {
        return Ok(());
    }
    Err(ConfigError::InvalidTargetFps(fps))
}

fn validate_max_poses(max_poses: u32) -> Result<(), ConfigError> {
    if max_poses >= 1 {
        return Ok(());
    }
    Err(ConfigError::InvalidMaxPoses(max_poses))
}

/// What changed since the orchestrator last reconciled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeFlags {
    pub model: bool,
    pub backend: bool,
    pub flags: bool,
    pub target_fps: bool,
    pub size: bool,
}

impl ChangeFlags {
    /// Changes that require a new detector
    pub fn model_related(&self) -> bool {
        self.model || self.backend || self.flags
    }

    /// Changes that require a new capture source
    pub fn capture_related(&self) -> bool {
        self.target_fps || self.size
    }

    /// Backend and runtime flags must be applied before the detector is built
    pub fn needs_backend(&self) -> bool {
        self.backend || self.flags
    }
}

#[derive(Debug)]
struct ConfigState {
    config: Configuration,
    changes: ChangeFlags,
}

/// Narrow, cloneable access to the shared configuration
#[derive(Clone, Debug)]
pub struct ConfigHandle(Arc<Mutex<ConfigState>>);

impl ConfigHandle {
    pub fn new(config: Configuration) -> Self {
        Self(Arc::new(Mutex::new(ConfigState {
            config,
            changes: ChangeFlags::default(),
        })))
    }

    fn lock(&self) -> MutexGuard<'_, ConfigState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Configuration {
        self.lock().config.clone()
    }

    pub fn pending(&self) -> ChangeFlags {
        self.lock().changes
    }

    pub fn estimation_options(&self) -> EstimationOptions {
        self.lock().config.estimation_options()
    }

    /// Read and clear the capture flags together with the parameters they refer to
    pub(crate) fn take_capture_changes(&self) -> (ChangeFlags, CaptureParams) {
        let mut state = self.lock();
        let taken = ChangeFlags {
            target_fps: state.changes.target_fps,
            size: state.changes.size,
            ..Default::default()
        };
        state.changes.target_fps = false;
        state.changes.size = false;
        (taken, state.config.capture)
    }

    /// Read and clear the flags that require a new detector
    pub(crate) fn take_model_changes(&self) -> ChangeFlags {
        let mut state = self.lock();
        let taken = ChangeFlags {
            model: state.changes.model,
            backend: state.changes.backend,
            flags: state.changes.flags,
            ..Default::default()
        };
        state.changes.model = false;
        state.changes.backend = false;
        state.changes.flags = false;
        taken
    }

    /// Select a model family, resetting the type and falling back to a
    /// supported backend
    pub fn set_model(&self, model: ModelKind) {
        let mut state = self.lock();
        state.config.model = model;
        state.config.model_config.model_type = model.default_type().to_string();
        if !model.backends().contains(&state.config.backend.as_str()) {
            state.config.backend = model.backends()[0].to_string();
            state.changes.backend = true;
        }
        state.changes.model = true;
    }

    pub fn set_model_type(&self, value: &str) -> Result<(), ConfigError> {
        let mut state = self.lock();
        validate_model_type(state.config.model, value)?;
        state.config.model_config.model_type = value.to_string();
        state.changes.model = true;
        Ok(())
    }

    pub fn set_custom_model(&self, url: &str) {
        let mut state = self.lock();
        state.config.model_config.custom_model_url = url.trim().to_string();
        state.changes.model = true;
    }

    pub fn set_backend(&self, backend: &str) -> Result<(), ConfigError> {
        let mut state = self.lock();
        validate_backend(state.config.model, backend)?;
        state.config.backend = backend.to_string();
        state.changes.backend = true;
        Ok(())
    }

    pub fn set_flag(&self, name: &str, value: FlagValue) {
        let mut state = self.lock();
        state.config.flags.insert(name.to_string(), value);
        state.changes.flags = true;
    }

    pub fn set_target_fps(&self, fps: u32) -> Result<(), ConfigError> {
        validate_target_fps(fps)?;
        let mut state = self.lock();
        state.config.capture.target_fps = fps;
        state.changes.target_fps = true;
        Ok(())
    }

    pub fn set_size(&self, size: SizeOption) {
        let mut state = self.lock();
        state.config.capture.size = size;
        state.changes.size = true;
    }

    /// Read on every inference, no reconciliation needed
    pub fn set_max_poses(&self, max_poses: u32) -> Result<(), ConfigError> {
        validate_max_poses(max_poses)?;
        self.lock().config.model_config.max_poses = max_poses;
        Ok(())
    }

    /// Only a multi-pose MoveNet request carries the tracker, other models
    /// keep their detector
    pub fn set_tracker(&self, tracker: TrackerSettings) {
        let mut state = self.lock();
        if state.config.tracker == tracker {
            return;
        }
        state.config.tracker = tracker;
        if state.config.model == ModelKind::MoveNet
            && state.config.model_config.model_type == "multipose"
        {
            state.changes.model = true;
        }
    }
}
