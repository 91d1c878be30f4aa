//! Real-time pose estimation loop: detector lifecycle, capture, overlay
//! rendering and the settings panel driving them.

pub mod capture;
pub mod config;
pub mod error;
pub mod mock;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod panel;
pub mod render;
pub mod stats;

pub use config::{ConfigHandle, Configuration, ModelKind, SizeOption};
pub use error::EngineError;
pub use orchestrator::{run_orchestrator, Collaborators, LoopState, OrchestratorProxy};
