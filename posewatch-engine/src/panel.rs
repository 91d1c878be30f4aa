//! Settings panel fed by JSON lines, one command per line.

use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use crate::config::{ConfigHandle, FlagValue, ModelKind, SizeOption, TrackerSettings};
use crate::error::ConfigError;
use crate::orchestrator::OrchestratorProxy;

/// Possible edits coming from the panel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PanelCommand {
    SetModel {
        model: ModelKind,
    },
    SetModelType {
        value: String,
    },
    /// Empty url restores the published model
    SetCustomModel {
        url: String,
    },
    SetBackend {
        backend: String,
    },
    SetFlag {
        name: String,
        value: FlagValue,
    },
    SetTargetFps {
        fps: u32,
    },
    SetSize {
        size: SizeOption,
    },
    SetMaxPoses {
        max_poses: u32,
    },
    SetTracker {
        tracker: TrackerSettings,
    },
    /// Stop the render loop
    Stop,
}

/// Apply a panel edit to the shared configuration
pub fn apply(config: &ConfigHandle, cmd: PanelCommand) -> Result<ControlFlow<()>, ConfigError> {
    match cmd {
        PanelCommand::SetModel { model } => config.set_model(model),
        PanelCommand::SetModelType { value } => config.set_model_type(&value)?,
        PanelCommand::SetCustomModel { url } => config.set_custom_model(&url),
        PanelCommand::SetBackend { backend } => config.set_backend(&backend)?,
        PanelCommand::SetFlag { name, value } => config.set_flag(&name, value),
        PanelCommand::SetTargetFps { fps } => config.set_target_fps(fps)?,
        PanelCommand::SetSize { size } => config.set_size(size),
        PanelCommand::SetMaxPoses { max_poses } => config.set_max_poses(max_poses)?,
        PanelCommand::SetTracker { tracker } => config.set_tracker(tracker),
        PanelCommand::Stop => return Ok(ControlFlow::Break(())),
    }
    Ok(ControlFlow::Continue(()))
}

/// Read commands until `Stop` or the end of the input
#[tracing::instrument(skip_all)]
pub async fn run_panel<R>(reader: R, config: ConfigHandle, proxy: OrchestratorProxy)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::error!("unable to read panel input: {}", err);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let cmd = match serde_json::from_str::<PanelCommand>(line) {
            Ok(cmd) => cmd,
            Err(err) => {
                tracing::warn!("invalid panel command: {}", err);
                continue;
            }
        };

        tracing::debug!(?cmd, "panel command");
        match apply(&config, cmd) {
            Ok(ControlFlow::Continue(())) => {}
            Ok(ControlFlow::Break(())) => {
                if let Err(err) = proxy.stop().await {
                    tracing::warn!("{}", err);
                }
                return;
            }
            Err(err) => tracing::warn!("rejected panel command: {}", err),
        }
    }
    tracing::info!("panel input closed");
}

/// Serve the panel on the standard input
pub fn run_stdin_panel(config: ConfigHandle, proxy: OrchestratorProxy) -> JoinHandle<()> {
    tokio::spawn(run_panel(BufReader::new(tokio::io::stdin()), config, proxy))
}
