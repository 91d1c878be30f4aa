use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use posewatch::mock::{SyntheticCamera, SyntheticFactory};
use posewatch::notify::TracingNotifier;
use posewatch::panel::run_stdin_panel;
use posewatch::render::TracingSurface;
use posewatch::stats::TracingStats;
use posewatch::{run_orchestrator, Collaborators, ConfigHandle, Configuration, ModelKind, SizeOption};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Yaml or json configuration file, flags override its values
    #[arg(long)]
    config: Option<PathBuf>,
    /// Model family: posenet, blazepose or movenet
    #[arg(long)]
    model: Option<ModelKind>,
    /// Model variant, e.g. lightning, thunder, multipose
    #[arg(long = "type")]
    model_type: Option<String>,
    #[arg(long)]
    backend: Option<String>,
    /// Target frame rate of the capture
    #[arg(long)]
    fps: Option<u32>,
    /// Capture size, e.g. "640 X 480"
    #[arg(long)]
    size: Option<SizeOption>,
    /// Url of a custom MoveNet model
    #[arg(long)]
    custom_model: Option<String>,
    #[arg(long)]
    max_poses: Option<u32>,
    /// Inference latency of the synthetic detector
    #[arg(long, default_value_t = 25)]
    latency_ms: u64,
    /// Time before the synthetic camera produces its first frame
    #[arg(long, default_value_t = 500)]
    warmup_ms: u64,
}

fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_env_filter(EnvFilter::from_default_env())
        .compact()
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(true)
        .with_target(false)
        .init();
}

/// Defaults, then the configuration file, then command line flags
fn load_config(args: &Cli) -> Result<ConfigHandle, Box<dyn std::error::Error>> {
    let base = match &args.config {
        Some(path) => Configuration::from_file(path)?,
        None => Configuration::default(),
    };
    let config = ConfigHandle::new(base);

    if let Some(model) = args.model {
        config.set_model(model);
    }
    if let Some(backend) = &args.backend {
        config.set_backend(backend)?;
    }
    if let Some(model_type) = &args.model_type {
        config.set_model_type(model_type)?;
    }
    if let Some(url) = &args.custom_model {
        config.set_custom_model(url);
    }
    if let Some(fps) = args.fps {
        config.set_target_fps(fps)?;
    }
    if let Some(size) = args.size {
        config.set_size(size);
    }
    if let Some(max_poses) = args.max_poses {
        config.set_max_poses(max_poses)?;
    }
    Ok(config)
}

async fn run(args: Cli, config: ConfigHandle) -> Result<(), Box<dyn std::error::Error>> {
    let (camera, _) = SyntheticCamera::new(Duration::from_millis(args.warmup_ms));
    let (factory, _) = SyntheticFactory::new(Duration::from_millis(args.latency_ms));

    let proxy = run_orchestrator(
        &config,
        Collaborators {
            factory: Box::new(factory),
            device: Box::new(camera),
            surface: Box::new(TracingSurface::default()),
            notifier: Box::new(TracingNotifier),
            stats: Box::new(TracingStats),
        },
    )
    .await?;

    let panel = run_stdin_panel(config, proxy.clone());

    let mut watcher = proxy.clone();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            proxy.stop().await?;
        }
        _ = watcher.stopped() => {}
    }

    panel.abort();
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup_tracing();
    let args = Cli::parse();
    let config = load_config(&args)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .enable_io()
        .build()?;

    let result = rt.block_on(run(args, config));

    // A pending read on stdin would otherwise block the shutdown
    rt.shutdown_background();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("posewatch-engine").chain(args.iter().copied()))
    }

    #[test]
    fn flags_override_configuration_file() {
        let path = std::env::temp_dir().join(format!("posewatch-layering-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "model: BlazePose\ncapture:\n  target_fps: 30\nmodel_config:\n  max_poses: 3\n",
        )
        .unwrap();

        let args = cli(&["--config", path.to_str().unwrap(), "--type", "heavy", "--fps", "24"]);
        let config = load_config(&args).map(|c| c.snapshot());
        std::fs::remove_file(&path).unwrap();
        let config = config.unwrap();

        assert_eq!(config.model, ModelKind::BlazePose);
        assert_eq!(config.model_config.model_type, "heavy");
        assert_eq!(config.capture.target_fps, 24);
        assert_eq!(config.model_config.max_poses, 3);
        assert_eq!(config.capture.size, SizeOption::Vga);
    }

    #[test]
    fn flags_apply_over_defaults() {
        let args = cli(&["--model", "movenet", "--type", "multipose", "--max-poses", "4", "--size", "640 X 360"]);
        let config = load_config(&args).unwrap();

        let snapshot = config.snapshot();
        assert_eq!(snapshot.model_config.model_type, "multipose");
        assert_eq!(snapshot.model_config.max_poses, 4);
        assert_eq!(snapshot.capture.size, SizeOption::Wide);
        assert_eq!(snapshot.backend, "tfjs-webgl");

        let args = cli(&["--model", "blazepose"]);
        let snapshot = load_config(&args).unwrap().snapshot();
        assert_eq!(snapshot.model_config.model_type, "full");
    }

    #[test]
    fn rejects_unsupported_override() {
        let args = cli(&["--model", "posenet", "--backend", "tfjs-wasm"]);
        assert!(load_config(&args).is_err());
    }
}
