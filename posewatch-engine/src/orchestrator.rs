//! Detector lifecycle and render loop.
//!
//! The orchestrator is an actor: it owns the capture source and the detector,
//! ticks on the frame clock and is controlled through an
//! [`OrchestratorProxy`]. Each tick reconciles pending configuration changes,
//! runs one inference and renders the frame. Ticks never overlap, the next
//! one is only awaited once the previous one has fully resolved.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use posewatch_common::Frame;

use crate::capture::{CaptureDevice, CaptureSource, FrameClock};
use crate::config::{CaptureParams, ConfigHandle, Configuration};
use crate::error::{DeviceError, EngineError, LoadError};
use crate::model::{DetectorFactory, Epoch, Estimation, LiveDetector, ModelRequest};
use crate::notify::Notifier;
use crate::render::{Overlay, Surface};
use crate::stats::{InferenceStats, StatsSink, PANEL_MAX_RATE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopStatus {
    pub state: LoopState,
    pub epoch: Epoch,
    pub detector_live: bool,
    pub ticks: u64,
    /// Last reported inference rate
    pub last_rate: Option<f64>,
}

enum Command {
    Status {
        respond_to: oneshot::Sender<LoopStatus>,
    },
    Stop {
        respond_to: oneshot::Sender<()>,
    },
}

/// External collaborators driven by the orchestrator
pub struct Collaborators {
    pub factory: Box<dyn DetectorFactory>,
    pub device: Box<dyn CaptureDevice>,
    pub surface: Box<dyn Surface>,
    pub notifier: Box<dyn Notifier>,
    pub stats: Box<dyn StatsSink>,
}

#[derive(Clone, Debug)]
pub struct OrchestratorProxy {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<LoopState>,
}

impl OrchestratorProxy {
    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub async fn status(&self) -> Result<LoopStatus, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Status { respond_to: tx })
            .await
            .map_err(|_| EngineError::NotRunning)?;
        rx.await.map_err(|_| EngineError::NotRunning)
    }

    /// Cancel the loop and dispose the detector
    pub async fn stop(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stop { respond_to: tx })
            .await
            .map_err(|_| EngineError::NotRunning)?;
        rx.await.map_err(|_| EngineError::NotRunning)
    }

    /// Resolves once the loop reached its terminal state
    pub async fn stopped(&mut self) {
        let _ = self.state.wait_for(|s| *s == LoopState::Stopped).await;
    }
}

pub struct Orchestrator {
    config: ConfigHandle,
    factory: Box<dyn DetectorFactory>,
    device: Box<dyn CaptureDevice>,
    surface: Box<dyn Surface>,
    notifier: Box<dyn Notifier>,
    stats_sink: Box<dyn StatsSink>,

    capture: Option<Box<dyn CaptureSource>>,
    detector: Option<LiveDetector>,
    overlay: Option<Overlay>,

    /// Generation of the current detector, results of older ones are stale
    epoch: Epoch,
    /// Set while the detector is being replaced
    reconfiguring: bool,

    stats: InferenceStats,
    last_rate: Option<f64>,
    clock: FrameClock,
    ticks: u64,
    state: watch::Sender<LoopState>,
}

impl Orchestrator {
    pub fn new(config: ConfigHandle, collaborators: Collaborators) -> Self {
        let target_fps = config.snapshot().capture.target_fps;
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            config,
            factory: collaborators.factory,
            device: collaborators.device,
            surface: collaborators.surface,
            notifier: collaborators.notifier,
            stats_sink: collaborators.stats,
            capture: None,
            detector: None,
            overlay: None,
            epoch: Epoch::default(),
            reconfiguring: false,
            stats: InferenceStats::new(Instant::now()),
            last_rate: None,
            clock: FrameClock::new(target_fps),
            ticks: 0,
            state,
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Open the capture source and spawn the render loop.
    /// Fails without entering `Running` when the camera cannot be opened.
    pub async fn start(mut self) -> Result<OrchestratorProxy, EngineError> {
        self.prepare().await?;

        let (tx, rx) = mpsc::channel(100);
        let proxy = OrchestratorProxy {
            commands: tx,
            state: self.state.subscribe(),
        };

        self.state.send_replace(LoopState::Running);
        tokio::spawn(self.run(rx));
        Ok(proxy)
    }

    #[tracing::instrument(skip_all)]
    async fn prepare(&mut self) -> Result<(), DeviceError> {
        // The first detector and source already reflect anything raised so far
        let _ = self.config.take_capture_changes();
        let _ = self.config.take_model_changes();
        let config = self.config.snapshot();

        tracing::info!("opening capture device");
        let source = match self.device.setup(config.capture).await {
            Ok(source) => source,
            Err(err) => {
                self.notifier.alert(&format!("unable to open the camera: {err}"));
                return Err(err);
            }
        };
        self.capture = Some(source);
        self.clock.retune(config.capture.target_fps);

        self.reload_detector(true).await;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        tracing::info!("render loop started");
        loop {
            tokio::select! {
                biased;

                // Handle commands from the proxies
                cmd = commands.recv() => match cmd {
                    Some(Command::Status { respond_to }) => {
                        let _ = respond_to.send(self.status());
                    }
                    Some(Command::Stop { respond_to }) => {
                        self.shutdown().await;
                        let _ = respond_to.send(());
                        return;
                    }
                    None => {
                        tracing::info!("all proxies dropped");
                        self.shutdown().await;
                        return;
                    }
                },

                // Host frame callback
                _ = self.clock.tick() => {
                    if let Err(err) = self.tick().await {
                        self.notifier.alert(&format!("capture failed: {err}"));
                        self.shutdown().await;
                        return;
                    }
                }
            }
        }
    }

    fn status(&self) -> LoopStatus {
        LoopStatus {
            state: self.state(),
            epoch: self.epoch,
            detector_live: self.detector.is_some(),
            ticks: self.ticks,
            last_rate: self.last_rate,
        }
    }

    async fn shutdown(&mut self) {
        if let Some(live) = self.detector.take() {
            live.dispose().await;
        }
        self.overlay = None;
        self.capture = None;
        self.state.send_replace(LoopState::Stopped);
        tracing::info!("render loop stopped");
    }

    /// One iteration of the loop, only a capture failure is an error
    #[tracing::instrument(skip_all, fields(tick = self.ticks + 1))]
    async fn tick(&mut self) -> Result<(), DeviceError> {
        self.ticks += 1;
        self.reconcile().await?;

        // Raised while reconciling, handled by the next tick
        if self.config.pending().model_related() {
            tracing::debug!("model change pending, skip rendering");
            return Ok(());
        }

        let frame = self.next_frame().await?;
        let estimation = self.infer(&frame).await;
        self.render(&frame, estimation);
        Ok(())
    }

    async fn reconcile(&mut self) -> Result<(), DeviceError> {
        let (capture_changes, params) = self.config.take_capture_changes();
        if capture_changes.capture_related() {
            self.reinit_capture(params).await?;
        }

        let model_changes = self.config.take_model_changes();
        if model_changes.model_related() {
            self.reload_detector(model_changes.needs_backend()).await;
        }
        Ok(())
    }

    async fn reinit_capture(&mut self, params: CaptureParams) -> Result<(), DeviceError> {
        tracing::info!(fps = params.target_fps, size = ?params.size, "reinitializing capture");
        self.capture = None;
        let source = self.device.setup(params).await?;
        self.capture = Some(source);
        self.clock.retune(params.target_fps);
        Ok(())
    }

    /// Replace the detector. The previous one is always disposed before the
    /// next one is built, a failure leaves no detector.
    #[tracing::instrument(skip(self))]
    async fn reload_detector(&mut self, apply_backend: bool) {
        self.reconfiguring = true;
        self.epoch = self.epoch.next();
        self.clock.cancel_pending();
        self.overlay = None;

        if let Some(previous) = self.detector.take() {
            previous.dispose().await;
        }

        let config = self.config.snapshot();
        match self.load_detector(&config, apply_backend).await {
            Ok(live) => {
                tracing::info!(
                    epoch = live.epoch.0,
                    model = %live.request.kind(),
                    backend = %config.backend,
                    "detector ready"
                );
                self.overlay = Some(Overlay::new(&live.request, &config));
                self.detector = Some(live);
            }
            Err(err) => {
                tracing::warn!(epoch = self.epoch.0, "detector construction failed");
                self.notifier
                    .alert(&format!("unable to load {}: {err}", config.model));
            }
        }

        self.reconfiguring = false;
    }

    async fn load_detector(
        &mut self,
        config: &Configuration,
        apply_backend: bool,
    ) -> Result<LiveDetector, LoadError> {
        if apply_backend {
            self.factory
                .apply_backend(&config.backend, &config.flags)
                .await?;
        }

        let request = ModelRequest::from_config(config)?;
        tracing::debug!(?request, "creating detector");
        let detector = self.factory.create(&request).await?;
        Ok(LiveDetector {
            detector,
            request,
            epoch: self.epoch,
        })
    }

    /// Current frame of the source, waiting for the first one if needed
    async fn next_frame(&mut self) -> Result<Frame, DeviceError> {
        let capture = self.capture.as_mut().ok_or(DeviceError::Closed)?;
        if !capture.is_ready() {
            tracing::debug!("waiting for the first frame");
            capture.wait_ready().await?;
        }
        capture
            .current_frame()
            .map_err(|err| DeviceError::Unavailable(err.to_string()))
    }

    /// Run the detector on the frame. A failing detector is dropped and the
    /// tick degrades to no poses.
    async fn infer(&mut self, frame: &Frame) -> Option<Estimation> {
        if self.reconfiguring {
            return None;
        }
        let live = self.detector.as_mut()?;
        let epoch = live.epoch;
        let options = self.config.estimation_options();

        let started = Instant::now();
        let outcome = live.detector.estimate(frame, options).await;
        let finished = Instant::now();

        if let Some(report) = self.stats.record(finished - started, finished) {
            self.stats_sink.report(&report, PANEL_MAX_RATE);
            self.last_rate = Some(report.rate);
        }

        match outcome {
            Ok(poses) => Some(Estimation { poses, epoch }),
            Err(err) => {
                if let Some(failed) = self.detector.take() {
                    failed.dispose().await;
                }
                self.overlay = None;
                self.notifier.alert(&format!("pose estimation failed: {err}"));
                None
            }
        }
    }

    /// Results of another generation, or raced by a pending model change, are not drawn
    fn is_current(&self, estimation: &Estimation) -> bool {
        !self.reconfiguring
            && estimation.epoch == self.epoch
            && !self.config.pending().model_related()
    }

    fn render(&mut self, frame: &Frame, estimation: Option<Estimation>) {
        self.surface.draw_frame(frame);

        if let Some(estimation) = estimation {
            if !self.is_current(&estimation) {
                tracing::debug!(epoch = estimation.epoch.0, "discarding stale pose result");
            } else if let Some(overlay) = &self.overlay {
                overlay.draw(self.surface.as_mut(), &estimation.poses);
            }
        }

        self.surface.draw_border(frame.resolution);
    }
}

/// Build the orchestrator and start its render loop
pub async fn run_orchestrator(
    config: &ConfigHandle,
    collaborators: Collaborators,
) -> Result<OrchestratorProxy, EngineError> {
    Orchestrator::new(config.clone(), collaborators).start().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::{ChangeFlags, FlagValue, ModelKind, SizeOption};
    use crate::error::InferenceError;
    use crate::mock::*;
    use crate::model::{MoveNetParams, MoveNetType};

    const LATENCY: Duration = Duration::from_millis(20);

    struct Harness {
        config: ConfigHandle,
        camera: CameraProbe,
        detector: DetectorProbe,
        surface: RecordingSurface,
        notifier: RecordingNotifier,
        stats: RecordingStats,
    }

    fn harness(config: Configuration) -> (Orchestrator, Harness) {
        let config = ConfigHandle::new(config);
        let (camera, camera_probe) = SyntheticCamera::new(Duration::from_millis(50));
        let (factory, detector_probe) = SyntheticFactory::new(LATENCY);
        let surface = RecordingSurface::default();
        let notifier = RecordingNotifier::default();
        let stats = RecordingStats::default();

        let orchestrator = Orchestrator::new(
            config.clone(),
            Collaborators {
                factory: Box::new(factory),
                device: Box::new(camera),
                surface: Box::new(surface.clone()),
                notifier: Box::new(notifier.clone()),
                stats: Box::new(stats.clone()),
            },
        );

        (
            orchestrator,
            Harness {
                config,
                camera: camera_probe,
                detector: detector_probe,
                surface,
                notifier,
                stats,
            },
        )
    }

    async fn prepared() -> (Orchestrator, Harness) {
        let (mut orchestrator, h) = harness(Configuration::default());
        orchestrator.prepare().await.unwrap();
        (orchestrator, h)
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_for_camera_and_draws_poses() {
        let (mut orchestrator, h) = prepared().await;
        assert_eq!(h.detector.created(), 1);
        assert_eq!(h.detector.backends(), vec!["tfjs-webgl".to_string()]);

        let start = Instant::now();
        orchestrator.tick().await.unwrap();
        // warm-up of the camera plus one inference
        assert!(start.elapsed() >= Duration::from_millis(50) + LATENCY);

        orchestrator.tick().await.unwrap();
        let frames = h.surface.frames();
        assert_eq!(frames.len(), 2);
        for frame in &frames {
            assert_eq!(frame.keypoints, 17);
            assert_eq!(frame.segments, 16);
            assert!(frame.border);
        }
        assert_eq!(frames[1].sequence, 2);
        assert!(h.notifier.alerts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn custom_model_request_reaches_factory() {
        let (mut orchestrator, h) = prepared().await;
        h.config.set_model_type("thunder").unwrap();
        h.config.set_custom_model("https://x/model.json");
        orchestrator.tick().await.unwrap();

        let requests = h.detector.requests();
        assert_eq!(
            requests[0],
            ModelRequest::MoveNet(MoveNetParams {
                model_type: MoveNetType::SinglePoseLightning,
                model_url: None,
                enable_tracking: None,
                tracker: None,
            })
        );
        assert_eq!(
            requests[1],
            ModelRequest::MoveNet(MoveNetParams {
                model_type: MoveNetType::SinglePoseThunder,
                model_url: Some("https://x/model.json".into()),
                enable_tracking: None,
                tracker: None,
            })
        );
        // Only the model changed, the backend is not applied again
        assert_eq!(h.detector.backends().len(), 1);
        assert_eq!(orchestrator.epoch, Epoch(2));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_load_renders_raw_frames_until_reselection() {
        let (mut orchestrator, h) = prepared().await;

        h.config.set_custom_model("https://x/weights.bin");
        orchestrator.tick().await.unwrap();
        orchestrator.tick().await.unwrap();

        assert_eq!(h.notifier.alerts().len(), 1);
        assert!(h.notifier.alerts()[0].contains("malformed"));
        assert_eq!(h.detector.live(), 0);
        assert!(!orchestrator.reconfiguring);
        let frames = h.surface.frames();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.keypoints == 0 && f.border));

        // No automatic retry
        orchestrator.tick().await.unwrap();
        assert_eq!(h.detector.requests().len(), 2);

        h.config.set_custom_model("");
        orchestrator.tick().await.unwrap();
        assert_eq!(h.detector.live(), 1);
        assert_eq!(h.surface.frames().last().unwrap().keypoints, 17);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_inference_drops_detector() {
        let (mut orchestrator, h) = prepared().await;
        h.detector
            .fail_next_estimate(InferenceError::MalformedOutput("NaN heatmap".into()));

        orchestrator.tick().await.unwrap();
        assert_eq!(h.detector.live(), 0);
        assert_eq!(h.detector.disposed(), 1);
        assert_eq!(h.notifier.alerts().len(), 1);

        orchestrator.tick().await.unwrap();
        assert_eq!(h.detector.estimates(), 1);
        let frames = h.surface.frames();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.keypoints == 0 && f.border));
    }

    #[tokio::test(start_paused = true)]
    async fn model_change_during_inference_discards_result() {
        let (mut orchestrator, h) = prepared().await;
        let config = h.config.clone();
        h.detector.on_estimate(Arc::new(move |count| {
            if count == 1 {
                config.set_model_type("thunder").unwrap();
            }
        }));

        orchestrator.tick().await.unwrap();
        let frames = h.surface.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].keypoints, 0);
        assert!(frames[0].border);

        orchestrator.tick().await.unwrap();
        assert_eq!(h.detector.created(), 2);
        assert_eq!(h.surface.frames()[1].keypoints, 17);
    }

    #[tokio::test(start_paused = true)]
    async fn capture_and_model_reinitialize_in_same_tick() {
        let (mut orchestrator, h) = prepared().await;
        h.config.set_target_fps(30).unwrap();
        h.config.set_size(SizeOption::Small);
        h.config.set_backend("tfjs-wasm").unwrap();

        orchestrator.tick().await.unwrap();
        assert_eq!(h.camera.setups(), 2);
        assert_eq!(h.detector.created(), 2);
        assert_eq!(h.detector.backends().last().unwrap(), "tfjs-wasm");
        assert_eq!(orchestrator.clock.period(), Duration::from_secs(1) / 30);
        assert_eq!(h.config.pending(), ChangeFlags::default());
        // New source restarts its sequence
        assert_eq!(h.surface.frames()[0].sequence, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn never_more_than_one_detector_alive() {
        let (mut orchestrator, h) = prepared().await;

        h.config.set_model(ModelKind::BlazePose);
        orchestrator.tick().await.unwrap();
        h.config.set_flag("WEBGL_PACK", FlagValue::Bool(false));
        h.config.set_backend("tfjs-webgl").unwrap();
        orchestrator.tick().await.unwrap();
        h.detector.fail_next_load(LoadError::Backend {
            backend: "tfjs-webgl".into(),
            reason: "context lost".into(),
        });
        h.config.set_model(ModelKind::PoseNet);
        orchestrator.tick().await.unwrap();
        h.config.set_model(ModelKind::MoveNet);
        h.config.set_model_type("multipose").unwrap();
        h.config.set_max_poses(2).unwrap();
        orchestrator.tick().await.unwrap();
        orchestrator.tick().await.unwrap();

        assert_eq!(h.detector.max_live(), 1);
        assert_eq!(h.detector.live(), 1);
        assert_eq!(h.detector.used_after_dispose(), 0);
        assert_eq!(h.notifier.alerts().len(), 1);
        // Multi-pose detector draws both synthetic people
        assert_eq!(h.surface.frames().last().unwrap().keypoints, 34);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_inference_rate() {
        let (mut orchestrator, h) = prepared().await;
        for _ in 0..60 {
            orchestrator.tick().await.unwrap();
        }

        let reports = h.stats.reports();
        assert!(!reports.is_empty());
        assert_eq!(reports[0].average, LATENCY);
        assert!((reports[0].rate - 50.0).abs() < 1e-6);
        assert_eq!(orchestrator.last_rate, Some(reports.last().unwrap().rate));
    }

    #[tokio::test(start_paused = true)]
    async fn camera_failure_prevents_start() {
        let (orchestrator, h) = harness(Configuration::default());
        h.camera.fail_setup(true);

        let result = orchestrator.start().await;
        assert!(matches!(result, Err(EngineError::Device(DeviceError::Unavailable(_)))));
        assert_eq!(h.detector.created(), 0);
        assert_eq!(h.notifier.alerts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_runs_until_stopped() {
        let (orchestrator, h) = harness(Configuration::default());
        assert_eq!(orchestrator.state(), LoopState::Idle);
        let proxy = orchestrator.start().await.unwrap();
        assert_eq!(proxy.state(), LoopState::Running);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let status = proxy.status().await.unwrap();
        assert_eq!(status.state, LoopState::Running);
        assert!(status.detector_live);
        assert!(status.ticks > 1);

        proxy.stop().await.unwrap();
        assert_eq!(proxy.state(), LoopState::Stopped);
        assert_eq!(h.detector.live(), 0);
        assert!(matches!(proxy.status().await, Err(EngineError::NotRunning)));
    }

    #[tokio::test(start_paused = true)]
    async fn backend_failure_renders_raw_frames() {
        let (mut orchestrator, h) = prepared().await;
        h.detector.fail_next_backend(LoadError::Backend {
            backend: "tfjs-wasm".into(),
            reason: "missing SIMD support".into(),
        });
        h.config.set_backend("tfjs-wasm").unwrap();

        orchestrator.tick().await.unwrap();
        orchestrator.tick().await.unwrap();

        assert_eq!(h.detector.created(), 1);
        assert_eq!(h.detector.live(), 0);
        assert!(!orchestrator.reconfiguring);
        let alerts = h.notifier.alerts();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].contains("tfjs-wasm"));
        let frames = h.surface.frames();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.keypoints == 0 && f.border));
    }

    #[tokio::test(start_paused = true)]
    async fn camera_without_first_frame_stops_loop() {
        let (orchestrator, h) = harness(Configuration::default());
        h.camera.fail_warmup(true);
        let mut proxy = orchestrator.start().await.unwrap();
        assert_eq!(h.detector.live(), 1);

        proxy.stopped().await;
        assert_eq!(h.detector.live(), 0);
        assert_eq!(h.detector.estimates(), 0);
        assert!(h.surface.frames().is_empty());
        let alerts = h.notifier.alerts();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].contains("capture failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn camera_failure_while_running_stops_loop() {
        let (orchestrator, h) = harness(Configuration::default());
        let mut proxy = orchestrator.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        h.camera.fail_setup(true);
        h.config.set_size(SizeOption::Wide);
        proxy.stopped().await;

        assert_eq!(proxy.state(), LoopState::Stopped);
        assert_eq!(h.detector.live(), 0);
        assert!(h.notifier.alerts().iter().any(|a| a.contains("capture failed")));
    }
}
