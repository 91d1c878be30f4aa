//! Synthetic collaborators.
//!
//! The camera produces blank frames, the detector produces a swaying
//! skeleton. Both come with a probe that records what the orchestrator did
//! to them and lets a caller script failures, so the same types back the
//! demo binary and the tests.

use futures_util::future::{BoxFuture, FutureExt};
use glam::Vec2;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{self, Instant};

use posewatch_common::{BodyLayout, Frame, Keypoint, Pose, PoseResult, Resolution};

use crate::capture::{CaptureDevice, CaptureSource};
use crate::config::{CaptureParams, RuntimeFlags};
use crate::error::{DeviceError, InferenceError, LoadError, NotReadyError};
use crate::model::{Detector, DetectorFactory, EstimationOptions, ModelRequest, MoveNetType};
use crate::notify::Notifier;
use crate::render::{Color, Surface};
use crate::stats::{StatsReport, StatsSink};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct CameraState {
    setups: AtomicUsize,
    fail_setup: AtomicBool,
    fail_warmup: AtomicBool,
}

#[derive(Clone, Debug, Default)]
pub struct CameraProbe(Arc<CameraState>);

impl CameraProbe {
    /// Number of times the device was opened, failed attempts included
    pub fn setups(&self) -> usize {
        self.0.setups.load(Ordering::SeqCst)
    }

    pub fn fail_setup(&self, fail: bool) {
        self.0.fail_setup.store(fail, Ordering::SeqCst);
    }

    /// Sources opened from now on never produce their first frame
    pub fn fail_warmup(&self, fail: bool) {
        self.0.fail_warmup.store(fail, Ordering::SeqCst);
    }
}

/// Camera whose sources become ready after a warm-up delay
#[derive(Debug)]
pub struct SyntheticCamera {
    probe: CameraProbe,
    warmup: Duration,
}

impl SyntheticCamera {
    pub fn new(warmup: Duration) -> (Self, CameraProbe) {
        let probe = CameraProbe::default();
        (
            Self {
                probe: probe.clone(),
                warmup,
            },
            probe,
        )
    }
}

impl CaptureDevice for SyntheticCamera {
    fn setup(
        &mut self,
        params: CaptureParams,
    ) -> BoxFuture<'_, Result<Box<dyn CaptureSource>, DeviceError>> {
        async move {
            self.probe.0.setups.fetch_add(1, Ordering::SeqCst);
            if self.probe.0.fail_setup.load(Ordering::SeqCst) {
                return Err(DeviceError::Unavailable("synthetic camera disabled".into()));
            }
            tracing::debug!(?params, "synthetic camera opened");
            let source: Box<dyn CaptureSource> = Box::new(SyntheticSource {
                params,
                ready_at: Instant::now() + self.warmup,
                stalled: self.probe.0.fail_warmup.load(Ordering::SeqCst),
                sequence: 0,
            });
            Ok(source)
        }
        .boxed()
    }
}

#[derive(Debug)]
struct SyntheticSource {
    params: CaptureParams,
    ready_at: Instant,
    stalled: bool,
    sequence: u64,
}

impl CaptureSource for SyntheticSource {
    fn is_ready(&self) -> bool {
        !self.stalled && Instant::now() >= self.ready_at
    }

    fn wait_ready(&mut self) -> BoxFuture<'_, Result<(), DeviceError>> {
        let stalled = self.stalled;
        time::sleep_until(self.ready_at)
            .map(move |_| {
                if stalled {
                    return Err(DeviceError::Unavailable("no frame after warm-up".into()));
                }
                Ok(())
            })
            .boxed()
    }

    fn current_frame(&mut self) -> Result<Frame, NotReadyError> {
        if !self.is_ready() {
            return Err(NotReadyError);
        }
        self.sequence += 1;
        let resolution = self.params.size.resolution();
        Ok(Frame {
            sequence: self.sequence,
            resolution,
            storage: vec![0; resolution.w * resolution.h * 3],
        })
    }
}

pub type EstimateHook = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct ProbeState {
    created: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    disposed: AtomicUsize,
    estimates: AtomicUsize,
    used_after_dispose: AtomicUsize,
    requests: Mutex<Vec<ModelRequest>>,
    backends: Mutex<Vec<String>>,
    backend_failures: Mutex<VecDeque<LoadError>>,
    load_failures: Mutex<VecDeque<LoadError>>,
    estimate_failures: Mutex<VecDeque<InferenceError>>,
    estimate_hook: Mutex<Option<EstimateHook>>,
}

/// Observes and scripts the synthetic detectors
#[derive(Clone, Default)]
pub struct DetectorProbe(Arc<ProbeState>);

impl DetectorProbe {
    pub fn fail_next_backend(&self, err: LoadError) {
        lock(&self.0.backend_failures).push_back(err);
    }

    pub fn fail_next_load(&self, err: LoadError) {
        lock(&self.0.load_failures).push_back(err);
    }

    pub fn fail_next_estimate(&self, err: InferenceError) {
        lock(&self.0.estimate_failures).push_back(err);
    }

    /// Called with the running estimate count while the estimate is in flight
    pub fn on_estimate(&self, hook: EstimateHook) {
        *lock(&self.0.estimate_hook) = Some(hook);
    }

    pub fn created(&self) -> usize {
        self.0.created.load(Ordering::SeqCst)
    }

    /// Detectors created and not yet disposed
    pub fn live(&self) -> usize {
        self.0.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.0.max_live.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> usize {
        self.0.disposed.load(Ordering::SeqCst)
    }

    pub fn estimates(&self) -> usize {
        self.0.estimates.load(Ordering::SeqCst)
    }

    pub fn used_after_dispose(&self) -> usize {
        self.0.used_after_dispose.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        lock(&self.0.requests).clone()
    }

    pub fn backends(&self) -> Vec<String> {
        lock(&self.0.backends).clone()
    }
}

/// Builds synthetic detectors answering after a fixed latency
pub struct SyntheticFactory {
    probe: DetectorProbe,
    latency: Duration,
}

impl SyntheticFactory {
    pub fn new(latency: Duration) -> (Self, DetectorProbe) {
        let probe = DetectorProbe::default();
        (
            Self {
                probe: probe.clone(),
                latency,
            },
            probe,
        )
    }
}

fn check_model_url(url: &str) -> Result<(), LoadError> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(LoadError::Unreachable {
            url: url.to_string(),
            reason: "unsupported scheme".into(),
        });
    }
    if !url.ends_with("model.json") {
        return Err(LoadError::Malformed {
            url: url.to_string(),
            reason: "expected a graph model manifest".into(),
        });
    }
    Ok(())
}

impl DetectorFactory for SyntheticFactory {
    fn apply_backend<'a>(
        &'a mut self,
        backend: &'a str,
        flags: &'a RuntimeFlags,
    ) -> BoxFuture<'a, Result<(), LoadError>> {
        async move {
            tracing::debug!(backend, flags = flags.len(), "synthetic backend selected");
            lock(&self.probe.0.backends).push(backend.to_string());
            match lock(&self.probe.0.backend_failures).pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
        .boxed()
    }

    fn create<'a>(
        &'a mut self,
        request: &'a ModelRequest,
    ) -> BoxFuture<'a, Result<Box<dyn Detector>, LoadError>> {
        async move {
            let state = &self.probe.0;
            lock(&state.requests).push(request.clone());

            if let Some(err) = lock(&state.load_failures).pop_front() {
                return Err(err);
            }

            let mut multi = false;
            if let ModelRequest::MoveNet(params) = request {
                if let Some(url) = &params.model_url {
                    check_model_url(url)?;
                }
                multi = params.model_type == MoveNetType::MultiPoseLightning;
            }

            state.created.fetch_add(1, Ordering::SeqCst);
            let live = state.live.fetch_add(1, Ordering::SeqCst) + 1;
            state.max_live.fetch_max(live, Ordering::SeqCst);

            let detector: Box<dyn Detector> = Box::new(SyntheticDetector {
                probe: self.probe.clone(),
                layout: request.layout(),
                multi,
                latency: self.latency,
                disposed: false,
            });
            Ok(detector)
        }
        .boxed()
    }
}

struct SyntheticDetector {
    probe: DetectorProbe,
    layout: BodyLayout,
    multi: bool,
    latency: Duration,
    disposed: bool,
}

impl SyntheticDetector {
    fn poses(&self, frame: &Frame, options: EstimationOptions) -> PoseResult {
        let people = if self.multi { options.max_poses.min(2) } else { 1 };
        let count = self.layout.names().len();
        let Resolution { w, h } = frame.resolution;
        let sway = (frame.sequence as f32 * 0.1).sin() * 20.0;

        (0..people)
            .map(|person| {
                let center = Vec2::new(
                    w as f32 * (person + 1) as f32 / (people + 1) as f32 + sway,
                    h as f32 * 0.3,
                );
                let keypoints = (0..count)
                    .map(|i| {
                        let side = if i % 2 == 0 { -1.0 } else { 1.0 };
                        let mut position = center + Vec2::new(side * 15.0, i as f32 * 8.0);
                        if options.flip_horizontal {
                            position.x = w as f32 - position.x;
                        }
                        Keypoint {
                            position,
                            score: Some(0.9),
                        }
                    })
                    .collect();
                Pose {
                    keypoints,
                    score: Some(0.9),
                    id: self.multi.then_some(person + 1),
                }
            })
            .collect()
    }
}

impl Detector for SyntheticDetector {
    fn estimate<'a>(
        &'a mut self,
        frame: &'a Frame,
        options: EstimationOptions,
    ) -> BoxFuture<'a, Result<PoseResult, InferenceError>> {
        async move {
            let state = &self.probe.0;
            let count = state.estimates.fetch_add(1, Ordering::SeqCst) + 1;
            if self.disposed {
                state.used_after_dispose.fetch_add(1, Ordering::SeqCst);
                return Err(InferenceError::Disposed);
            }

            let hook = lock(&state.estimate_hook).clone();
            if let Some(hook) = hook {
                hook(count);
            }

            time::sleep(self.latency).await;

            if let Some(err) = lock(&state.estimate_failures).pop_front() {
                return Err(err);
            }
            Ok(self.poses(frame, options))
        }
        .boxed()
    }

    fn dispose(&mut self) -> BoxFuture<'_, ()> {
        async move {
            if !self.disposed {
                self.disposed = true;
                self.probe.0.disposed.fetch_add(1, Ordering::SeqCst);
                self.probe.0.live.fetch_sub(1, Ordering::SeqCst);
            }
        }
        .boxed()
    }
}

/// What was drawn for one frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedFrame {
    pub sequence: u64,
    pub keypoints: usize,
    pub segments: usize,
    pub border: bool,
}

#[derive(Clone, Debug, Default)]
pub struct RecordingSurface(Arc<Mutex<Vec<RenderedFrame>>>);

impl RecordingSurface {
    pub fn frames(&self) -> Vec<RenderedFrame> {
        lock(&self.0).clone()
    }
}

impl Surface for RecordingSurface {
    fn draw_frame(&mut self, frame: &Frame) {
        lock(&self.0).push(RenderedFrame {
            sequence: frame.sequence,
            ..Default::default()
        });
    }

    fn draw_keypoint(&mut self, _at: Vec2, _color: Color) {
        if let Some(last) = lock(&self.0).last_mut() {
            last.keypoints += 1;
        }
    }

    fn draw_segment(&mut self, _from: Vec2, _to: Vec2, _color: Color) {
        if let Some(last) = lock(&self.0).last_mut() {
            last.segments += 1;
        }
    }

    fn draw_border(&mut self, _resolution: Resolution) {
        if let Some(last) = lock(&self.0).last_mut() {
            last.border = true;
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier(Arc<Mutex<Vec<String>>>);

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<String> {
        lock(&self.0).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn alert(&mut self, message: &str) {
        lock(&self.0).push(message.to_string());
    }
}

#[derive(Clone, Debug, Default)]
pub struct RecordingStats(Arc<Mutex<Vec<StatsReport>>>);

impl RecordingStats {
    pub fn reports(&self) -> Vec<StatsReport> {
        lock(&self.0).clone()
    }
}

impl StatsSink for RecordingStats {
    fn report(&mut self, report: &StatsReport, _max_rate: f64) {
        lock(&self.0).push(*report);
    }
}
