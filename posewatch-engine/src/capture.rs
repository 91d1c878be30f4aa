//! Capture collaborator contracts and the frame clock driving the loop.

use futures_util::future::BoxFuture;
use std::time::Duration;
use tokio::time::{self, Interval, MissedTickBehavior};

use posewatch_common::Frame;

use crate::config::CaptureParams;
use crate::error::{DeviceError, NotReadyError};

/// A live stream of frames from an opened device
pub trait CaptureSource: Send {
    /// True once the first frame has been produced
    fn is_ready(&self) -> bool;

    /// Resolves when the first frame is available
    fn wait_ready(&mut self) -> BoxFuture<'_, Result<(), DeviceError>>;

    fn current_frame(&mut self) -> Result<Frame, NotReadyError>;
}

/// Opens capture sources
pub trait CaptureDevice: Send {
    fn setup(&mut self, params: CaptureParams)
        -> BoxFuture<'_, Result<Box<dyn CaptureSource>, DeviceError>>;
}

fn frame_period(target_fps: u32) -> Duration {
    Duration::from_secs(1) / target_fps.max(1)
}

/// Per-frame callback of the host, ticking at the target frame rate
#[derive(Debug)]
pub struct FrameClock {
    interval: Interval,
}

impl FrameClock {
    pub fn new(target_fps: u32) -> Self {
        let mut interval = time::interval(frame_period(target_fps));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }

    /// Follow a new target frame rate, the first tick fires immediately
    pub fn retune(&mut self, target_fps: u32) {
        *self = Self::new(target_fps);
    }

    /// Drop the tick already scheduled, the next one is a full period away
    pub fn cancel_pending(&mut self) {
        self.interval.reset();
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn ticks_at_target_rate() {
        let mut clock = FrameClock::new(50);
        assert_eq!(clock.period(), Duration::from_millis(20));

        let start = Instant::now();
        clock.tick().await;
        clock.tick().await;
        clock.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_pending_postpones_next_tick() {
        let mut clock = FrameClock::new(10);
        clock.tick().await;

        time::sleep(Duration::from_millis(100)).await;
        let start = Instant::now();
        clock.cancel_pending();
        clock.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn retune_changes_period() {
        let mut clock = FrameClock::new(60);
        clock.retune(25);
        assert_eq!(clock.period(), Duration::from_millis(40));
    }
}
