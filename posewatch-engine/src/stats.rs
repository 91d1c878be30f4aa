use std::time::Duration;
use tokio::time::Instant;

/// How often the inference rate is reported
pub const REPORT_INTERVAL: Duration = Duration::from_millis(1000);

/// Upper bound of the statistics panel graph
pub const PANEL_MAX_RATE: f64 = 120.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsReport {
    pub average: Duration,
    /// Inferences per second derived from the average latency
    pub rate: f64,
    pub samples: u32,
}

/// Statistics panel
pub trait StatsSink: Send {
    fn report(&mut self, report: &StatsReport, max_rate: f64);
}

/// Rolling inference latency accumulator
#[derive(Debug)]
pub struct InferenceStats {
    sum: Duration,
    count: u32,
    last_report: Instant,
}

impl InferenceStats {
    pub fn new(now: Instant) -> Self {
        Self {
            sum: Duration::ZERO,
            count: 0,
            last_report: now,
        }
    }

    /// Add the duration of a completed inference, returns a report once per interval
    pub fn record(&mut self, elapsed: Duration, now: Instant) -> Option<StatsReport> {
        self.sum += elapsed;
        self.count += 1;
        self.report_due(now)
    }

    pub fn report_due(&mut self, now: Instant) -> Option<StatsReport> {
        if now.saturating_duration_since(self.last_report) < REPORT_INTERVAL || self.count == 0 {
            return None;
        }

        let average = self.sum / self.count;
        let millis = average.as_secs_f64() * 1000.0;
        let report = StatsReport {
            average,
            rate: if millis > 0.0 { 1000.0 / millis } else { f64::INFINITY },
            samples: self.count,
        };

        self.sum = Duration::ZERO;
        self.count = 0;
        self.last_report = now;
        Some(report)
    }
}

/// Reports the inference rate to the log
#[derive(Debug, Default)]
pub struct TracingStats;

impl StatsSink for TracingStats {
    fn report(&mut self, report: &StatsReport, max_rate: f64) {
        tracing::info!(
            "inference: {:.1}/s ({:.1} ms avg over {} samples)",
            report.rate.min(max_rate),
            report.average.as_secs_f64() * 1000.0,
            report.samples
        );
    }
}
