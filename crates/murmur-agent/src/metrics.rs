//! Turn latency and token accounting

use murmur_ai::{Usage, UsageReport};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Latencies of one turn, in milliseconds since the turn started.
/// Zero means "not reached".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub time_to_first_token_ms: u64,
    pub time_to_first_content_ms: u64,
    pub time_to_completion_ms: u64,
}

/// Accumulates usage and latches latency instants for one turn.
///
/// Within a segment each usage field is last-write-wins; segments are summed.
#[derive(Debug)]
pub struct MetricsCollector {
    started: Instant,
    first_token: Option<Instant>,
    first_content: Option<Instant>,
    completed: Option<Instant>,
    finished_segments: Usage,
    segment: Usage,
}

impl MetricsCollector {
    /// Start the turn clock now
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            first_token: None,
            first_content: None,
            completed: None,
            finished_segments: Usage::default(),
            segment: Usage::default(),
        }
    }

    /// Close the current segment's usage and start a new one
    pub fn begin_segment(&mut self) {
        let segment = std::mem::take(&mut self.segment).with_derived_total();
        self.finished_segments.accumulate(&segment);
    }

    /// Apply a backend usage report to the current segment
    pub fn record_usage(&mut self, report: &UsageReport) {
        report.apply_to(&mut self.segment);
    }

    /// Latch the first backend output of any kind
    pub fn mark_token(&mut self) {
        if self.first_token.is_none() {
            self.first_token = Some(Instant::now());
        }
    }

    /// Latch the first answer text; implies a first token
    pub fn mark_content(&mut self) {
        self.mark_token();
        if self.first_content.is_none() {
            self.first_content = Some(Instant::now());
        }
    }

    /// Usage so far, summed across segments
    pub fn usage(&self) -> Usage {
        let mut usage = self.finished_segments;
        usage.accumulate(&self.segment.with_derived_total());
        usage
    }

    /// Latencies so far
    pub fn snapshot(&self) -> Metrics {
        let since_start = |instant: Option<Instant>| {
            instant
                .map(|i| millis(i.duration_since(self.started)))
                .unwrap_or(0)
        };
        Metrics {
            time_to_first_token_ms: since_start(self.first_token),
            time_to_first_content_ms: since_start(self.first_content),
            time_to_completion_ms: since_start(self.completed),
        }
    }

    /// Latch completion and return the final figures. Calling it again keeps
    /// the first completion instant.
    pub fn finish(&mut self) -> (Usage, Metrics) {
        if self.completed.is_none() {
            self.completed = Some(Instant::now());
        }
        (self.usage(), self.snapshot())
    }
}

pub(crate) fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
