//! Sample filters and render sinks applied to complete frames
//!
//! Both stages are synchronous and run in the relay's per-connection task,
//! between a successful read and the publish. They only ever see whole frames.

use tracing::info;

use crate::types::Frame;
use crate::{BridgeError, Result};

/// Default moving-average window
pub const DEFAULT_WINDOW: usize = 10;

/// Transforms the samples of one frame before they are published
pub trait SampleFilter: Send + Sync {
    /// Filter one frame's samples; the output may be shorter than the input
    fn filter(&mut self, samples: Vec<u16>) -> Vec<u16>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Local consumer of published frames, used for debugging
pub trait SampleSink: Send + Sync {
    fn render(&mut self, frame: &Frame);
}

/// Filter that returns samples unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl SampleFilter for Passthrough {
    fn filter(&mut self, samples: Vec<u16>) -> Vec<u16> {
        samples
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }
}

/// Trailing moving average over a fixed window
///
/// Produces one output per full window, so a frame of `len` samples becomes
/// `len - window + 1` samples, and a frame shorter than the window becomes
/// empty. Averages are rounded to the nearest integer, halves rounding up.
#[derive(Debug, Clone, Copy)]
pub struct MovingAverage {
    window: usize,
}

impl MovingAverage {
    /// # Errors
    ///
    /// [`BridgeError::Config`] if `window` is zero
    pub fn new(window: usize) -> Result<Self> {
        if window == 0 {
            return Err(BridgeError::config("filter.window", "moving average window must be at least 1"));
        }
        Ok(Self { window })
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

impl Default for MovingAverage {
    fn default() -> Self {
        Self { window: DEFAULT_WINDOW }
    }
}

impl SampleFilter for MovingAverage {
    fn filter(&mut self, samples: Vec<u16>) -> Vec<u16> {
        let n = self.window;
        if samples.len() < n {
            return Vec::new();
        }

        let divisor = n as u64;
        let mut sum: u64 = samples[..n].iter().map(|s| u64::from(*s)).sum();
        let mut averaged = Vec::with_capacity(samples.len() - n + 1);
        averaged.push(rounded_mean(sum, divisor));

        for (leaving, entering) in samples.iter().zip(&samples[n..]) {
            sum = sum + u64::from(*entering) - u64::from(*leaving);
            averaged.push(rounded_mean(sum, divisor));
        }
        averaged
    }

    fn name(&self) -> &'static str {
        "movingAverage"
    }
}

// The mean of u16 values always fits in u16
fn rounded_mean(sum: u64, count: u64) -> u16 {
    ((2 * sum + count) / (2 * count)) as u16
}

/// Sink that discards every frame
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl SampleSink for NoopSink {
    fn render(&mut self, _frame: &Frame) {}
}

/// Sink that logs a one-line summary of each frame
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink {
    rendered: u64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames rendered so far
    pub fn rendered(&self) -> u64 {
        self.rendered
    }
}

impl SampleSink for LogSink {
    fn render(&mut self, frame: &Frame) {
        self.rendered += 1;

        let Some(summary) = FrameSummary::of(&frame.samples) else {
            info!(sequence = frame.sequence, "Received empty frame");
            return;
        };

        info!(
            sequence = frame.sequence,
            samples = summary.count,
            min = summary.min,
            max = summary.max,
            mean = summary.mean,
            "Received {} values",
            summary.count
        );
    }
}

/// Count, range and mean of a frame's samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSummary {
    pub count: usize,
    pub min: u16,
    pub max: u16,
    pub mean: f64,
}

impl FrameSummary {
    /// `None` for an empty frame
    pub fn of(samples: &[u16]) -> Option<Self> {
        let min = *samples.iter().min()?;
        let max = *samples.iter().max()?;
        let total: u64 = samples.iter().map(|s| u64::from(*s)).sum();
        Some(Self { count: samples.len(), min, max, mean: total as f64 / samples.len() as f64 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn passthrough_keeps_samples() {
        assert_eq!(Passthrough.filter(vec![3, 1, 2]), vec![3, 1, 2]);
    }

    #[test]
    fn moving_average_of_ramp() {
        let mut filter = MovingAverage::new(3).unwrap();
        assert_eq!(filter.filter(vec![0, 3, 6, 9, 12]), vec![3, 6, 9]);
    }

    #[test]
    fn moving_average_rounds_half_up() {
        let mut filter = MovingAverage::new(2).unwrap();
        assert_eq!(filter.filter(vec![1, 2, 2, 2]), vec![2, 2, 2]);
        assert_eq!(filter.filter(vec![0, 1]), vec![1]);
    }

    #[test]
    fn short_frame_becomes_empty() {
        let mut filter = MovingAverage::default();
        assert_eq!(filter.window(), 10);
        assert!(filter.filter(vec![1; 9]).is_empty());
        assert_eq!(filter.filter(vec![7; 10]), vec![7]);
    }

    #[test]
    fn zero_window_is_rejected() {
        assert!(matches!(MovingAverage::new(0), Err(BridgeError::Config { .. })));
    }

    #[test]
    fn summary_of_frame() {
        let summary = FrameSummary::of(&[4, 1, 7]).unwrap();
        assert_eq!((summary.count, summary.min, summary.max), (3, 1, 7));
        assert!((summary.mean - 4.0).abs() < f64::EPSILON);
        assert!(FrameSummary::of(&[]).is_none());
    }

    #[test]
    fn log_sink_counts_frames() {
        let mut sink = LogSink::new();
        sink.render(&Frame::new(vec![1, 2], 1));
        sink.render(&Frame::new(Vec::new(), 2));
        assert_eq!(sink.rendered(), 2);
    }

    proptest! {
        #[test]
        fn moving_average_length_and_bounds(
            samples in prop::collection::vec(any::<u16>(), 0..200),
            window in 1usize..20
        ) {
            let mut filter = MovingAverage::new(window).unwrap();
            let averaged = filter.filter(samples.clone());

            prop_assert_eq!(averaged.len(), samples.len().saturating_sub(window - 1));
            if let (Some(lo), Some(hi)) = (samples.iter().min(), samples.iter().max()) {
                prop_assert!(averaged.iter().all(|v| v >= lo && v <= hi));
            }
        }

        #[test]
        fn window_of_one_is_identity(samples in prop::collection::vec(any::<u16>(), 0..100)) {
            let mut filter = MovingAverage::new(1).unwrap();
            prop_assert_eq!(filter.filter(samples.clone()), samples);
        }
    }
}
