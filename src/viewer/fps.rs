//! Smoothed frames-per-second estimate.

use std::time::Instant;

/// Exponentially smoothed frame rate.
///
/// The first tick only records the time. The second yields `1/dt`, later
/// ticks `0.9 * fps + 0.1 / dt`. Zero intervals leave the estimate unchanged.
#[derive(Debug, Default, Clone)]
pub struct FpsCounter {
    last_tick: Option<Instant>,
    fps: Option<f64>,
}

impl FpsCounter {
    /// New counter without any tick.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame at `now` and return the current estimate, if any.
    pub fn tick(&mut self, now: Instant) -> Option<f64> {
        if let Some(last) = self.last_tick {
            let dt = now.saturating_duration_since(last).as_secs_f64();
            if dt > 0.0 {
                self.fps = Some(match self.fps {
                    None => 1.0 / dt,
                    Some(fps) => 0.9 * fps + 0.1 / dt,
                });
            }
        }
        self.last_tick = Some(now);
        self.fps
    }

    /// Current estimate, rounded to one decimal.
    pub fn rounded(&self) -> Option<f64> {
        self.fps.map(|fps| (fps * 10.0).round() / 10.0)
    }

    /// Forget all ticks.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_tick_has_no_estimate() {
        let mut counter = FpsCounter::new();
        assert_eq!(counter.tick(Instant::now()), None);
    }

    #[test]
    fn test_smoothing() {
        let start = Instant::now();
        let mut counter = FpsCounter::new();
        counter.tick(start);
        let fps = counter.tick(start + Duration::from_millis(100)).unwrap();
        assert!((fps - 10.0).abs() < 1e-9);

        // 0.9 * 10 + 0.1 / 0.05 = 11
        let fps = counter.tick(start + Duration::from_millis(150)).unwrap();
        assert!((fps - 11.0).abs() < 1e-9);
        assert_eq!(counter.rounded(), Some(11.0));
    }

    #[test]
    fn test_zero_interval_skipped() {
        let start = Instant::now();
        let mut counter = FpsCounter::new();
        counter.tick(start);
        counter.tick(start + Duration::from_millis(40));
        let before = counter.rounded();
        counter.tick(start + Duration::from_millis(40));
        assert_eq!(counter.rounded(), before);
    }

    #[test]
    fn test_reset() {
        let start = Instant::now();
        let mut counter = FpsCounter::new();
        counter.tick(start);
        counter.tick(start + Duration::from_millis(10));
        counter.reset();
        assert_eq!(counter.rounded(), None);
    }
}
