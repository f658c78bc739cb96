use onioncirc_common::build_timeout::{
    INITIAL_TIMEOUT_MS, MAX_RECORDED_BUILD_TIMES, MIN_CIRCUITS_TO_OBSERVE, OUTLIER_SLACK_MS,
};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, info};

/// What happened to a build-time observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildTimeOutcome {
    Recorded,
    /// Negative or far beyond the close timeout: probably a clock jump
    Outlier,
    /// Learning is turned off
    Disabled,
}

/// Recent circuit build durations and the timeouts learned from them
#[derive(Debug, Clone)]
pub struct BuildTimes {
    samples: VecDeque<u64>,
    timeout_ms: u64,
    close_ms: u64,
    enabled: bool,
}

impl BuildTimes {
    pub fn new(enabled: bool) -> Self {
        Self {
            samples: VecDeque::with_capacity(MAX_RECORDED_BUILD_TIMES),
            timeout_ms: INITIAL_TIMEOUT_MS,
            close_ms: INITIAL_TIMEOUT_MS,
            enabled,
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// How long a building circuit may live before it is torn down
    pub fn close_ms(&self) -> u64 {
        self.close_ms
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// A build that took this long did not happen in real time
    pub fn is_outlier(&self, elapsed_ms: i64) -> bool {
        elapsed_ms < 0 || elapsed_ms > 2 * self.close_ms as i64 + OUTLIER_SLACK_MS
    }

    /// Offer one build duration
    pub fn note_build(&mut self, elapsed_ms: i64) -> BuildTimeOutcome {
        if self.is_outlier(elapsed_ms) {
            return BuildTimeOutcome::Outlier;
        }
        if !self.enabled {
            return BuildTimeOutcome::Disabled;
        }
        self.add_time(elapsed_ms as u64);
        BuildTimeOutcome::Recorded
    }

    fn add_time(&mut self, ms: u64) {
        if self.samples.len() == MAX_RECORDED_BUILD_TIMES {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
        debug!("Recorded circuit build time {}ms ({} samples)", ms, self.samples.len());

        if self.samples.len() >= MIN_CIRCUITS_TO_OBSERVE {
            self.set_timeout();
        }
    }

    fn set_timeout(&mut self) {
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let timeout = percentile(&sorted, 80);
        let close = percentile(&sorted, 99).max(timeout);

        if timeout != self.timeout_ms || close != self.close_ms {
            info!(
                "Set circuit build timeout to {}ms (close after {}ms) from {} build times",
                timeout,
                close,
                sorted.len()
            );
        }
        self.timeout_ms = timeout;
        self.close_ms = close;
    }

    pub fn summary(&self) -> BuildTimesSummary {
        BuildTimesSummary {
            samples: self.samples.len(),
            timeout_ms: self.timeout_ms,
            close_ms: self.close_ms,
            learning: self.enabled,
        }
    }
}

fn percentile(sorted: &[u64], pct: usize) -> u64 {
    if sorted.is_empty() {
        return INITIAL_TIMEOUT_MS;
    }
    sorted[(sorted.len() - 1) * pct / 100]
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildTimesSummary {
    pub samples: usize,
    pub timeout_ms: u64,
    pub close_ms: u64,
    pub learning: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_timeouts() {
        let times = BuildTimes::new(true);
        assert_eq!(times.timeout_ms(), 60_000);
        assert_eq!(times.close_ms(), 60_000);
        assert_eq!(times.sample_count(), 0);
    }

    #[test]
    fn test_outlier_bound() {
        let mut times = BuildTimes::new(true);
        assert!(times.is_outlier(-1));
        assert!(!times.is_outlier(121_000));
        assert!(times.is_outlier(121_001));

        assert_eq!(times.note_build(-5), BuildTimeOutcome::Outlier);
        assert_eq!(times.note_build(500_000), BuildTimeOutcome::Outlier);
        assert_eq!(times.note_build(1_200), BuildTimeOutcome::Recorded);
        assert_eq!(times.sample_count(), 1);
    }

    #[test]
    fn test_disabled_records_nothing() {
        let mut times = BuildTimes::new(false);
        assert_eq!(times.note_build(800), BuildTimeOutcome::Disabled);
        assert_eq!(times.sample_count(), 0);
    }

    #[test]
    fn test_learns_percentiles() {
        let mut times = BuildTimes::new(true);
        for i in 1..=99u64 {
            times.note_build((i * 1000) as i64);
        }
        assert_eq!(times.timeout_ms(), 60_000);

        times.note_build(100_000);
        assert_eq!(times.sample_count(), 100);
        assert_eq!(times.timeout_ms(), 80_000);
        assert_eq!(times.close_ms(), 99_000);
    }

    #[test]
    fn test_sample_window_is_bounded() {
        let mut times = BuildTimes::new(true);
        for _ in 0..(MAX_RECORDED_BUILD_TIMES + 50) {
            times.note_build(500);
        }
        assert_eq!(times.sample_count(), MAX_RECORDED_BUILD_TIMES);
        assert_eq!(times.timeout_ms(), 500);
    }
}
