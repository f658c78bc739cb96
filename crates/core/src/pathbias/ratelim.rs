/// Rate limiting for repetitive path-bias log lines
///
/// A guard that keeps failing circuits would otherwise produce one notice
/// per circuit. Each limiter lets one message through per interval and
/// counts what it held back.

use onioncirc_common::RelayId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Seconds between two notices from the same source
pub const NOTICE_INTERVAL: Duration = Duration::from_secs(600);

/// One message per interval
#[derive(Debug, Clone)]
pub struct LogRateLimit {
    interval: Duration,
    last_allowed: Option<Instant>,
    suppressed: u32,
}

impl LogRateLimit {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_allowed: None,
            suppressed: 0,
        }
    }

    /// `Some(suffix)` when a message may be logged at `now`. The suffix
    /// reports how many were held back since the last one and is empty
    /// when none were.
    pub fn check(&mut self, now: Instant) -> Option<String> {
        let allowed = match self.last_allowed {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if !allowed {
            self.suppressed = self.suppressed.saturating_add(1);
            return None;
        }

        let suffix = if self.suppressed > 0 {
            format!(
                " [{} similar message(s) suppressed in last {} seconds]",
                self.suppressed,
                self.interval.as_secs()
            )
        } else {
            String::new()
        };
        self.last_allowed = Some(now);
        self.suppressed = 0;
        Some(suffix)
    }
}

impl Default for LogRateLimit {
    fn default() -> Self {
        Self::new(NOTICE_INTERVAL)
    }
}

/// Limiters for the path-bias notices of one node
#[derive(Debug, Default)]
pub struct PathBiasLogLimits {
    /// "strange path state" while counting a build attempt
    pub attempt: LogRateLimit,
    /// "strange path state" while counting a build success
    pub success: LogRateLimit,
    /// Close notices, one limiter per guard
    close: HashMap<RelayId, LogRateLimit>,
}

impl PathBiasLogLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close notice for a circuit through `guard`
    pub fn close_notice(&mut self, guard: RelayId, now: Instant) -> Option<String> {
        self.close.entry(guard).or_default().check(now)
    }
}
