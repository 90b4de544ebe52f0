use std::time::{Duration, Instant};
use tracing::info;

/// Rate-limited "processed N blocks" logging while syncing.
#[derive(Debug)]
pub struct ProgressLogger {
    interval: Duration,
    received: u64,
    last_log: Option<Instant>,
}

impl ProgressLogger {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            received: 0,
            last_log: None,
        }
    }

    /// Count one applied block; returns true when a progress line was emitted.
    pub fn log_block_height(&mut self, height: u64, now: Instant) -> bool {
        self.received += 1;
        let last = *self.last_log.get_or_insert(now);
        let elapsed = now.saturating_duration_since(last);
        if elapsed < self.interval {
            return false;
        }

        let noun = if self.received == 1 { "block" } else { "blocks" };
        info!(
            blocks = self.received,
            height,
            "Processed {} {} in the last {:.1}s (height {})",
            self.received,
            noun,
            elapsed.as_secs_f64(),
            height
        );
        self.received = 0;
        self.last_log = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logs_once_per_interval() {
        let start = Instant::now();
        let mut progress = ProgressLogger::new(Duration::from_secs(10));

        assert!(!progress.log_block_height(1, start));
        assert!(!progress.log_block_height(2, start + Duration::from_secs(5)));
        assert!(progress.log_block_height(3, start + Duration::from_secs(10)));
        assert!(!progress.log_block_height(4, start + Duration::from_secs(11)));
        assert!(progress.log_block_height(5, start + Duration::from_secs(21)));
    }
}
