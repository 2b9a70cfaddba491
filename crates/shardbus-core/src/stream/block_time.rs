//! Adaptive block time for stream reads
//!
//! Busy streams shrink the wait toward `min_block_time` to cut latency;
//! idle streams stretch it toward `max_block_time` to cut polling pressure.

use std::time::Duration;

use crate::config::{SubscriberConfig, MAX_BLOCK_TIME};

/// Current blocking-read timeout, adapted to traffic
#[derive(Debug, Clone)]
pub struct BlockTime {
    current: f64,
    min: f64,
    max: f64,
    delta: f64,
}

impl BlockTime {
    /// Start at the configured minimum. Bounds are kept within `[0, MAX_BLOCK_TIME]`.
    pub fn new(config: &SubscriberConfig) -> Self {
        let max = config.max_block_time.min(MAX_BLOCK_TIME).max(0.0);
        let min = config.min_block_time.min(max).max(0.0);
        Self {
            current: min,
            min,
            max,
            delta: config.block_time_delta,
        }
    }

    /// Current value in seconds
    pub fn seconds(&self) -> f64 {
        self.current
    }

    /// Current value as a [`Duration`]
    pub fn duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.current)
            .unwrap_or_else(|_| Duration::from_secs_f64(self.max))
    }

    /// Entries arrived: wait less next time
    pub fn shrink(&mut self) {
        self.current = (self.current * self.delta).max(self.min);
    }

    /// Nothing arrived: wait longer next time
    pub fn grow(&mut self) {
        self.current = (self.current / self.delta).min(self.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SubscriberConfig {
        SubscriberConfig::new()
            .with_block_time(0.1, 1.0)
            .with_block_time_delta(0.5)
    }

    #[test]
    fn test_starts_at_minimum() {
        let block = BlockTime::new(&config());
        assert_eq!(block.seconds(), 0.1);
        assert_eq!(block.duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_grow_is_capped() {
        let mut block = BlockTime::new(&config());
        block.grow();
        assert!((block.seconds() - 0.2).abs() < 1e-9);
        for _ in 0..10 {
            block.grow();
        }
        assert_eq!(block.seconds(), 1.0);
    }

    #[test]
    fn test_shrink_is_floored() {
        let mut block = BlockTime::new(&config());
        for _ in 0..5 {
            block.grow();
        }
        block.shrink();
        assert!((block.seconds() - 0.5).abs() < 1e-9);
        for _ in 0..10 {
            block.shrink();
        }
        assert_eq!(block.seconds(), 0.1);
    }

    #[test]
    fn test_unbounded_max_is_clamped() {
        let config = SubscriberConfig::new().with_block_time(0.1, f64::INFINITY);
        let mut block = BlockTime::new(&config);
        for _ in 0..200 {
            block.grow();
        }
        assert_eq!(block.seconds(), MAX_BLOCK_TIME);
        assert_eq!(block.duration(), Duration::from_secs(300));
    }
}
