//! Stepped retry delays for the consumer's recovery path.

use std::time::Duration;

/// Walks a fixed schedule of delays, saturating at the last step.
///
/// `advance` is split from the sleep so a caller can read the delay under
/// a lock and sleep outside it; [`Backoff::interval`] combines the two
/// for straight-line use.
#[derive(Clone, Debug)]
pub struct Backoff {
    schedule: Vec<Duration>,
    step: usize,
}

impl Backoff {
    /// The stock schedule: 1, 2, 4, 8, 16, 32, 60 seconds.
    pub fn default_schedule() -> Vec<Duration> {
        [1, 2, 4, 8, 16, 32, 60]
            .into_iter()
            .map(Duration::from_secs)
            .collect()
    }

    /// An empty schedule degrades to a single zero-delay step, so the
    /// caller's retry loop always has a current step to report.
    pub fn new(schedule: Vec<Duration>) -> Self {
        let schedule = if schedule.is_empty() {
            vec![Duration::ZERO]
        } else {
            schedule
        };
        Self { schedule, step: 0 }
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Return the current step's delay and move the pointer one step
    /// toward the tail (staying there once reached).
    pub fn advance(&mut self) -> Duration {
        let delay = self.schedule[self.step];
        self.step = (self.step + 1).min(self.schedule.len() - 1);
        delay
    }

    /// Sleep for the current step's delay, then advance. A zero delay
    /// yields immediately.
    pub async fn interval(&mut self) {
        let delay = self.advance();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn current_step(&self) -> usize {
        self.step
    }

    pub fn current_delay(&self) -> Duration {
        self.schedule[self.step]
    }

    pub fn max_delay(&self) -> Duration {
        self.schedule.iter().copied().max().unwrap_or(Duration::ZERO)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Self::default_schedule())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_saturates_at_the_tail() {
        let mut backoff = Backoff::new(vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
        ]);

        assert_eq!(backoff.advance(), Duration::from_secs(1));
        assert_eq!(backoff.advance(), Duration::from_secs(2));
        assert_eq!(backoff.advance(), Duration::from_secs(4));
        assert_eq!(backoff.advance(), Duration::from_secs(4));
        assert_eq!(backoff.current_step(), 2);
    }

    #[test]
    fn test_reset_returns_to_the_head() {
        let mut backoff = Backoff::new(vec![Duration::from_secs(1), Duration::from_secs(8)]);
        backoff.advance();
        backoff.advance();
        backoff.reset();
        assert_eq!(backoff.advance(), Duration::from_secs(1));
    }

    #[test]
    fn test_empty_schedule_degrades_to_zero() {
        let mut backoff = Backoff::new(Vec::new());
        assert_eq!(backoff.advance(), Duration::ZERO);
        assert_eq!(backoff.max_delay(), Duration::ZERO);
    }

    #[test]
    fn test_default_schedule_shape() {
        let backoff = Backoff::default();
        assert_eq!(backoff.current_delay(), Duration::from_secs(1));
        assert_eq!(backoff.max_delay(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_zero_delay_interval_yields_immediately() {
        let mut backoff = Backoff::new(vec![Duration::ZERO, Duration::ZERO]);
        backoff.interval().await;
        backoff.interval().await;
        assert_eq!(backoff.current_step(), 1);
    }
}
