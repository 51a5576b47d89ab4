use std::time::Duration;

/// Capped exponential backoff with a bounded number of attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_delay: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay,
            max_attempts,
            attempt: 0,
        }
    }

    /// Attempts used since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the next attempt, `None` once they are used up
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.attempt += 1;
        Some(self.base.saturating_mul(factor).min(self.max_delay))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(8), 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_cap_then_gives_up() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(300), 4);
        assert_eq!(b.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(300)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(300)));
        assert_eq!(b.next_delay(), None);
        assert_eq!(b.attempt(), 4);

        b.reset();
        assert_eq!(b.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_large_attempt_counts_do_not_overflow() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 64);
        let last = std::iter::from_fn(|| b.next_delay()).last();
        assert_eq!(last, Some(Duration::from_secs(30)));
    }
}
