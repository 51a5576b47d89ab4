use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Retry policy for storage sub-steps of a finalize job
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    /// Total tries including the first one
    pub attempts: u32,
    /// Delay after the first failure, doubled after each further one
    pub base_delay: Duration,
}

impl Retry {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts => {
                    warn!(
                        "[finalize] {} failed (attempt {}/{}), retry in {:?}: {:#}",
                        what, attempt, self.attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
