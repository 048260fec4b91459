use std::future::Future;
use std::time::Duration;

use davdrive_core::DavError;
use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, false)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(0..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(8), true)
    }
}

/// Runs `op` up to `attempts` times, sleeping between tries while the error is
/// retryable. Other errors return immediately.
pub async fn retry<T, F, Fut>(backoff: &Backoff, attempts: u32, mut op: F) -> Result<T, DavError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DavError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                let delay = backoff.delay(attempt);
                tracing::debug!(attempt, ?delay, error = %err, "retrying remote call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
