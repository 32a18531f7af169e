//! Bounded exponential backoff for peer calls
//!
//! Only transient failures are retried; lease loss and rejections return
//! immediately. Running out of attempts yields [`PeerError::Exhausted`].

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::peer::PeerError;

pub const DEFAULT_RETRY_LIMIT: u32 = 10;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub limit: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: DEFAULT_RETRY_LIMIT,
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }

    pub async fn run<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, PeerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PeerError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(PeerError::Transient(message)) => {
                    if attempt >= self.limit {
                        return Err(PeerError::Exhausted {
                            op,
                            attempts: attempt,
                            message,
                        });
                    }
                    let delay = self.delay(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        op, attempt, self.limit, message, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
