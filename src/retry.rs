use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::error::{ExpensortError, Result};
use crate::paginate::Page;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF: [Duration; 2] = [Duration::from_millis(500), Duration::from_millis(2000)];
pub const DEFAULT_JITTER: f64 = 0.2;

/// Per-page retry for transient transport failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Wait before retry `n` is `backoff[n - 1]`; the last value repeats.
    pub backoff: Vec<Duration>,
    /// Relative jitter, e.g. 0.2 for +/-20%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF.to_vec(),
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Same attempt budget, no sleeping.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Vec::new(),
            jitter: 0.0,
        }
    }

    /// Nominal delay before the given retry (1-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let i = (retry as usize - 1).min(self.backoff.len().saturating_sub(1));
        self.backoff.get(i).copied().unwrap_or(Duration::ZERO)
    }

    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if base.is_zero() || self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor.max(0.0))
    }

    /// Run `attempt` until it succeeds, fails permanently, or the budget runs out.
    /// Exhaustion is reported as `PageFailed` carrying the last error.
    pub fn run<T>(&self, page: &Page, mut attempt: impl FnMut(u32) -> Result<T>) -> Result<T> {
        let max = self.max_attempts.max(1);
        let mut n = 1;
        loop {
            match attempt(n) {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_retryable() => {
                    error!(
                        page_index = page.index,
                        base = page.base,
                        count = page.len(),
                        attempt = n,
                        error = %e,
                        "page failed"
                    );
                    return Err(e);
                }
                Err(e) if n >= max => {
                    error!(
                        page_index = page.index,
                        base = page.base,
                        count = page.len(),
                        attempts = n,
                        error = %e,
                        "page failed after retries"
                    );
                    return Err(ExpensortError::PageFailed {
                        page_index: page.index,
                        base: page.base,
                        count: page.len(),
                        attempts: n,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    let wait = self.delay(n);
                    warn!(
                        page_index = page.index,
                        attempt = n,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "transient failure; retrying"
                    );
                    if !wait.is_zero() {
                        thread::sleep(wait);
                    }
                    n += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Page {
        Page { index: 2, base: 200, end: 250 }
    }

    fn transient(status: u16) -> ExpensortError {
        ExpensortError::Transient {
            status,
            message: "busy".into(),
        }
    }

    #[test]
    fn test_schedule_repeats_last_value() {
        let p = RetryPolicy::default();
        assert_eq!(p.base_delay(1), Duration::from_millis(500));
        assert_eq!(p.base_delay(2), Duration::from_millis(2000));
        assert_eq!(p.base_delay(5), Duration::from_millis(2000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = RetryPolicy::default();
        for _ in 0..100 {
            let d = p.delay(1).as_secs_f64();
            assert!((0.399..=0.601).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn test_transient_then_success() {
        let mut calls = 0;
        let out = RetryPolicy::immediate(3).run(&page(), |_| {
            calls += 1;
            if calls < 3 {
                Err(transient(429))
            } else {
                Ok("done")
            }
        });
        assert_eq!(out.unwrap(), "done");
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_exhaustion_wraps_with_page_context() {
        let mut calls = 0;
        let err = RetryPolicy::immediate(3)
            .run(&page(), |_| -> Result<()> {
                calls += 1;
                Err(transient(503))
            })
            .unwrap_err();
        assert_eq!(calls, 3);
        match err {
            ExpensortError::PageFailed {
                page_index,
                base,
                count,
                attempts,
                source,
            } => {
                assert_eq!((page_index, base, count, attempts), (2, 200, 50, 3));
                assert!(matches!(*source, ExpensortError::Transient { status: 503, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_malformed_is_not_retried() {
        let mut calls = 0;
        let err = RetryPolicy::immediate(3)
            .run(&page(), |_| -> Result<()> {
                calls += 1;
                Err(ExpensortError::MalformedResponse("bad".into()))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, ExpensortError::MalformedResponse(_)));
    }

    #[test]
    fn test_client_errors_are_not_retried() {
        let mut calls = 0;
        let _ = RetryPolicy::immediate(3).run(&page(), |_| -> Result<()> {
            calls += 1;
            Err(ExpensortError::Transport("HTTP 400".into()))
        });
        assert_eq!(calls, 1);
    }
}
