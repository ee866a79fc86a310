//! Retry of transient transport failures.

use crate::config::RetryConfig;
use crate::error::ReplResult;

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. At least one attempt is always made.
///
/// The error of the last attempt is returned when the budget runs out;
/// callers decide whether that is fatal.
pub(crate) fn retry_transient<T, F>(config: &RetryConfig, what: &str, mut op: F) -> ReplResult<T>
where
    F: FnMut() -> ReplResult<T>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            std::thread::sleep(config.delay_for_attempt(attempt));
        }

        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                tracing::warn!(
                    operation = what,
                    attempt = attempt + 1,
                    max_attempts,
                    error = %e,
                    "transient failure, retrying"
                );
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
