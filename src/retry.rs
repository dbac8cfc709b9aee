//! Bounded retry with exponential backoff for network boundary operations.
//!
//! Image fetches and storage writes go through [`with_backoff`]; nothing
//! above the network boundary retries, so a failure that survives the
//! schedule is final.

use std::time::Duration;

use crate::config::RetryPolicy;

/// Run `action` under the retry schedule, retrying only while `should_retry`
/// allows it. The first attempt counts against `max_attempts`.
pub fn with_backoff<T, E, F, R>(
    policy: RetryPolicy,
    mut action: F,
    mut should_retry: R,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    R: FnMut(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match action() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_attempts || !should_retry(&err) {
                    return Err(err);
                }
                std::thread::sleep(backoff_delay(policy, attempt));
            }
        }
    }
}

fn backoff_delay(policy: RetryPolicy, attempt: u32) -> Duration {
    let base = Duration::from_millis(policy.base_delay_ms);
    let max = Duration::from_millis(policy.max_delay_ms);
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    let delay = base.checked_mul(factor).unwrap_or(max);
    delay.min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    #[test]
    fn stops_after_first_success() {
        let mut attempts = 0u32;
        let result: Result<u32, &'static str> = with_backoff(
            instant_policy(4),
            || {
                attempts += 1;
                if attempts < 3 { Err("fail") } else { Ok(7) }
            },
            |_| true,
        );
        assert_eq!(result, Ok(7));
        assert_eq!(attempts, 3);
    }

    #[test]
    fn gives_up_when_the_predicate_declines() {
        let mut attempts = 0u32;
        let result: Result<u32, &'static str> = with_backoff(
            instant_policy(3),
            || {
                attempts += 1;
                Err("fail")
            },
            |_| false,
        );
        assert_eq!(result, Err("fail"));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn exhausts_the_attempt_budget() {
        let mut attempts = 0u32;
        let result: Result<u32, &'static str> = with_backoff(
            instant_policy(3),
            || {
                attempts += 1;
                Err("fail")
            },
            |_| true,
        );
        assert_eq!(result, Err("fail"));
        assert_eq!(attempts, 3);
    }

    #[test]
    fn delay_doubles_then_saturates_at_the_ceiling() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 450,
        };
        assert_eq!(backoff_delay(policy, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(policy, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(policy, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(policy, 4), Duration::from_millis(450));
        assert_eq!(backoff_delay(policy, 40), Duration::from_millis(450));
    }
}
