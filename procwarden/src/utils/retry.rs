use std::thread::sleep;
use std::time::Duration;

/// Retries `f` with the same doubling curve the supervisor uses for child
/// respawns: the first retry waits `initial`, each further one twice the
/// previous. Meant for transient IO (a configuration file caught mid-save,
/// a runtime directory briefly unavailable); the last error is returned once
/// `max_attempts` is exhausted.
pub fn retry_with_backoff<F, T, E>(
    max_attempts: usize,
    initial: Duration,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts.max(1) {
                    return Err(err);
                }
                let exponent = (attempt - 1).min(u32::MAX as usize) as u32;
                sleep(initial.saturating_mul(2_u32.saturating_pow(exponent)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn first_success_short_circuits() {
        let mut calls = 0;
        let result: Result<&str, &str> = retry_with_backoff(3, Duration::from_secs(60), || {
            calls += 1;
            Ok("ready")
        });
        assert_eq!(result, Ok("ready"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn the_last_error_is_returned_after_all_attempts() {
        let mut calls = 0;
        let result: Result<(), usize> = retry_with_backoff(3, Duration::from_millis(1), || {
            calls += 1;
            Err(calls)
        });
        assert_eq!(result, Err(3));
        assert_eq!(calls, 3);
    }

    #[test]
    fn waits_grow_between_attempts() {
        let clock = Instant::now();
        let _: Result<(), ()> = retry_with_backoff(3, Duration::from_millis(40), || Err(()));
        // 40ms + 80ms of backoff between the three attempts
        assert!(clock.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn transient_failures_recover() {
        let mut calls = 0;
        let result = retry_with_backoff(4, Duration::from_millis(1), || {
            calls += 1;
            if calls < 3 {
                Err("still saving")
            } else {
                Ok("loaded")
            }
        });
        assert_eq!(result, Ok("loaded"));
        assert_eq!(calls, 3);
    }
}
