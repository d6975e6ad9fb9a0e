//! Generic retry/backoff helper, adapted from the teacher's
//! `util::retry_operation` and specialized to the sync error taxonomy.

use std::time::Duration;

use crate::error::SyncError;

/// Retry `op` up to `max_attempts` times with a linear backoff (base *
/// attempt index), stopping early once `classify` reports the error is not
/// worth retrying. `base` is the per-attempt backoff unit.
pub fn retry_with_backoff<F, T>(
    max_attempts: u32,
    base: Duration,
    classify: impl Fn(&SyncError) -> bool,
    mut op: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Result<T, SyncError>,
{
    let mut last_err = None;
    for attempt in 0..max_attempts.max(1) {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => {
                let retriable = classify(&e);
                last_err = Some(e);
                if !retriable || attempt + 1 >= max_attempts {
                    break;
                }
                std::thread::sleep(base * (attempt + 1));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| SyncError::Fatal("retry_with_backoff: no attempts run".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn retries_until_success() {
        let calls = Cell::new(0);
        let result = retry_with_backoff(
            5,
            Duration::from_millis(1),
            SyncError::is_retriable_pre_transfer,
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(SyncError::TransientTransport("blip".into()))
                } else {
                    Ok(42)
                }
            },
        );
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn stops_immediately_on_non_retriable() {
        let calls = Cell::new(0);
        let result: Result<(), SyncError> = retry_with_backoff(
            5,
            Duration::from_millis(1),
            SyncError::is_retriable_pre_transfer,
            || {
                calls.set(calls.get() + 1);
                Err(SyncError::PermissionDenied("/x".into()))
            },
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
