//! Bounded startup retry for upstream connections.

use huddle_core::BridgeError;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Default number of connection attempts.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 10;

/// Default pause between attempts.
pub const DEFAULT_CONNECT_DELAY: Duration = Duration::from_secs(3);

/// Call `connect` until it succeeds, at most `attempts` times, sleeping
/// `delay` between failures.
///
/// # Errors
///
/// Returns [`BridgeError::UpstreamUnavailable`] carrying the last failure
/// once every attempt has failed.
pub async fn connect_with_retry<T, F, Fut>(
    name: &str,
    attempts: u32,
    delay: Duration,
    mut connect: F,
) -> Result<T, BridgeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BridgeError>>,
{
    let attempts = attempts.max(1);
    let mut reason = String::new();

    for attempt in 1..=attempts {
        match connect().await {
            Ok(connection) => {
                info!(bridge = name, attempt, "Connected to upstream");
                return Ok(connection);
            }
            Err(e) => {
                warn!(bridge = name, attempt, attempts, error = %e, "Upstream connection failed");
                reason = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(BridgeError::UpstreamUnavailable { attempts, reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = connect_with_retry("test", 5, Duration::from_secs(3), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BridgeError::Connect("refused".into()))
            } else {
                Ok("connected")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "connected");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_upstream_unavailable() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = connect_with_retry("test", 3, Duration::from_secs(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BridgeError::Connect("refused".into()))
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(BridgeError::UpstreamUnavailable { attempts, reason }) => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("refused"));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
