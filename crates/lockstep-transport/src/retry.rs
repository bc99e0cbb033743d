//! Bounded connect-with-retry: each attempt is capped by the connect timeout
//! and consecutive attempts are separated by a fixed delay.

use std::fmt::Display;
use std::future::Future;

use lockstep_core::{LockstepError, RetryPolicy};
use tokio::net::TcpStream;
use tracing::{info, warn};

/// Run `attempt` until it succeeds or `policy.max_attempts` are spent.
///
/// The closure receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, endpoint: &str, mut attempt: F) -> Result<T, LockstepError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max = policy.max_attempts;
    for n in 1..=max {
        let reason = match tokio::time::timeout(policy.connect_timeout(), attempt(n)).await {
            Ok(Ok(value)) => {
                if n > 1 {
                    info!("[Retry] {} reached on attempt {}/{}", endpoint, n, max);
                }
                return Ok(value);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}ms", policy.connect_timeout_ms),
        };
        warn!("[Retry] Attempt {}/{} to {} failed: {}", n, max, endpoint, reason);
        if n < max {
            tokio::time::sleep(policy.retry_delay()).await;
        }
    }
    Err(LockstepError::RetryExhausted {
        endpoint: endpoint.to_owned(),
        attempts: max,
    })
}

pub async fn connect_with_retry(endpoint: &str, policy: &RetryPolicy) -> Result<TcpStream, LockstepError> {
    let stream = retry(policy, endpoint, |_| TcpStream::connect(endpoint)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            connect_timeout_ms: 5_000,
            retry_delay_ms: 3_000,
            read_timeout_ms: 60_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget_with_fixed_delays() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let result = retry(&policy(), "10.0.0.9:8989", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("connection refused") }
        })
        .await;

        assert!(matches!(
            result,
            Err(LockstepError::RetryExhausted { attempts: 5, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(12));
        assert!(elapsed < Duration::from_secs(13));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempts_are_cut_by_connect_timeout() {
        let start = Instant::now();
        let result = retry(&policy(), "10.0.0.9:8989", |_| std::future::pending::<Result<(), &str>>()).await;

        assert!(result.is_err());
        // 5 × 5s timeouts + 4 × 3s delays
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(37));
        assert!(elapsed < Duration::from_secs(38));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_first_success() {
        let result = retry(&policy(), "peer", |n| async move {
            if n < 3 {
                Err("not yet")
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn connect_to_closed_port_exhausts() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let policy = RetryPolicy {
            max_attempts: 2,
            connect_timeout_ms: 500,
            retry_delay_ms: 10,
            read_timeout_ms: 0,
        };
        let endpoint = format!("127.0.0.1:{port}");
        assert!(matches!(
            connect_with_retry(&endpoint, &policy).await,
            Err(LockstepError::RetryExhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn connect_succeeds_when_listening() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let stream = connect_with_retry(&endpoint, &policy()).await.unwrap();
        assert!(stream.nodelay().unwrap());
    }
}
