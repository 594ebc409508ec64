//! The waiter engine (component C10, §4.10): repeatedly invokes a polling
//! operation until an acceptor reports a terminal state, backing off
//! between attempts with jittered exponential delay bounded by the
//! remaining wait budget.
//!
//! Grounded in the same backoff shape as [`crate::pipeline`]'s retry loop
//! (`journal-client::read::uncommitted::retry::ExponentialBackoff`), but
//! waiters have their own acceptor vocabulary rather than reusing
//! [`forge_retry::RetryStrategy`] — a waiter polls until a *matcher* fires,
//! not until a call merely succeeds.

use std::future::Future;
use std::time::{Duration, Instant};

use forge_error::{ErrorKind, RuntimeError};
use rand::Rng;

/// What an acceptor decided about one poll's outcome.
pub enum WaiterAcceptorResult {
    /// The waited-for state was observed; stop polling successfully.
    Success,
    /// Keep polling.
    Retry,
    /// A terminal failure state was observed; stop polling with this error.
    Failure(RuntimeError),
}

/// Inspects one poll attempt's outcome and classifies it. A waiter usually
/// registers several acceptors (e.g. "resource exists", "resource deleted",
/// "resource failed") and the first to return something other than `Retry`
/// wins.
pub trait WaiterAcceptor<O>: Send + Sync {
    fn accept(&self, outcome: &Result<O, RuntimeError>) -> WaiterAcceptorResult;
}

/// An acceptor built from a plain predicate closure, for the common case of
/// matching on the `Ok` output's shape.
pub struct FnAcceptor<F> {
    matcher: F,
}

impl<F> FnAcceptor<F> {
    pub fn new(matcher: F) -> Self {
        FnAcceptor { matcher }
    }
}

impl<F, O> WaiterAcceptor<O> for FnAcceptor<F>
where
    F: Fn(&Result<O, RuntimeError>) -> WaiterAcceptorResult + Send + Sync,
{
    fn accept(&self, outcome: &Result<O, RuntimeError>) -> WaiterAcceptorResult {
        (self.matcher)(outcome)
    }
}

#[derive(Debug, Clone)]
pub struct WaiterConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_wait_time: Duration,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        WaiterConfig {
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            max_wait_time: Duration::from_secs(300),
        }
    }
}

/// Polls `poll` repeatedly until one of `acceptors` reaches a terminal
/// verdict or `config.max_wait_time` elapses, in which case the waiter
/// fails with [`ErrorKind::WaiterTimeout`]. If every poll's outcome falls
/// through every acceptor with no match, the waiter fails with
/// [`ErrorKind::WaiterUnmatchedException`] only when the outcome was itself
/// an `Err` — an unmatched `Ok` just means "keep waiting".
#[tracing::instrument(skip_all)]
pub async fn wait<F, Fut, O>(
    poll: F,
    acceptors: &[Box<dyn WaiterAcceptor<O>>],
    config: &WaiterConfig,
) -> Result<O, RuntimeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<O, RuntimeError>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let outcome = poll().await;

        let mut matched = None;
        for acceptor in acceptors {
            match acceptor.accept(&outcome) {
                WaiterAcceptorResult::Retry => continue,
                verdict => {
                    matched = Some(verdict);
                    break;
                }
            }
        }

        match matched {
            Some(WaiterAcceptorResult::Success) => return outcome,
            Some(WaiterAcceptorResult::Failure(err)) => return Err(err),
            Some(WaiterAcceptorResult::Retry) | None => {
                if let Err(err) = &outcome {
                    if matched.is_none() {
                        tracing::debug!(attempt, %err, "waiter poll errored with no matching acceptor, retrying");
                    }
                }
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= config.max_wait_time {
            return Err(RuntimeError::new(
                ErrorKind::WaiterTimeout,
                format!("waiter did not reach a terminal state within {:?}", config.max_wait_time),
            ));
        }

        let remaining = config.max_wait_time - elapsed;
        let delay = next_delay(config, attempt, remaining);
        tokio::time::sleep(delay).await;
    }
}

/// `clamp(base * 2^(attempt-1) + jitter, 0, remaining)`, with jitter drawn
/// uniformly from `[0, min_delay)` so small `min_delay` values still back
/// off smoothly instead of producing a visible staircase.
fn next_delay(config: &WaiterConfig, attempt: u32, remaining: Duration) -> Duration {
    let base = config.min_delay.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
    let jitter = if config.min_delay.is_zero() {
        0.0
    } else {
        rand::thread_rng().gen_range(0.0..config.min_delay.as_secs_f64())
    };
    let uncapped = Duration::from_secs_f64(base + jitter);
    uncapped.min(config.max_delay).min(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn stops_as_soon_as_an_acceptor_reports_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let acceptors: Vec<Box<dyn WaiterAcceptor<u32>>> = vec![Box::new(FnAcceptor::new(
            |outcome: &Result<u32, RuntimeError>| match outcome {
                Ok(n) if *n >= 3 => WaiterAcceptorResult::Success,
                _ => WaiterAcceptorResult::Retry,
            },
        ))];
        let config = WaiterConfig { min_delay: Duration::from_millis(1), max_delay: Duration::from_millis(5), ..Default::default() };

        let result = wait(
            || {
                let calls = calls_clone.clone();
                async move { Ok::<_, RuntimeError>(calls.fetch_add(1, Ordering::SeqCst) + 1) }
            },
            &acceptors,
            &config,
        )
        .await
        .unwrap();

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn a_failure_acceptor_short_circuits_with_its_error() {
        let acceptors: Vec<Box<dyn WaiterAcceptor<u32>>> = vec![Box::new(FnAcceptor::new(
            |outcome: &Result<u32, RuntimeError>| match outcome {
                Ok(n) if *n == 1 => {
                    WaiterAcceptorResult::Failure(RuntimeError::new(ErrorKind::WaiterUnmatchedException, "resource entered FAILED state"))
                }
                _ => WaiterAcceptorResult::Retry,
            },
        ))];
        let config = WaiterConfig { min_delay: Duration::from_millis(1), ..Default::default() };

        let err = wait(|| async { Ok::<_, RuntimeError>(1u32) }, &acceptors, &config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WaiterUnmatchedException);
    }

    #[tokio::test]
    async fn exceeding_max_wait_time_produces_a_waiter_timeout() {
        let acceptors: Vec<Box<dyn WaiterAcceptor<u32>>> = vec![Box::new(FnAcceptor::new(
            |_outcome: &Result<u32, RuntimeError>| WaiterAcceptorResult::Retry,
        ))];
        let config = WaiterConfig {
            min_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
            max_wait_time: Duration::from_millis(20),
        };

        let err = wait(|| async { Ok::<_, RuntimeError>(0u32) }, &acceptors, &config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WaiterTimeout);
    }
}
