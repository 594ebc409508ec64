//! Retry token acquisition and backoff guidance (component C7).
//!
//! The default [`ExponentialBackoffStrategy`] is a thin wrapper over the
//! `exponential-backoff` crate, grounded directly in
//! `journal-client::read::uncommitted::retry::ExponentialBackoff`. Tokens
//! are modeled as an associated type per [`RetryStrategy`] implementation
//! rather than one shared struct, so the compiler — not a runtime check —
//! enforces that a token minted by one strategy can never be handed to a
//! different strategy's `refresh_retry_token`.

use std::time::Duration;

use forge_error::RuntimeError;

/// Minted by [`RetryStrategy::acquire_initial_token`] and consumed by
/// [`RetryStrategy::refresh_retry_token`] or [`RetryStrategy::record_success`].
/// Opaque to callers outside the strategy that issued it.
pub trait RetryStrategy: Send + Sync {
    type Token: Send;

    /// Call once per operation invocation, before the first attempt.
    fn acquire_initial_token(&self, scope: &str) -> Result<(Self::Token, Duration), RuntimeError>;

    /// Call after a failed attempt whose `last_error.is_retry_safe()` is
    /// `true`. Per §4.7, the pipeline itself bypasses this call for
    /// non-retry-safe errors rather than relying on each implementation to
    /// re-check — a `RetryStrategy` impl may still enforce the same rule
    /// defensively, but it is not the only line of defense.
    /// `suggested_delay_from_server` is a hint from a transport-level
    /// response header (e.g. `Retry-After`); the pipeline sleeps
    /// `max(strategy_delay, suggested_delay_from_server)`.
    fn refresh_retry_token(
        &self,
        token: Self::Token,
        last_error: &RuntimeError,
        suggested_delay_from_server: Option<Duration>,
    ) -> Result<(Self::Token, Duration), RuntimeError>;

    /// Call after a successful attempt. Returns a token for any continued
    /// budget tracking the strategy wants to do (e.g. a circuit breaker);
    /// `None` means the call is done and no further bookkeeping applies.
    fn record_success(&self, token: Self::Token) -> Option<Self::Token>;

    /// Total attempts allowed for one call, including the initial attempt.
    fn max_attempts(&self) -> u32;
}

/// The token minted by [`ExponentialBackoffStrategy`]: just an attempt
/// counter. It carries no capability beyond what `refresh_retry_token`
/// needs, so there is nothing for a caller to misuse even though the field
/// is visible within this crate.
#[derive(Debug, Clone, Copy)]
pub struct AttemptToken {
    attempt: u32,
}

impl AttemptToken {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Exponential backoff with jitter and a bounded attempt count — the
/// client builder's default [`RetryStrategy`] when the caller supplies
/// none.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffStrategy {
    max_attempts: u32,
    backoff: exponential_backoff::Backoff,
}

impl ExponentialBackoffStrategy {
    pub fn new(max_attempts: u32) -> Self {
        ExponentialBackoffStrategy {
            max_attempts: max_attempts.max(1),
            backoff: exponential_backoff::Backoff::new(
                max_attempts.saturating_sub(1),
                Duration::from_millis(100),
                Some(Duration::from_secs(20)),
            ),
        }
    }

    pub fn with_min(mut self, min: Duration) -> Self {
        self.backoff.set_min(min);
        self
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.backoff.set_max(Some(max));
        self
    }

    pub fn with_jitter(mut self, jitter: f32) -> Self {
        self.backoff.set_jitter(jitter);
        self
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.next(attempt).unwrap_or_else(|| Duration::from_millis(100))
    }
}

impl Default for ExponentialBackoffStrategy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryStrategy for ExponentialBackoffStrategy {
    type Token = AttemptToken;

    #[tracing::instrument(skip(self), fields(scope = %scope))]
    fn acquire_initial_token(&self, scope: &str) -> Result<(AttemptToken, Duration), RuntimeError> {
        Ok((AttemptToken { attempt: 1 }, Duration::ZERO))
    }

    fn refresh_retry_token(
        &self,
        token: AttemptToken,
        last_error: &RuntimeError,
        suggested_delay_from_server: Option<Duration>,
    ) -> Result<(AttemptToken, Duration), RuntimeError> {
        if !last_error.is_retry_safe() {
            return Err(RuntimeError::new(
                forge_error::ErrorKind::RetryAcquisition,
                format!("error is not retry-safe: {last_error}"),
            ));
        }
        let next_attempt = token.attempt + 1;
        if next_attempt > self.max_attempts {
            return Err(RuntimeError::new(
                forge_error::ErrorKind::RetryExhausted,
                format!("exhausted {} attempts", self.max_attempts),
            ));
        }
        let strategy_delay = self.delay_for_attempt(next_attempt);
        let delay = match suggested_delay_from_server {
            Some(hint) => strategy_delay.max(hint),
            None => strategy_delay,
        };
        Ok((AttemptToken { attempt: next_attempt }, delay))
    }

    fn record_success(&self, _token: AttemptToken) -> Option<AttemptToken> {
        None
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
