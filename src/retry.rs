use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use rand::RngExt;

use crate::IDEMPOTENCY_KEY_HEADER;
use crate::error::{Error, ErrorKind, TransportErrorKind};
use crate::outcome::Outcome;
use crate::request::Method;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

/// Per-call retry bookkeeping. Lives exactly as long as one `execute` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryState {
    attempt: usize,
    max_attempts: usize,
    elapsed_delay: Duration,
    replays: usize,
    last_error: Option<ErrorKind>,
}

impl RetryState {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            attempt: 1,
            max_attempts: max_attempts.max(1),
            elapsed_delay: Duration::ZERO,
            replays: 0,
            last_error: None,
        }
    }

    pub(crate) fn at_attempt(attempt: usize, max_attempts: usize) -> Self {
        Self {
            attempt: attempt.max(1),
            ..Self::new(max_attempts)
        }
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn elapsed_delay(&self) -> Duration {
        self.elapsed_delay
    }

    pub fn replays(&self) -> usize {
        self.replays
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub(crate) fn record_failure(&mut self, kind: ErrorKind) {
        self.last_error = Some(kind);
    }

    pub(crate) fn advance_after_delay(&mut self, delay: Duration) {
        self.elapsed_delay = self.elapsed_delay.saturating_add(delay);
        self.attempt = self.attempt.saturating_add(1);
    }

    pub(crate) fn record_replay(&mut self) {
        self.replays = self.replays.saturating_add(1);
    }
}

pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, state: &RetryState, error: &Error) -> bool;
}

pub trait RetryEligibility: Send + Sync {
    fn supports_retry(&self, method: Method, headers: &HeaderMap) -> bool;
}

/// Retries GET, PUT and DELETE, plus anything carrying an idempotency key.
#[derive(Default)]
pub struct StrictRetryEligibility;

impl RetryEligibility for StrictRetryEligibility {
    fn supports_retry(&self, method: Method, headers: &HeaderMap) -> bool {
        request_supports_retry(method, headers)
    }
}

#[derive(Default)]
pub struct PermissiveRetryEligibility;

impl RetryEligibility for PermissiveRetryEligibility {
    fn supports_retry(&self, _method: Method, _headers: &HeaderMap) -> bool {
        true
    }
}

pub(crate) fn request_supports_retry(method: Method, headers: &HeaderMap) -> bool {
    method.is_idempotent() || headers.get(IDEMPOTENCY_KEY_HEADER).is_some()
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Backoff {
    /// `base × attempt`.
    Linear,
    /// `base × multiplier^(attempt - 1)`.
    Exponential { multiplier: f64 },
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
    backoff: Backoff,
    jitter_ratio: f64,
    retryable_status_codes: BTreeSet<u16>,
    retry_server_errors: bool,
    retryable_transport_error_kinds: BTreeSet<TransportErrorKind>,
    retry_on_timeout: bool,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff", &self.backoff)
            .field("jitter_ratio", &self.jitter_ratio)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field("retry_server_errors", &self.retry_server_errors)
            .field(
                "retryable_transport_error_kinds",
                &self.retryable_transport_error_kinds,
            )
            .field("retry_on_timeout", &self.retry_on_timeout)
            .field("retry_classifier", &self.retry_classifier.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::standard()
        }
    }

    /// Three attempts, one second base delay growing linearly, full jitter.
    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Linear,
            jitter_ratio: 1.0,
            retryable_status_codes: default_retryable_status_codes(),
            retry_server_errors: true,
            retryable_transport_error_kinds: default_retryable_transport_error_kinds(),
            retry_on_timeout: true,
            retry_classifier: None,
        }
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        if self.max_delay < self.base_delay {
            self.max_delay = self.base_delay;
        }
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay.max(self.base_delay);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = match backoff {
            Backoff::Exponential { multiplier } => Backoff::Exponential {
                multiplier: if multiplier.is_finite() {
                    multiplier.max(1.0)
                } else {
                    1.0
                },
            },
            Backoff::Linear => Backoff::Linear,
        };
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retry_server_errors(mut self, retry: bool) -> Self {
        self.retry_server_errors = retry;
        self
    }

    pub fn retryable_transport_error_kinds(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.retryable_transport_error_kinds = kinds.into_iter().collect();
        self
    }

    pub fn retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    pub fn retry_classifier(mut self, retry_classifier: Arc<dyn RetryClassifier>) -> Self {
        self.retry_classifier = Some(retry_classifier);
        self
    }

    pub fn configured_max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn configured_base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn configured_max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn is_retryable(&self, state: &RetryState, error: &Error) -> bool {
        if let Some(retry_classifier) = &self.retry_classifier {
            return retry_classifier.should_retry(state, error);
        }
        match error {
            Error::Transport { kind, .. } => self.retryable_transport_error_kinds.contains(kind),
            Error::Timeout { .. } => self.retry_on_timeout,
            Error::HttpStatus { status, .. } => {
                self.retryable_status_codes.contains(status)
                    || (self.retry_server_errors && (500..600).contains(status))
            }
            _ => false,
        }
    }

    pub fn should_retry(&self, state: &RetryState, outcome: &Outcome) -> RetryDecision {
        let Outcome::Failure(failure) = outcome else {
            return RetryDecision::GiveUp;
        };
        if state.attempt() >= state.max_attempts().min(self.max_attempts) {
            return RetryDecision::GiveUp;
        }
        if !self.is_retryable(state, failure.error()) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.backoff_for_retry(state.attempt()))
    }

    /// Delay before the attempt that follows failed attempt `attempt`.
    pub fn backoff_for_retry(&self, attempt: usize) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let scaled_ms = match self.backoff {
            Backoff::Linear => base_ms * attempt as f64,
            Backoff::Exponential { multiplier } => {
                let exponent = attempt.saturating_sub(1).min(63) as i32;
                base_ms * multiplier.powi(exponent)
            }
        };
        let delay_ms = scaled_ms.min(max_ms).max(0.0) as u64;
        self.apply_jitter(delay_ms, max_ms as u64)
    }

    fn apply_jitter(&self, delay_ms: u64, max_ms: u64) -> Duration {
        let jitter_span = ((self.base_delay.as_millis() as f64) * self.jitter_ratio).round() as u64;
        if jitter_span == 0 {
            return Duration::from_millis(delay_ms);
        }
        let mut rng = rand::rng();
        let jitter_ms = rng.random_range(0..=jitter_span);
        Duration::from_millis(delay_ms.saturating_add(jitter_ms).min(max_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [408_u16, 429].into_iter().collect()
}

fn default_retryable_transport_error_kinds() -> BTreeSet<TransportErrorKind> {
    [
        TransportErrorKind::Dns,
        TransportErrorKind::Connect,
        TransportErrorKind::Tls,
        TransportErrorKind::Read,
        TransportErrorKind::Write,
        TransportErrorKind::Other,
    ]
    .into_iter()
    .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::HeaderMap;

    use super::*;
    use crate::outcome::Failure;

    fn status_failure(status: u16) -> Outcome {
        Outcome::Failure(Failure::new(
            Error::HttpStatus {
                status,
                method: Method::Get,
                url: "https://api.example.com/v1/items".to_owned(),
                body: String::new(),
            },
            1,
            0,
        ))
    }

    #[test]
    fn jittered_backoff_stays_between_floor_and_cap() {
        let policy = RetryPolicy::standard()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(250))
            .jitter_ratio(1.0);

        for attempt in 1..=5 {
            for _ in 0..128 {
                let delay = policy.backoff_for_retry(attempt);
                let floor = Duration::from_millis(100 * (attempt as u64 - 1)).min(
                    Duration::from_millis(250),
                );
                assert!(delay >= floor, "attempt {attempt}: {delay:?} < {floor:?}");
                assert!(delay <= Duration::from_millis(250));
            }
        }
    }

    #[test]
    fn linear_backoff_uses_attempt_index_as_multiplier() {
        let policy = RetryPolicy::standard()
            .base_delay(Duration::from_millis(10))
            .max_delay(Duration::from_secs(1))
            .jitter_ratio(0.0);

        assert_eq!(policy.backoff_for_retry(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for_retry(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_for_retry(3), Duration::from_millis(30));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::standard()
            .base_delay(Duration::from_millis(10))
            .max_delay(Duration::from_millis(50))
            .backoff(Backoff::Exponential { multiplier: 2.0 })
            .jitter_ratio(0.0);

        assert_eq!(policy.backoff_for_retry(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for_retry(3), Duration::from_millis(40));
        assert_eq!(policy.backoff_for_retry(8), Duration::from_millis(50));
    }

    #[test]
    fn client_errors_give_up_except_request_timeout_and_throttling() {
        let policy = RetryPolicy::standard().jitter_ratio(0.0);
        let state = RetryState::new(3);

        assert_eq!(
            policy.should_retry(&state, &status_failure(404)),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy.should_retry(&state, &status_failure(400)),
            RetryDecision::GiveUp
        );
        assert!(matches!(
            policy.should_retry(&state, &status_failure(408)),
            RetryDecision::Retry(_)
        ));
        assert!(matches!(
            policy.should_retry(&state, &status_failure(429)),
            RetryDecision::Retry(_)
        ));
        assert!(matches!(
            policy.should_retry(&state, &status_failure(503)),
            RetryDecision::Retry(_)
        ));
    }

    #[test]
    fn gives_up_once_attempts_are_exhausted() {
        let policy = RetryPolicy::standard().max_attempts(3).jitter_ratio(0.0);
        let mut state = RetryState::new(3);
        state.advance_after_delay(Duration::ZERO);
        state.advance_after_delay(Duration::ZERO);

        assert_eq!(state.attempt(), 3);
        assert_eq!(
            policy.should_retry(&state, &status_failure(503)),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn strict_eligibility_requires_idempotent_method_or_key() {
        let eligibility = StrictRetryEligibility;
        let mut headers = HeaderMap::new();

        assert!(eligibility.supports_retry(Method::Get, &headers));
        assert!(eligibility.supports_retry(Method::Delete, &headers));
        assert!(!eligibility.supports_retry(Method::Post, &headers));
        assert!(!eligibility.supports_retry(Method::Patch, &headers));

        headers.insert(
            IDEMPOTENCY_KEY_HEADER,
            http::HeaderValue::from_static("create-1"),
        );
        assert!(eligibility.supports_retry(Method::Post, &headers));
        assert!(PermissiveRetryEligibility.supports_retry(Method::Post, &HeaderMap::new()));
    }

    #[test]
    fn transport_errors_retry_but_cancellation_does_not() {
        let policy = RetryPolicy::standard();
        let state = RetryState::new(3);
        let transport = Outcome::Failure(Failure::new(
            Error::Transport {
                kind: TransportErrorKind::Connect,
                method: Method::Get,
                url: "https://api.example.com".to_owned(),
                message: "connection refused".to_owned(),
            },
            1,
            0,
        ));
        assert!(matches!(
            policy.should_retry(&state, &transport),
            RetryDecision::Retry(_)
        ));

        let cancelled = Outcome::Failure(Failure::new(
            Error::Cancelled {
                method: Method::Get,
                url: "https://api.example.com".to_owned(),
            },
            1,
            0,
        ));
        assert_eq!(
            policy.should_retry(&state, &cancelled),
            RetryDecision::GiveUp
        );
    }
}
