use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, Method, StatusCode};
use rand::Rng;

use crate::IDEMPOTENCY_KEY_HEADER;
use crate::error::{FailureClass, TransportErrorKind};

/// Context handed to a [`RetryClassifier`] for one failed attempt.
#[derive(Clone, Debug)]
pub struct RetryDecision {
    pub attempt: usize,
    pub max_retries: usize,
    pub method: Method,
    pub uri: String,
    pub failure: FailureClass,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryAction {
    Stop,
    RetryAfter(Duration),
}

impl RetryAction {
    pub fn is_retry(self) -> bool {
        matches!(self, Self::RetryAfter(_))
    }
}

pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, decision: &RetryDecision) -> bool;
}

pub trait RetryEligibility: Send + Sync {
    fn supports_retry(&self, method: &Method, headers: &HeaderMap) -> bool;
}

#[derive(Default)]
pub struct StrictRetryEligibility;

impl RetryEligibility for StrictRetryEligibility {
    fn supports_retry(&self, method: &Method, headers: &HeaderMap) -> bool {
        request_supports_retry(method, headers)
    }
}

#[derive(Default)]
pub struct PermissiveRetryEligibility;

impl RetryEligibility for PermissiveRetryEligibility {
    fn supports_retry(&self, _method: &Method, _headers: &HeaderMap) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Backoff {
    Fixed(Duration),
    Exponential {
        base: Duration,
        max: Duration,
        jitter_ratio: f64,
    },
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    backoff: Backoff,
    retry_server_errors: bool,
    retryable_status_codes: BTreeSet<u16>,
    retryable_transport_error_kinds: BTreeSet<TransportErrorKind>,
    retry_auth_refresh_failures: bool,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("retry_server_errors", &self.retry_server_errors)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field(
                "retryable_transport_error_kinds",
                &self.retryable_transport_error_kinds,
            )
            .field(
                "retry_auth_refresh_failures",
                &self.retry_auth_refresh_failures,
            )
            .finish()
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self::fixed_delay(0, Duration::ZERO)
    }

    /// Up to `max_retries` retries, `delay` apart.
    pub fn fixed_delay(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed(delay),
            retry_server_errors: true,
            retryable_status_codes: BTreeSet::new(),
            retryable_transport_error_kinds: default_retryable_transport_error_kinds(),
            retry_auth_refresh_failures: true,
            retry_classifier: None,
        }
    }

    pub fn standard() -> Self {
        Self {
            backoff: Backoff::Exponential {
                base: Duration::from_millis(200),
                max: Duration::from_secs(2),
                jitter_ratio: 0.2,
            },
            ..Self::fixed_delay(3, Duration::ZERO)
        }
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.backoff = Backoff::Fixed(delay);
        self
    }

    pub fn base_backoff(mut self, base_backoff: Duration) -> Self {
        let base = base_backoff.max(Duration::from_millis(1));
        self.backoff = match self.backoff {
            Backoff::Exponential {
                max, jitter_ratio, ..
            } => Backoff::Exponential {
                base,
                max: max.max(base),
                jitter_ratio,
            },
            Backoff::Fixed(_) => Backoff::Exponential {
                base,
                max: base.saturating_mul(8),
                jitter_ratio: 0.0,
            },
        };
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        if let Backoff::Exponential {
            base, jitter_ratio, ..
        } = self.backoff
        {
            self.backoff = Backoff::Exponential {
                base,
                max: max_backoff.max(base),
                jitter_ratio,
            };
        }
        self
    }

    pub fn jitter_ratio(mut self, ratio: f64) -> Self {
        if let Backoff::Exponential { base, max, .. } = self.backoff {
            self.backoff = Backoff::Exponential {
                base,
                max,
                jitter_ratio: ratio.clamp(0.0, 1.0),
            };
        }
        self
    }

    pub fn retry_server_errors(mut self, retry: bool) -> Self {
        self.retry_server_errors = retry;
        self
    }

    /// Opt an extra status (e.g. 429) into retries. 401 is never accepted:
    /// it belongs to the credential refresh path.
    pub fn retry_status(mut self, status: u16) -> Self {
        if status != StatusCode::UNAUTHORIZED.as_u16() {
            self.retryable_status_codes.insert(status);
        }
        self
    }

    pub fn retryable_transport_error_kinds(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.retryable_transport_error_kinds = kinds.into_iter().collect();
        self
    }

    pub fn retry_auth_refresh_failures(mut self, retry: bool) -> Self {
        self.retry_auth_refresh_failures = retry;
        self
    }

    pub fn retry_classifier(mut self, retry_classifier: Arc<dyn RetryClassifier>) -> Self {
        self.retry_classifier = Some(retry_classifier);
        self
    }

    pub fn configured_max_retries(&self) -> usize {
        self.max_retries
    }

    /// Whether a failure of this class may ever be retried under this policy.
    pub fn is_retryable(&self, failure: &FailureClass) -> bool {
        match failure {
            FailureClass::ServerError(status) => {
                self.retry_server_errors || self.retryable_status_codes.contains(&status.as_u16())
            }
            FailureClass::ClientError(status) => {
                self.retryable_status_codes.contains(&status.as_u16())
            }
            FailureClass::Transport(kind) => self.retryable_transport_error_kinds.contains(kind),
            FailureClass::AuthRefresh => self.retry_auth_refresh_failures,
            FailureClass::Unauthorized | FailureClass::Local => false,
        }
    }

    /// `attempt` counts the sends already made under this budget, starting at 1.
    pub fn should_retry(&self, attempt: usize, failure: &FailureClass) -> RetryAction {
        if attempt > self.max_retries || !self.is_retryable(failure) {
            return RetryAction::Stop;
        }
        RetryAction::RetryAfter(self.backoff_for_retry(attempt))
    }

    pub(crate) fn decide(&self, decision: &RetryDecision) -> RetryAction {
        if decision.attempt > self.max_retries
            || matches!(
                decision.failure,
                FailureClass::Unauthorized | FailureClass::Local
            )
        {
            return RetryAction::Stop;
        }
        if self.permits(decision) {
            RetryAction::RetryAfter(self.backoff_for_retry(decision.attempt))
        } else {
            RetryAction::Stop
        }
    }

    /// Class-level verdict ignoring the remaining budget.
    pub(crate) fn permits(&self, decision: &RetryDecision) -> bool {
        match &self.retry_classifier {
            Some(classifier) => classifier.should_retry(decision),
            None => self.is_retryable(&decision.failure),
        }
    }

    pub(crate) fn backoff_for_retry(&self, retry_index: usize) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential {
                base,
                max,
                jitter_ratio,
            } => {
                let capped_exponent = retry_index.saturating_sub(1).min(31) as u32;
                let multiplier = 1_u128 << capped_exponent;
                let base_ms = base.as_millis().max(1);
                let max_ms = max.as_millis().max(base_ms);
                let delay_ms = base_ms
                    .saturating_mul(multiplier)
                    .min(max_ms)
                    .min(u64::MAX as u128) as u64;
                apply_jitter(Duration::from_millis(delay_ms), max, jitter_ratio)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed_delay(3, Duration::from_secs(1))
    }
}

fn apply_jitter(backoff: Duration, max_backoff: Duration, jitter_ratio: f64) -> Duration {
    if jitter_ratio <= f64::EPSILON {
        return backoff;
    }

    let backoff_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
    if backoff_ms <= 1 {
        return backoff;
    }
    let max_backoff_ms = max_backoff.as_millis().min(u64::MAX as u128) as u64;

    let jitter_span = ((backoff_ms as f64) * jitter_ratio).round().max(1.0) as u64;
    let low = backoff_ms.saturating_sub(jitter_span);
    let high = backoff_ms.saturating_add(jitter_span).max(low);
    let mut rng = rand::rng();
    let sampled_ms = rng.random_range(low..=high).min(max_backoff_ms.max(1));
    Duration::from_millis(sampled_ms)
}

fn default_retryable_transport_error_kinds() -> BTreeSet<TransportErrorKind> {
    [
        TransportErrorKind::ConnectFailed,
        TransportErrorKind::ConnectTimeout,
        TransportErrorKind::ReadTimeout,
    ]
    .into_iter()
    .collect()
}

pub(crate) fn request_supports_retry(method: &Method, headers: &HeaderMap) -> bool {
    is_method_idempotent(method) || headers.get(IDEMPOTENCY_KEY_HEADER).is_some()
}

fn is_method_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::StatusCode;

    use super::{RetryAction, RetryPolicy};
    use crate::error::{FailureClass, TransportErrorKind};

    #[test]
    fn jittered_backoff_never_exceeds_configured_max_backoff() {
        let policy = RetryPolicy::standard()
            .base_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_millis(120))
            .jitter_ratio(1.0);

        for _ in 0..256 {
            let backoff = policy.backoff_for_retry(3);
            assert!(backoff <= Duration::from_millis(120));
        }
    }

    #[test]
    fn fixed_delay_retries_server_errors_until_budget_is_spent() {
        let policy = RetryPolicy::fixed_delay(3, Duration::from_secs(1));
        let failure = FailureClass::ServerError(StatusCode::SERVICE_UNAVAILABLE);

        for attempt in 1..=3 {
            assert_eq!(
                policy.should_retry(attempt, &failure),
                RetryAction::RetryAfter(Duration::from_secs(1))
            );
        }
        assert_eq!(policy.should_retry(4, &failure), RetryAction::Stop);
    }

    #[test]
    fn client_errors_are_never_retried_regardless_of_budget() {
        let policy = RetryPolicy::fixed_delay(10, Duration::ZERO);
        let failure = FailureClass::ClientError(StatusCode::PAYMENT_REQUIRED);
        assert_eq!(policy.should_retry(1, &failure), RetryAction::Stop);
        assert_eq!(
            policy.should_retry(1, &FailureClass::Unauthorized),
            RetryAction::Stop
        );
    }

    #[test]
    fn retry_status_cannot_opt_in_unauthorized() {
        let policy = RetryPolicy::fixed_delay(2, Duration::ZERO)
            .retry_status(429)
            .retry_status(401);
        assert!(policy.is_retryable(&FailureClass::ClientError(StatusCode::TOO_MANY_REQUESTS)));
        assert!(!policy.is_retryable(&FailureClass::Unauthorized));
    }

    #[test]
    fn other_io_transport_errors_are_opt_in() {
        let policy = RetryPolicy::fixed_delay(2, Duration::ZERO);
        assert!(policy.is_retryable(&FailureClass::Transport(
            TransportErrorKind::ConnectTimeout
        )));
        assert!(!policy.is_retryable(&FailureClass::Transport(TransportErrorKind::OtherIo)));

        let policy = policy.retryable_transport_error_kinds([TransportErrorKind::OtherIo]);
        assert!(policy.is_retryable(&FailureClass::Transport(TransportErrorKind::OtherIo)));
    }

    #[test]
    fn disabled_policy_stops_on_first_failure() {
        let policy = RetryPolicy::disabled();
        assert_eq!(
            policy.should_retry(1, &FailureClass::ServerError(StatusCode::BAD_GATEWAY)),
            RetryAction::Stop
        );
    }
}
