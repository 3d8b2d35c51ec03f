//! Classification-aware retry with exponential backoff and an overall deadline.
//!
//! Every provider call in the pipeline goes through [`RetryExecutor::execute`]. One invocation
//! walks the state machine `Attempting -> {Succeeded | Retrying -> Attempting | FailedFinal}`:
//!
//! - retryable errors back off for `min(initial_delay * 2^retry, max_delay)` (or the provider's
//!   `retry-after`, whichever is longer, still capped at `max_delay`);
//! - fatal errors and exhausted retries end in `FailedFinal` carrying the last error;
//! - the wall-clock deadline bounds the whole sequence, including an attempt in flight;
//! - cancellation is observed before each attempt and while backing off, never mid-attempt.

use crate::config::RetrySettings;
use std::fmt::{self, Display};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Retry classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; worth another attempt.
    Retryable,
    /// Permanent; abort immediately.
    Fatal,
}

/// Errors that can tell the executor whether to retry them.
pub trait Classify {
    /// Retry classification.
    fn class(&self) -> ErrorClass;

    /// Server-suggested delay before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Retry parameters for one class of operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for a single delay.
    pub max_delay: Duration,
    /// Wall-clock bound on the whole sequence; `None` disables it.
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    /// Derive a policy from loaded settings.
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay: settings.initial_delay,
            max_delay: settings.max_delay,
            deadline: Some(settings.deadline),
        }
    }

    /// Backoff before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Terminal failure of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// A non-retryable error ended the sequence.
    #[error("non-retryable failure on attempt {attempts}: {source}")]
    Fatal {
        /// Attempts made, including the failing one.
        attempts: u32,
        /// The fatal error.
        #[source]
        source: E,
    },
    /// Every allowed attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Last error observed.
        #[source]
        source: E,
    },
    /// The overall deadline passed before an attempt succeeded.
    #[error(
        "retry deadline of {deadline:?} exceeded after {attempts} attempts{}",
        last_error_suffix(.last)
    )]
    DeadlineExceeded {
        /// Configured deadline.
        deadline: Duration,
        /// Attempts started.
        attempts: u32,
        /// Last completed error, if any attempt finished.
        #[source]
        last: Option<E>,
    },
    /// Cancellation was requested between attempts.
    #[error("cancelled after {attempts} attempts")]
    Cancelled {
        /// Attempts made before cancellation was observed.
        attempts: u32,
    },
}

fn last_error_suffix<E: Display>(last: &Option<E>) -> String {
    last.as_ref()
        .map(|error| format!(" (last error: {error})"))
        .unwrap_or_default()
}

impl<E> RetryError<E> {
    /// Attempts made before the sequence ended.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::DeadlineExceeded { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
        }
    }

    /// Last underlying error, when one was observed.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Fatal { source, .. } | Self::Exhausted { source, .. } => Some(source),
            Self::DeadlineExceeded { last, .. } => last.as_ref(),
            Self::Cancelled { .. } => None,
        }
    }

    /// Whether the sequence ended because of cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Successful result plus the number of attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    /// Operation output.
    pub value: T,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

enum RetryState<E> {
    Attempting { attempt: u32, last: Option<E> },
    Retrying { attempt: u32, delay: Duration, error: E },
}

/// Runs fallible async operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Copy)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor for `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Policy in effect.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds or the policy gives up.
    ///
    /// `operation` receives the 1-based attempt number. `label` only feeds log output.
    pub async fn execute<T, E, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<Retried<T>, RetryError<E>>
    where
        E: Classify + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let deadline_at = self.policy.deadline.map(|deadline| started + deadline);
        let mut state = RetryState::Attempting {
            attempt: 1,
            last: None,
        };

        loop {
            state = match state {
                RetryState::Attempting { attempt, last } => {
                    if cancel.is_cancelled() {
                        return Err(RetryError::Cancelled {
                            attempts: attempt - 1,
                        });
                    }
                    if let (Some(at), Some(deadline)) = (deadline_at, self.policy.deadline) {
                        if Instant::now() >= at {
                            return Err(RetryError::DeadlineExceeded {
                                deadline,
                                attempts: attempt - 1,
                                last,
                            });
                        }
                    }

                    let outcome = match (deadline_at, self.policy.deadline) {
                        (Some(at), Some(deadline)) => {
                            match tokio::time::timeout_at(at, operation(attempt)).await {
                                Ok(outcome) => outcome,
                                Err(_) => {
                                    tracing::warn!(
                                        operation = label,
                                        attempt,
                                        ?deadline,
                                        "Retry deadline expired during attempt"
                                    );
                                    return Err(RetryError::DeadlineExceeded {
                                        deadline,
                                        attempts: attempt,
                                        last,
                                    });
                                }
                            }
                        }
                        _ => operation(attempt).await,
                    };

                    match outcome {
                        Ok(value) => {
                            if attempt > 1 {
                                tracing::info!(operation = label, attempt, "Succeeded after retry");
                            }
                            return Ok(Retried {
                                value,
                                attempts: attempt,
                            });
                        }
                        Err(error) => match error.class() {
                            ErrorClass::Fatal => {
                                tracing::error!(
                                    operation = label,
                                    attempt,
                                    error = %error,
                                    "Non-retryable failure"
                                );
                                return Err(RetryError::Fatal {
                                    attempts: attempt,
                                    source: error,
                                });
                            }
                            ErrorClass::Retryable if attempt > self.policy.max_retries => {
                                tracing::error!(
                                    operation = label,
                                    attempts = attempt,
                                    error = %error,
                                    "Retries exhausted"
                                );
                                return Err(RetryError::Exhausted {
                                    attempts: attempt,
                                    source: error,
                                });
                            }
                            ErrorClass::Retryable => {
                                let delay = self.delay_after(attempt, &error);
                                RetryState::Retrying {
                                    attempt,
                                    delay,
                                    error,
                                }
                            }
                        },
                    }
                }
                RetryState::Retrying {
                    attempt,
                    delay,
                    error,
                } => {
                    if let (Some(at), Some(deadline)) = (deadline_at, self.policy.deadline) {
                        if Instant::now() + delay >= at {
                            tracing::error!(
                                operation = label,
                                attempts = attempt,
                                ?deadline,
                                error = %error,
                                "Backoff would pass the retry deadline"
                            );
                            return Err(RetryError::DeadlineExceeded {
                                deadline,
                                attempts: attempt,
                                last: Some(error),
                            });
                        }
                    }

                    tracing::warn!(
                        operation = label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retryable failure; backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(RetryError::Cancelled { attempts: attempt });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    RetryState::Attempting {
                        attempt: attempt + 1,
                        last: Some(error),
                    }
                }
            };
        }
    }

    fn delay_after<E: Classify>(&self, attempt: u32, error: &E) -> Duration {
        let backoff = self.policy.backoff(attempt - 1);
        error
            .retry_after()
            .map_or(backoff, |hint| hint.max(backoff))
            .min(self.policy.max_delay)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => write!(f, "retryable"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone)]
    struct TestError {
        class: ErrorClass,
        retry_after: Option<Duration>,
    }

    impl TestError {
        fn retryable() -> Self {
            Self {
                class: ErrorClass::Retryable,
                retry_after: None,
            }
        }

        fn fatal() -> Self {
            Self {
                class: ErrorClass::Fatal,
                retry_after: None,
            }
        }
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{} test error", self.class)
        }
    }

    impl Classify for TestError {
        fn class(&self) -> ErrorClass {
            self.class
        }

        fn retry_after(&self) -> Option<Duration> {
            self.retry_after
        }
    }

    #[test]
    fn retry_errors_render_and_chain_the_last_error() {
        use crate::provider::ProviderError;
        use std::error::Error as _;

        let exhausted: RetryError<ProviderError> = RetryError::Exhausted {
            attempts: 4,
            source: ProviderError::Connection("reset".into()),
        };
        assert_eq!(
            exhausted.to_string(),
            "gave up after 4 attempts: Connection to provider failed: reset"
        );
        assert!(exhausted.source().is_some());

        let deadline: RetryError<ProviderError> = RetryError::DeadlineExceeded {
            deadline: Duration::from_secs(5),
            attempts: 2,
            last: Some(ProviderError::Timeout(Duration::from_secs(1))),
        };
        assert_eq!(
            deadline.to_string(),
            "retry deadline of 5s exceeded after 2 attempts \
             (last error: Provider request timed out after 1s)"
        );
        assert!(deadline.source().is_some());

        let silent: RetryError<ProviderError> = RetryError::DeadlineExceeded {
            deadline: Duration::from_secs(5),
            attempts: 1,
            last: None,
        };
        assert_eq!(silent.to_string(), "retry deadline of 5s exceeded after 1 attempts");
        assert!(silent.source().is_none());
        assert!(RetryError::<ProviderError>::Cancelled { attempts: 0 }
            .source()
            .is_none());
    }

    fn policy(max_retries: u32, deadline: Option<Duration>) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            deadline,
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = policy(10, None);
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_secs(1));
        assert_eq!(policy.backoff(40), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn permanently_retryable_failure_makes_max_retries_plus_one_attempts() {
        let executor = RetryExecutor::new(policy(3, None));
        let calls = AtomicU32::new(0);
        let result: Result<Retried<()>, _> = executor
            .execute("test", &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::retryable()) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 4, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_short_circuits() {
        let executor = RetryExecutor::new(policy(5, None));
        let calls = AtomicU32::new(0);
        let result: Result<Retried<()>, _> = executor
            .execute("test", &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::fatal()) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Fatal { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let executor = RetryExecutor::new(policy(3, None));
        let started = Instant::now();
        let result = executor
            .execute("test", &CancellationToken::new(), |attempt| async move {
                if attempt < 3 {
                    Err(TestError::retryable())
                } else {
                    Ok(attempt)
                }
            })
            .await
            .expect("third attempt succeeds");

        assert_eq!(result.value, 3);
        assert_eq!(result.attempts, 3);
        // 100ms + 200ms of backoff.
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_extends_backoff() {
        let executor = RetryExecutor::new(policy(1, None));
        let started = Instant::now();
        let _ = executor
            .execute("test", &CancellationToken::new(), |attempt| async move {
                if attempt == 1 {
                    Err(TestError {
                        class: ErrorClass::Retryable,
                        retry_after: Some(Duration::from_millis(700)),
                    })
                } else {
                    Ok(())
                }
            })
            .await
            .expect("second attempt succeeds");
        assert!(started.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_aborts_sequence_regardless_of_retry_budget() {
        let executor = RetryExecutor::new(RetryPolicy {
            max_retries: 100,
            initial_delay: Duration::from_millis(400),
            max_delay: Duration::from_millis(400),
            deadline: Some(Duration::from_secs(1)),
        });
        let calls = AtomicU32::new(0);
        let result: Result<Retried<()>, _> = executor
            .execute("test", &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::retryable()) }
            })
            .await;

        match result {
            Err(RetryError::DeadlineExceeded { attempts, last, .. }) => {
                assert!(attempts < 101);
                assert!(last.is_some());
            }
            other => panic!("expected deadline error, got {other:?}"),
        }
        assert!(calls.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_a_hanging_attempt() {
        let executor = RetryExecutor::new(policy(3, Some(Duration::from_secs(2))));
        let result: Result<Retried<()>, RetryError<TestError>> = executor
            .execute("test", &CancellationToken::new(), |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(RetryError::DeadlineExceeded { attempts: 1, last: None, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_observed_during_backoff() {
        let executor = RetryExecutor::new(RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            deadline: None,
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let result: Result<Retried<()>, _> = executor
            .execute("test", &cancel, |_| async { Err(TestError::retryable()) })
            .await;
        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_attempt() {
        let executor = RetryExecutor::new(policy(3, None));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let result: Result<Retried<()>, RetryError<TestError>> = executor
            .execute("test", &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 0 })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
