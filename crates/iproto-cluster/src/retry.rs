//! Retry policies and the dispatcher that applies them.
//!
//! This is the only place that decides whether an error is worth another
//! attempt; every other component just reports what happened.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use iproto_client::{Request, RequestDispatcher};
use iproto_common::protocol::error::{Error, Result};

/// Decides whether an error is retryable.
#[derive(Clone)]
pub struct ErrorPredicate(Arc<dyn Fn(&Error) -> bool + Send + Sync>);

impl ErrorPredicate {
    pub fn custom(predicate: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Transport failures, timeouts, closed connections and the like.
    pub fn network_errors() -> Self {
        Self::custom(Error::is_network)
    }

    /// The server reported that the called function does not exist, as
    /// happens while a restarted instance is still loading its code.
    pub fn no_such_procedure() -> Self {
        Self::custom(Error::is_no_such_procedure)
    }

    pub fn or(self, other: ErrorPredicate) -> Self {
        Self::custom(move |error| self.test(error) || other.test(error))
    }

    pub fn test(&self, error: &Error) -> bool {
        (self.0)(error)
    }
}

impl fmt::Debug for ErrorPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorPredicate")
    }
}

/// Pause before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDelay {
    Fixed(Duration),
    /// `initial`, then multiplied by `multiplier` after every attempt,
    /// capped at `max`
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl RetryDelay {
    pub fn none() -> Self {
        RetryDelay::Fixed(Duration::ZERO)
    }

    /// Delay after the `attempt`-th failed attempt (1-based).
    pub fn after_attempt(&self, attempt: u32) -> Duration {
        match *self {
            RetryDelay::Fixed(delay) => delay,
            RetryDelay::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let millis = initial.as_millis() as f64 * multiplier.powi(exponent);
                if millis.is_finite() && millis < max.as_millis() as f64 {
                    Duration::from_millis(millis as u64)
                } else {
                    max
                }
            }
        }
    }
}

impl Default for RetryDelay {
    /// 50ms doubling up to 5s.
    fn default() -> Self {
        RetryDelay::Exponential {
            initial: Duration::from_millis(50),
            multiplier: 2.0,
            max: Duration::from_millis(5000),
        }
    }
}

/// Retry errors matching `predicate` until `max_attempts` attempts were made.
#[derive(Debug, Clone)]
pub struct RetryRule {
    pub predicate: ErrorPredicate,
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub delay: RetryDelay,
}

impl RetryRule {
    pub fn new(predicate: ErrorPredicate, max_attempts: u32, delay: RetryDelay) -> Self {
        Self {
            predicate,
            max_attempts,
            delay,
        }
    }

    pub fn should_retry(&self, error: &Error, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts && self.predicate.test(error))
            .then(|| self.delay.after_attempt(attempt))
    }
}

/// A set of rules; an error is retried if any rule allows it.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use iproto_cluster::retry::{ErrorPredicate, RetryDelay, RetryPolicy};
/// use iproto_common::Error;
///
/// let policy = RetryPolicy::by_attempts(
///     5,
///     ErrorPredicate::network_errors().or(ErrorPredicate::no_such_procedure()),
///     RetryDelay::Fixed(Duration::from_millis(300)),
/// );
/// let refused = Error::Transport("connection refused".into());
/// assert_eq!(policy.should_retry(&refused, 1), Some(Duration::from_millis(300)));
/// assert_eq!(policy.should_retry(&refused, 5), None);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    rules: Vec<RetryRule>,
}

impl RetryPolicy {
    /// Never retries.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn by_attempts(max_attempts: u32, predicate: ErrorPredicate, delay: RetryDelay) -> Self {
        Self::none().with_rule(RetryRule::new(predicate, max_attempts, delay))
    }

    pub fn with_rule(mut self, rule: RetryRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Delay before retrying after `error` ended attempt number `attempt`
    /// (1-based), or `None` to give up.
    pub fn should_retry(&self, error: &Error, attempt: u32) -> Option<Duration> {
        self.rules
            .iter()
            .find_map(|rule| rule.should_retry(error, attempt))
    }
}

/// Re-dispatches failed requests according to a [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryingDispatcher<D> {
    inner: D,
    policy: RetryPolicy,
}

impl<D> RetryingDispatcher<D> {
    pub fn new(inner: D, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl<D> RequestDispatcher for RetryingDispatcher<D>
where
    D: RequestDispatcher,
{
    fn dispatch(&self, request: Request) -> BoxFuture<'_, Result<Bytes>> {
        Box::pin(async move {
            let mut attempt = 0;
            loop {
                attempt += 1;
                let error = match self.inner.dispatch(request.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(e) => e,
                };

                let Some(delay) = self.policy.should_retry(&error, attempt) else {
                    if attempt > 1 {
                        debug!(attempt, error = %error, "Giving up after retries");
                    }
                    return Err(error);
                };

                warn!(
                    attempt,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Request failed, retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    /// Fails `failures` times with `error`, then succeeds.
    struct Scripted {
        calls: AtomicU32,
        failures: u32,
        error: fn() -> Error,
    }

    impl Scripted {
        fn failing(failures: u32, error: fn() -> Error) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                error,
            }
        }
    }

    impl RequestDispatcher for Scripted {
        fn dispatch(&self, _request: Request) -> BoxFuture<'_, Result<Bytes>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let result = if call <= self.failures {
                Err((self.error)())
            } else {
                Ok(Bytes::from_static(b"ok"))
            };
            Box::pin(async move { result })
        }
    }

    fn refused() -> Error {
        Error::Transport("connection refused".into())
    }

    fn no_such_proc() -> Error {
        Error::Server {
            code: 33,
            message: "Procedure 'crud.select' is not defined".into(),
        }
    }

    fn access_denied() -> Error {
        Error::Server {
            code: 42,
            message: "Execute access denied".into(),
        }
    }

    #[test]
    fn test_predicates() {
        let network = ErrorPredicate::network_errors();
        let combined = ErrorPredicate::network_errors().or(ErrorPredicate::no_such_procedure());

        assert!(network.test(&refused()));
        assert!(!network.test(&no_such_proc()));
        assert!(combined.test(&no_such_proc()));
        assert!(!combined.test(&access_denied()));

        let custom = ErrorPredicate::custom(|e| e.server_code() == Some(42));
        assert!(custom.test(&access_denied()));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let delay = RetryDelay::default();
        assert_eq!(delay.after_attempt(1), Duration::from_millis(50));
        assert_eq!(delay.after_attempt(2), Duration::from_millis(100));
        assert_eq!(delay.after_attempt(3), Duration::from_millis(200));
        assert_eq!(delay.after_attempt(20), Duration::from_millis(5000));
        assert_eq!(delay.after_attempt(u32::MAX), Duration::from_millis(5000));
    }

    #[test]
    fn test_policy_combines_rules() {
        let policy = RetryPolicy::none()
            .with_rule(RetryRule::new(ErrorPredicate::network_errors(), 2, RetryDelay::none()))
            .with_rule(RetryRule::new(
                ErrorPredicate::no_such_procedure(),
                4,
                RetryDelay::Fixed(Duration::from_millis(10)),
            ));

        assert_eq!(policy.should_retry(&refused(), 1), Some(Duration::ZERO));
        assert_eq!(policy.should_retry(&refused(), 2), None);
        assert_eq!(policy.should_retry(&no_such_proc(), 3), Some(Duration::from_millis(10)));
        assert_eq!(policy.should_retry(&access_denied(), 1), None);
        assert_eq!(RetryPolicy::none().should_retry(&refused(), 1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_attempts_two_delays() {
        let dispatcher = RetryingDispatcher::new(
            Scripted::failing(u32::MAX, refused),
            RetryPolicy::by_attempts(
                3,
                ErrorPredicate::network_errors(),
                RetryDelay::Fixed(Duration::from_millis(300)),
            ),
        );

        let start = Instant::now();
        let err = dispatcher.ping().await.unwrap_err();

        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(dispatcher.inner().calls.load(Ordering::SeqCst), 3);
        // two delays of 300ms, none after the last attempt
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(600), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(900), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let dispatcher = RetryingDispatcher::new(
            Scripted::failing(2, no_such_proc),
            RetryPolicy::by_attempts(
                5,
                ErrorPredicate::network_errors().or(ErrorPredicate::no_such_procedure()),
                RetryDelay::Fixed(Duration::from_millis(300)),
            ),
        );

        let request = Request::call("crud.select", vec![]).unwrap();
        let start = Instant::now();
        let response = dispatcher.dispatch(request).await.unwrap();
        assert_eq!(response, Bytes::from_static(b"ok"));
        assert_eq!(dispatcher.inner().calls.load(Ordering::SeqCst), 3);

        // Two waits of 300ms, nothing more
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(600), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(900), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn test_non_matching_error_is_not_retried() {
        let dispatcher = RetryingDispatcher::new(
            Scripted::failing(u32::MAX, access_denied),
            RetryPolicy::by_attempts(5, ErrorPredicate::network_errors(), RetryDelay::none()),
        );

        let err = dispatcher.ping().await.unwrap_err();
        assert_eq!(err.server_code(), Some(42));
        assert_eq!(dispatcher.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_delay_does_not_sleep() {
        // Real time: a zero delay must not take a trip through the timer
        let dispatcher = RetryingDispatcher::new(
            Scripted::failing(3, refused),
            RetryPolicy::by_attempts(4, ErrorPredicate::network_errors(), RetryDelay::none()),
        );

        let start = std::time::Instant::now();
        dispatcher.ping().await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(dispatcher.inner().calls.load(Ordering::SeqCst), 4);
    }
}
