//! Fan-out of independent operations with aggregated errors.

use lease_pool_core::error::AggregateError;
use std::fmt;
use std::future::Future;

/// Result of one fan-out.
#[derive(Debug)]
pub struct FanoutOutcome<R, E> {
    /// Number of items an operation was dispatched for.
    pub attempted: usize,
    /// Outputs of the operations that succeeded, in item order.
    pub succeeded: Vec<R>,
    /// Errors of the operations that failed, in item order.
    pub failed: Vec<E>,
}

impl<R, E> FanoutOutcome<R, E> {
    /// `Ok` with every output if nothing failed, else every error under
    /// `message`.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError`] if any operation failed.
    pub fn into_result(self, message: impl Into<String>) -> Result<Vec<R>, AggregateError<E>> {
        if self.failed.is_empty() {
            Ok(self.succeeded)
        } else {
            Err(AggregateError::new(message, self.failed))
        }
    }
}

/// Dispatches one operation per item and continues past failures.
///
/// Operations run one after another, in item order; a failed item never keeps
/// its siblings from running.
///
/// # Example
///
/// ```
/// use lease_pool_runtime::fanout::FanoutInvoker;
///
/// # tokio_test::block_on(async {
/// let fanout = FanoutInvoker::new("double");
/// let outcome = fanout
///     .dispatch(vec![1, 2, 3], |n| async move {
///         if n == 2 { Err(format!("item {n} rejected")) } else { Ok(n * 2) }
///     })
///     .await;
///
/// assert_eq!(outcome.attempted, 3);
/// assert_eq!(outcome.succeeded, vec![2, 6]);
/// assert_eq!(outcome.failed, vec!["item 2 rejected".to_string()]);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct FanoutInvoker {
    name: &'static str,
}

impl FanoutInvoker {
    /// Invoker labelled `name` in logs and metrics.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    /// Run `operation` once per item.
    pub async fn dispatch<T, R, E, F, Fut>(
        &self,
        items: impl IntoIterator<Item = T>,
        mut operation: F,
    ) -> FanoutOutcome<R, E>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: fmt::Display,
    {
        let mut outcome = FanoutOutcome {
            attempted: 0,
            succeeded: Vec::new(),
            failed: Vec::new(),
        };

        for item in items {
            outcome.attempted += 1;
            match operation(item).await {
                Ok(output) => outcome.succeeded.push(output),
                Err(error) => {
                    tracing::warn!(fanout = self.name, error = %error, "Fan-out item failed");
                    outcome.failed.push(error);
                }
            }
        }

        metrics::counter!("lease_pool.fanout.attempted", "fanout" => self.name)
            .increment(outcome.attempted as u64);
        metrics::counter!("lease_pool.fanout.failed", "fanout" => self.name)
            .increment(outcome.failed.len() as u64);
        tracing::debug!(
            fanout = self.name,
            attempted = outcome.attempted,
            failed = outcome.failed.len(),
            "Fan-out complete"
        );

        outcome
    }
}
