//! Saga runner: ordered `(forward, compensation)` steps.
//!
//! Forward steps run in order. When one fails, the compensations of the steps
//! that already committed run in reverse order. Every compensation runs to
//! completion even if an earlier one failed; the first compensation failure is
//! reported once alongside the original error. Compensations never trigger
//! further compensation.
//!
//! # Example
//!
//! ```
//! use futures::future::BoxFuture;
//! use lease_pool_runtime::saga::{Saga, SagaStep};
//!
//! struct Push(&'static str);
//!
//! impl SagaStep<Vec<&'static str>, String> for Push {
//!     fn name(&self) -> &'static str {
//!         self.0
//!     }
//!
//!     fn execute<'a>(&'a self, log: &'a mut Vec<&'static str>) -> BoxFuture<'a, Result<(), String>> {
//!         Box::pin(async move {
//!             log.push(self.0);
//!             Ok(())
//!         })
//!     }
//!
//!     fn compensate<'a>(&'a self, log: &'a mut Vec<&'static str>) -> BoxFuture<'a, Result<(), String>> {
//!         Box::pin(async move {
//!             log.retain(|entry| *entry != self.0);
//!             Ok(())
//!         })
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let saga = Saga::new("example").step(Push("a")).step(Push("b"));
//! let mut log = Vec::new();
//! saga.run(&mut log).await.unwrap();
//! assert_eq!(log, vec!["a", "b"]);
//! # });
//! ```

use futures::future::BoxFuture;
use std::fmt;
use thiserror::Error;

/// One step of a saga.
pub trait SagaStep<C, E>: Send + Sync {
    /// Step name, for logs and errors.
    fn name(&self) -> &'static str;

    /// Forward action.
    ///
    /// # Errors
    ///
    /// A failure stops the saga and compensates the committed steps.
    fn execute<'a>(&'a self, ctx: &'a mut C) -> BoxFuture<'a, Result<(), E>>;

    /// Undo the forward action after a later step failed.
    ///
    /// # Errors
    ///
    /// Reported as the saga's compensation failure; not compensated further.
    fn compensate<'a>(&'a self, ctx: &'a mut C) -> BoxFuture<'a, Result<(), E>>;
}

/// A compensation that did not succeed.
#[derive(Error, Debug)]
#[error("compensation of '{step}' failed: {error}")]
pub struct CompensationFailure<E: fmt::Debug + fmt::Display> {
    /// Step whose compensation failed.
    pub step: &'static str,
    /// Compensation error.
    pub error: E,
}

/// A failed saga run.
#[derive(Error, Debug)]
#[error("saga step '{step}' failed: {error}")]
pub struct SagaError<E: fmt::Debug + fmt::Display> {
    /// Forward step that failed.
    pub step: &'static str,
    /// Its error.
    pub error: E,
    /// First compensation failure, if any.
    pub compensation: Option<CompensationFailure<E>>,
}

/// Ordered list of saga steps over a context `C`.
pub struct Saga<C, E> {
    name: &'static str,
    steps: Vec<Box<dyn SagaStep<C, E>>>,
}

impl<C, E> Saga<C, E>
where
    C: Send,
    E: fmt::Debug + fmt::Display,
{
    /// Empty saga.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            steps: Vec::new(),
        }
    }

    /// Append a step.
    #[must_use]
    pub fn step(mut self, step: impl SagaStep<C, E> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Run every step against `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError`] naming the failed step; committed steps have been
    /// compensated by then.
    pub async fn run(&self, ctx: &mut C) -> Result<(), SagaError<E>> {
        for (index, step) in self.steps.iter().enumerate() {
            let Err(error) = step.execute(ctx).await else {
                continue;
            };

            tracing::warn!(
                saga = self.name,
                step = step.name(),
                error = %error,
                "Saga step failed, compensating"
            );
            metrics::counter!("lease_pool.saga.compensations", "saga" => self.name).increment(1);

            let compensation = self.compensate(&self.steps[..index], ctx).await;
            return Err(SagaError {
                step: step.name(),
                error,
                compensation,
            });
        }
        Ok(())
    }

    async fn compensate(
        &self,
        committed: &[Box<dyn SagaStep<C, E>>],
        ctx: &mut C,
    ) -> Option<CompensationFailure<E>> {
        let mut first_failure = None;
        for step in committed.iter().rev() {
            if let Err(error) = step.compensate(ctx).await {
                tracing::error!(
                    saga = self.name,
                    step = step.name(),
                    error = %error,
                    "Compensation failed"
                );
                metrics::counter!("lease_pool.saga.compensation_failures", "saga" => self.name)
                    .increment(1);
                if first_failure.is_none() {
                    first_failure = Some(CompensationFailure {
                        step: step.name(),
                        error,
                    });
                }
            }
        }
        first_failure
    }
}

impl<C, E> fmt::Debug for Saga<C, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.steps.iter().map(|s| s.name()).collect();
        f.debug_struct("Saga")
            .field("name", &self.name)
            .field("steps", &names)
            .finish()
    }
}
