//! Ordered lease post-processing steps with per-step failure policy.
//!
//! Some steps (core persistence) must stop the pipeline when they fail, others
//! (best-effort notification) must not. Every failure is recorded, prefixed
//! with the step name.

use futures::future::BoxFuture;
use lease_pool_core::model::Lease;
use std::fmt;

type StepFn<C, E> =
    Box<dyn for<'a> Fn(&'a C, &'a mut Lease) -> BoxFuture<'a, Result<(), E>> + Send + Sync>;

struct Step<C, E> {
    name: &'static str,
    fail_fast: bool,
    handler: StepFn<C, E>,
}

/// A recorded step failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Step that failed.
    pub step: &'static str,
    /// Rendered error.
    pub message: String,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.message)
    }
}

/// Named, ordered list of steps over a shared context and a lease.
///
/// # Example
///
/// ```
/// use lease_pool_runtime::pipeline::MultiStepTaskRunner;
/// # use lease_pool_core::model::{Lease, LeaseStatus, LeaseStatusReason};
///
/// # tokio_test::block_on(async {
/// # let mut lease = Lease {
/// #     account_id: "1".into(), principal_id: "p".into(), id: "l".into(),
/// #     status: LeaseStatus::Active, status_reason: LeaseStatusReason::Active,
/// #     budget_amount: 1.0, budget_currency: "USD".into(),
/// #     budget_notification_emails: vec![], created_on: 0, last_modified_on: 0,
/// #     status_modified_on: 0, expires_on: 0,
/// # };
/// let mut runner = MultiStepTaskRunner::<(), String>::new("example");
/// runner.add_step("notify", false, |_, _| Box::pin(async { Err("offline".to_string()) }));
/// runner.add_step("persist", true, |_, lease| {
///     Box::pin(async move {
///         lease.budget_amount = 2.0;
///         Ok(())
///     })
/// });
///
/// let (all_succeeded, fatal) = runner.execute(&(), &mut lease).await;
/// assert!(!all_succeeded);
/// assert!(fatal.is_none());
/// assert_eq!(runner.errors()[0].to_string(), "notify: offline");
/// # });
/// ```
pub struct MultiStepTaskRunner<C, E> {
    name: &'static str,
    steps: Vec<Step<C, E>>,
    errors: Vec<StepFailure>,
}

impl<C, E> MultiStepTaskRunner<C, E>
where
    C: Sync,
    E: fmt::Display,
{
    /// Empty runner.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            steps: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Append a step. A `fail_fast` step stops the pipeline when it fails.
    pub fn add_step<F>(&mut self, name: &'static str, fail_fast: bool, handler: F)
    where
        F: for<'a> Fn(&'a C, &'a mut Lease) -> BoxFuture<'a, Result<(), E>>
            + Send
            + Sync
            + 'static,
    {
        self.steps.push(Step {
            name,
            fail_fast,
            handler: Box::new(handler),
        });
    }

    /// Run the steps in order.
    ///
    /// Returns `(all_succeeded, fatal_error)`. `all_succeeded` is false
    /// whenever any step failed; `fatal_error` is the error of the fail-fast
    /// step that stopped the pipeline. Errors from the previous run are
    /// cleared first.
    pub async fn execute(&mut self, ctx: &C, lease: &mut Lease) -> (bool, Option<E>) {
        self.errors.clear();

        for step in &self.steps {
            let Err(error) = (step.handler)(ctx, &mut *lease).await else {
                continue;
            };

            self.errors.push(StepFailure {
                step: step.name,
                message: error.to_string(),
            });

            if step.fail_fast {
                tracing::warn!(
                    pipeline = self.name,
                    step = step.name,
                    error = %error,
                    "Fail-fast step failed, stopping pipeline"
                );
                return (false, Some(error));
            }

            tracing::warn!(
                pipeline = self.name,
                step = step.name,
                error = %error,
                "Step failed, continuing"
            );
        }

        (self.errors.is_empty(), None)
    }

    /// Failures recorded by the last [`MultiStepTaskRunner::execute`].
    #[must_use]
    pub fn errors(&self) -> &[StepFailure] {
        &self.errors
    }
}

impl<C, E> fmt::Debug for MultiStepTaskRunner<C, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps: Vec<_> = self.steps.iter().map(|s| (s.name, s.fail_fast)).collect();
        f.debug_struct("MultiStepTaskRunner")
            .field("name", &self.name)
            .field("steps", &steps)
            .field("errors", &self.errors)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use lease_pool_core::model::LeaseStatus;
    use lease_pool_testing::fixtures;
    use std::sync::{Arc, Mutex};

    type Calls = Arc<Mutex<Vec<&'static str>>>;

    fn recording_step(
        calls: &Calls,
        name: &'static str,
        fails: bool,
    ) -> impl for<'a> Fn(&'a (), &'a mut Lease) -> BoxFuture<'a, Result<(), String>>
    + Send
    + Sync
    + 'static {
        let calls = Arc::clone(calls);
        move |_, _| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.lock().unwrap().push(name);
                if fails {
                    Err(format!("{name} error"))
                } else {
                    Ok(())
                }
            })
        }
    }

    #[tokio::test]
    async fn continue_then_fail_fast_stops_before_remaining_steps() {
        let calls = Calls::default();
        let mut runner = MultiStepTaskRunner::<(), String>::new("test");
        runner.add_step("A", false, recording_step(&calls, "A", true));
        runner.add_step("B", true, recording_step(&calls, "B", true));
        runner.add_step("C", false, recording_step(&calls, "C", false));
        let mut lease = fixtures::lease("123", "alice", LeaseStatus::Active);

        let (all_succeeded, fatal) = runner.execute(&(), &mut lease).await;

        assert!(!all_succeeded);
        assert_eq!(fatal.as_deref(), Some("B error"));
        assert_eq!(*calls.lock().unwrap(), vec!["A", "B"]);
        let rendered: Vec<_> = runner.errors().iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["A: A error", "B: B error"]);
    }

    #[tokio::test]
    async fn continue_failures_run_every_step() {
        let calls = Calls::default();
        let mut runner = MultiStepTaskRunner::<(), String>::new("test");
        runner.add_step("A", false, recording_step(&calls, "A", true));
        runner.add_step("B", false, recording_step(&calls, "B", false));
        let mut lease = fixtures::lease("123", "alice", LeaseStatus::Active);

        let (all_succeeded, fatal) = runner.execute(&(), &mut lease).await;

        assert!(!all_succeeded);
        assert!(fatal.is_none());
        assert_eq!(*calls.lock().unwrap(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn steps_can_mutate_the_lease() {
        let mut runner = MultiStepTaskRunner::<(), String>::new("test");
        runner.add_step("expire", true, |_, lease| {
            Box::pin(async move {
                lease.status = LeaseStatus::Inactive;
                Ok(())
            })
        });
        let mut lease = fixtures::lease("123", "alice", LeaseStatus::Active);

        let (all_succeeded, fatal) = runner.execute(&(), &mut lease).await;

        assert!(all_succeeded);
        assert!(fatal.is_none());
        assert_eq!(lease.status, LeaseStatus::Inactive);
        assert!(runner.errors().is_empty());
    }
}
