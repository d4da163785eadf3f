//! Sagas - forward steps, reverse compensation.
//!
//! A saga is an ordered list of named steps, each an async action with an
//! optional compensation. `execute` runs actions in order; on the first
//! failure, compensations for the steps that *completed* run in reverse
//! order. Compensation failures are logged and the unwind continues - a saga
//! reports truth about what ran, it does not pretend the unwind is atomic.
//!
//! Sagas are local compensation chains, not distributed transactions.
//!
//! # Example
//!
//! ```ignore
//! let report = Saga::new("provision_account")
//!     .step("create_user", || async { db.create_user().await })
//!     .step_with_compensation(
//!         "reserve_quota",
//!         || async { quota.reserve().await },
//!         || async { quota.release().await },
//!     )
//!     .step("send_welcome", || async { mailer.send().await })
//!     .execute()
//!     .await;
//! assert!(report.success);
//! ```

use std::future::Future;
use std::pin::Pin;

type StepFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type StepFn = Box<dyn FnOnce() -> StepFuture + Send>;

struct SagaStep {
    name: String,
    action: StepFn,
    compensation: Option<StepFn>,
}

/// Outcome of a saga run.
#[derive(Debug)]
pub struct SagaReport {
    /// True when every step completed.
    pub success: bool,
    /// Names of the steps that completed, in execution order.
    pub executed_steps: Vec<String>,
    /// The error from the failing step, if any.
    pub error: Option<anyhow::Error>,
}

/// An ordered sequence of actions with compensations.
pub struct Saga {
    name: String,
    steps: Vec<SagaStep>,
}

impl Saga {
    /// Create an empty saga.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step with no compensation.
    pub fn step<F, Fut>(mut self, name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.steps.push(SagaStep {
            name: name.into(),
            action: Box::new(move || Box::pin(action())),
            compensation: None,
        });
        self
    }

    /// Append a step with a compensation that undoes it.
    pub fn step_with_compensation<F, Fut, C, CFut>(
        mut self,
        name: impl Into<String>,
        action: F,
        compensation: C,
    ) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
        C: FnOnce() -> CFut + Send + 'static,
        CFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.steps.push(SagaStep {
            name: name.into(),
            action: Box::new(move || Box::pin(action())),
            compensation: Some(Box::new(move || Box::pin(compensation()))),
        });
        self
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True when no steps were added.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run the saga.
    pub async fn execute(self) -> SagaReport {
        let saga_name = self.name;
        let mut executed: Vec<(String, Option<StepFn>)> = Vec::new();

        for step in self.steps {
            tracing::debug!(saga = %saga_name, step = %step.name, "executing step");
            match (step.action)().await {
                Ok(()) => executed.push((step.name, step.compensation)),
                Err(e) => {
                    tracing::warn!(
                        saga = %saga_name,
                        step = %step.name,
                        error = %e,
                        "step failed, compensating"
                    );
                    let executed_steps: Vec<String> =
                        executed.iter().map(|(n, _)| n.clone()).collect();
                    // Unwind completed steps in reverse order.
                    for (name, compensation) in executed.into_iter().rev() {
                        let Some(compensation) = compensation else {
                            continue;
                        };
                        if let Err(ce) = compensation().await {
                            tracing::error!(
                                saga = %saga_name,
                                step = %name,
                                error = %ce,
                                "compensation failed"
                            );
                        }
                    }
                    return SagaReport {
                        success: false,
                        executed_steps,
                        error: Some(e),
                    };
                }
            }
        }

        SagaReport {
            success: true,
            executed_steps: executed.into_iter().map(|(n, _)| n).collect(),
            error: None,
        }
    }
}
