//! Wraps a [`Dispatcher`] strategy with the iteration budget and
//! consecutive-failure policy that apply uniformly to every strategy.

use std::sync::Arc;

use crate::supervisor::decision::Decision;
use crate::supervisor::dispatcher::{DecisionContext, Dispatcher, IterationProgress};

pub struct SupervisorRuntime {
    dispatcher: Box<dyn Dispatcher>,
    max_iterations: u32,
    failure_threshold: u32,
    current_iteration: u32,
    consecutive_failures: u32,
    on_iteration: Option<Arc<dyn Fn(IterationProgress) + Send + Sync>>,
}

impl SupervisorRuntime {
    pub fn new(dispatcher: Box<dyn Dispatcher>, max_iterations: u32, failure_threshold: u32) -> Self {
        Self {
            dispatcher,
            max_iterations,
            failure_threshold,
            current_iteration: 0,
            consecutive_failures: 0,
            on_iteration: None,
        }
    }

    pub fn on_iteration(&mut self, cb: Arc<dyn Fn(IterationProgress) + Send + Sync>) {
        self.on_iteration = Some(cb);
    }

    pub fn iteration_counter(&self) -> (u32, u32) {
        (self.current_iteration, self.max_iterations)
    }

    /// Runs one supervisor turn, applying the iteration budget before
    /// spawning anything and the consecutive-failure policy afterward.
    pub async fn run_turn(
        &mut self,
        task_description: &str,
        transcript_path: Option<&str>,
        tool_history: &[crate::session::ToolHistoryEntry],
    ) -> Decision {
        self.current_iteration += 1;

        if self.current_iteration >= self.max_iterations {
            let decision = Decision::abort(
                format!(
                    "iteration budget exhausted ({}/{})",
                    self.current_iteration, self.max_iterations
                ),
                Some("/clear".to_string()),
                1.0,
            );
            self.report_progress();
            return decision;
        }

        let ctx = DecisionContext {
            task_description,
            transcript_path,
            current_iteration: self.current_iteration,
            max_iterations: self.max_iterations,
            tool_history,
        };

        let decision = match self.dispatcher.decide(ctx).await {
            Ok(decision) => {
                self.consecutive_failures = 0;
                decision
            }
            Err(e) => {
                self.consecutive_failures += 1;
                log::warn!(
                    "supervisor turn failed ({}/{} consecutive): {e}",
                    self.consecutive_failures,
                    self.failure_threshold
                );
                if self.consecutive_failures >= self.failure_threshold {
                    Decision::abort(
                        format!(
                            "supervisor failed {} times consecutively",
                            self.consecutive_failures
                        ),
                        Some("/clear".to_string()),
                        1.0,
                    )
                } else {
                    Decision::continue_monitoring(
                        "supervisor error, resuming monitoring".to_string(),
                        0.5,
                    )
                }
            }
        };

        self.report_progress();
        decision
    }

    fn report_progress(&self) {
        if let Some(cb) = &self.on_iteration {
            cb(IterationProgress {
                current: self.current_iteration,
                max: self.max_iterations,
                percentage: self.current_iteration as f32 / self.max_iterations as f32 * 100.0,
                consecutive_failures: self.consecutive_failures,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::decision::DecisionAction;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlwaysFails;
    #[async_trait]
    impl Dispatcher for AlwaysFails {
        async fn decide(&self, _ctx: DecisionContext<'_>) -> Result<Decision, String> {
            Err("boom".to_string())
        }
    }

    struct CountingContinues(AtomicU32);
    #[async_trait]
    impl Dispatcher for CountingContinues {
        async fn decide(&self, _ctx: DecisionContext<'_>) -> Result<Decision, String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Decision::continue_monitoring("ok", 1.0))
        }
    }

    #[tokio::test]
    async fn budget_exhaustion_aborts_before_spawning() {
        let mut runtime = SupervisorRuntime::new(Box::new(CountingContinues(AtomicU32::new(0))), 2, 3);
        let history = Vec::new();
        let first = runtime.run_turn("task", None, &history).await;
        assert_eq!(first.action, DecisionAction::Continue);
        let second = runtime.run_turn("task", None, &history).await;
        assert_eq!(second.action, DecisionAction::Abort);
        assert!(second.reason.contains("2/2"));
    }

    #[tokio::test]
    async fn consecutive_failures_abort_at_threshold() {
        let mut runtime = SupervisorRuntime::new(Box::new(AlwaysFails), 50, 3);
        let history = Vec::new();
        let d1 = runtime.run_turn("task", None, &history).await;
        assert_eq!(d1.action, DecisionAction::Continue);
        let d2 = runtime.run_turn("task", None, &history).await;
        assert_eq!(d2.action, DecisionAction::Continue);
        let d3 = runtime.run_turn("task", None, &history).await;
        assert_eq!(d3.action, DecisionAction::Abort);
        assert!(d3.reason.contains("3 times"));
    }

    #[tokio::test]
    async fn success_resets_failure_counter() {
        struct FlakyOnce(std::sync::atomic::AtomicBool);
        #[async_trait]
        impl Dispatcher for FlakyOnce {
            async fn decide(&self, _ctx: DecisionContext<'_>) -> Result<Decision, String> {
                if self.0.swap(true, Ordering::SeqCst) {
                    Ok(Decision::continue_monitoring("ok", 1.0))
                } else {
                    Err("first turn fails".to_string())
                }
            }
        }

        let mut runtime = SupervisorRuntime::new(
            Box::new(FlakyOnce(std::sync::atomic::AtomicBool::new(false))),
            50,
            2,
        );
        let history = Vec::new();
        let d1 = runtime.run_turn("task", None, &history).await;
        assert_eq!(d1.action, DecisionAction::Continue);
        let d2 = runtime.run_turn("task", None, &history).await;
        assert_eq!(d2.action, DecisionAction::Continue);
        assert_eq!(runtime.consecutive_failures, 0);
    }
}
