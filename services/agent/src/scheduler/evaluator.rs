//! Evaluation engine.
//!
//! Renders approved pods into allocations, submits them to the
//! [`EvaluatorState`] and executes the resulting evaluations against the
//! process manager.
//!
//! ## Execution
//!
//! Each evaluation opens its own manager connection, then runs its plan
//! phase by phase. Instructions of one phase run concurrently; the next
//! phase starts once all of them finished. Failed instructions are logged
//! and counted but never stop the plan. Whatever happened, the evaluation
//! is committed afterwards and the evaluations it unblocked are dispatched.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tilth_manifest::{FlatMap, Pod};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::allocation::{Allocation, PodHeader, SystemPaths};
use crate::manager::{Connector, Manager, ManagerError};

use super::evaluation::Evaluation;
use super::instruction::{Instruction, Phase};
use super::state::EvaluatorState;

/// A failure recorded while executing an evaluation.
#[derive(Debug, Error)]
pub enum EvaluationFailure {
    #[error("no process manager connection: {0}")]
    Connect(#[source] ManagerError),

    #[error("{instruction}: {source}")]
    Instruction {
        instruction: Instruction,
        #[source]
        source: ManagerError,
    },

    #[error("instruction task failed: {0}")]
    Aborted(#[from] JoinError),
}

/// Evaluation counters.
#[derive(Debug, Default)]
pub struct EvaluatorMetrics {
    evaluations: AtomicU64,
    failed_evaluations: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of [`EvaluatorMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Evaluations executed.
    pub evaluations: u64,
    /// Evaluations with at least one failure.
    pub failed_evaluations: u64,
    /// Failures across all evaluations.
    pub failures: u64,
}

impl EvaluatorMetrics {
    fn record(&self, failures: usize) {
        let failures = failures as u64;
        self.failures.fetch_add(failures, Ordering::SeqCst);
        if failures > 0 {
            self.failed_evaluations.fetch_add(1, Ordering::SeqCst);
        }
        // Last, so a reader seeing the evaluation also sees its failures.
        self.evaluations.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            evaluations: self.evaluations.load(Ordering::SeqCst),
            failed_evaluations: self.failed_evaluations.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
        }
    }
}

/// Number of dispatched evaluations not yet finished.
#[derive(Debug)]
struct InFlight {
    count: watch::Sender<usize>,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.send_modify(|count| *count += 1);
        InFlightGuard {
            in_flight: Arc::clone(self),
        }
    }

    async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so this only returns at zero.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

/// Leaves the in-flight count on drop, also when the task panics.
struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.count.send_modify(|count| *count -= 1);
    }
}

/// Drives allocations from submission to commit.
///
/// Cheap to clone; clones share state, connector and counters.
#[derive(Clone)]
pub struct Evaluator {
    state: Arc<EvaluatorState>,
    connector: Arc<dyn Connector>,
    metrics: Arc<EvaluatorMetrics>,
    in_flight: Arc<InFlight>,
    paths: SystemPaths,
}

impl Evaluator {
    pub fn new(state: EvaluatorState, connector: Arc<dyn Connector>, paths: SystemPaths) -> Self {
        Self {
            state: Arc::new(state),
            connector,
            metrics: Arc::new(EvaluatorMetrics::default()),
            in_flight: Arc::new(InFlight {
                count: watch::Sender::new(0),
            }),
            paths,
        }
    }

    /// Render `pod` against `env` and schedule it.
    ///
    /// Must be called within a Tokio runtime.
    pub fn allocate(&self, pod: &Pod, env: &FlatMap) {
        match Allocation::from_manifest(pod, env, &self.paths) {
            Ok(allocation) => self.submit(&pod.name, Some(allocation)),
            Err(e) => error!(pod = %pod.name, error = %e, "Failed to render allocation"),
        }
    }

    /// Schedule removal of `name`.
    pub fn deallocate(&self, name: &str) {
        self.submit(name, None);
    }

    /// Submit a rendered allocation and dispatch what may start.
    pub fn submit(&self, name: &str, allocation: Option<Allocation>) {
        let next = self.state.submit(name, allocation);
        self.fan_out(next);
    }

    /// Latest known header per pod name.
    pub fn list_actual(&self) -> BTreeMap<String, PodHeader> {
        self.state.list_actual()
    }

    /// Names of all known pods.
    pub fn names(&self) -> BTreeSet<String> {
        self.list_actual().into_keys().collect()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Wait until every dispatched evaluation, including the ones they
    /// unblock on commit, has finished.
    ///
    /// Plans are never cut short: call this after the fact sources stopped
    /// and before the runtime goes away.
    pub async fn drain(&self) {
        self.in_flight.wait_idle().await;
    }

    /// Dispatch each evaluation on its own task.
    fn fan_out(&self, evaluations: Vec<Evaluation>) {
        for evaluation in evaluations {
            let evaluator = self.clone();
            // Entered before spawning so `drain` never sees a gap between a
            // commit and the evaluations it unblocked.
            let guard = self.in_flight.enter();
            tokio::spawn(async move {
                evaluator.execute(evaluation).await;
                drop(guard);
            });
        }
    }

    /// Execute `evaluation`, commit it and dispatch the evaluations it
    /// unblocked. Returns the failures.
    pub async fn execute(&self, evaluation: Evaluation) -> Vec<EvaluationFailure> {
        let plan = evaluation.plan();
        info!(
            pod = %evaluation.name,
            evaluation = %evaluation,
            instructions = plan.len(),
            "Executing evaluation"
        );

        let failures = match self.connector.connect().await {
            Ok(manager) => execute_plan(manager, plan).await,
            Err(e) => {
                error!(
                    pod = %evaluation.name,
                    error = %e,
                    "Failed to connect to process manager"
                );
                vec![EvaluationFailure::Connect(e)]
            }
        };
        self.metrics.record(failures.len());

        if failures.is_empty() {
            info!(pod = %evaluation.name, "Evaluation done");
        } else {
            warn!(
                pod = %evaluation.name,
                failures = failures.len(),
                "Evaluation done with failures"
            );
        }

        match self.state.commit(&evaluation.name) {
            Ok(next) => self.fan_out(next),
            Err(e) => error!(pod = %evaluation.name, error = %e, "Failed to commit evaluation"),
        }
        failures
    }
}

/// Run `plan` phase by phase, collecting failures.
pub async fn execute_plan(
    manager: Arc<dyn Manager>,
    plan: Vec<Instruction>,
) -> Vec<EvaluationFailure> {
    let mut phases: BTreeMap<Phase, Vec<Instruction>> = BTreeMap::new();
    for instruction in plan {
        phases.entry(instruction.phase).or_default().push(instruction);
    }

    let mut failures = Vec::new();
    for (phase, instructions) in phases {
        debug!(phase, count = instructions.len(), "Executing phase");
        let mut tasks = JoinSet::new();
        for instruction in instructions {
            let manager = Arc::clone(&manager);
            tasks.spawn(async move {
                let result = instruction.execute(manager.as_ref()).await;
                (instruction, result)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((instruction, Err(source))) => {
                    error!(
                        phase,
                        instruction = %instruction,
                        error = %source,
                        "Instruction failed"
                    );
                    failures.push(EvaluationFailure::Instruction {
                        instruction,
                        source,
                    });
                }
                Err(e) => {
                    error!(phase, error = %e, "Instruction task failed");
                    failures.push(EvaluationFailure::from(e));
                }
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::UnitFile;
    use crate::manager::{MockCall, MockConnector};
    use crate::scheduler::instruction::{Operation, PHASE_COMMAND, PHASE_WRITE};
    use async_trait::async_trait;
    use std::time::Duration;
    use tilth_manifest::UnitCommand;
    use tokio::sync::Barrier;

    fn instruction(phase: Phase, operation: Operation, unit: &str) -> Instruction {
        Instruction::new(
            phase,
            operation,
            UnitFile::new(format!("/run/systemd/system/{unit}"), ""),
        )
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_later_phases() {
        let connector = MockConnector::new();
        connector.fail_when(|call| call.unit() == "bad.service");
        let manager = connector.connect().await.unwrap();

        let plan = vec![
            instruction(0, Operation::Command(UnitCommand::Stop), "bad.service"),
            instruction(0, Operation::Command(UnitCommand::Stop), "good.service"),
            instruction(1, Operation::Disable, "good.service"),
            instruction(2, Operation::Delete, "good.service"),
        ];
        let failures = execute_plan(manager, plan).await;

        assert_eq!(failures.len(), 1);
        assert!(matches!(
            &failures[0],
            EvaluationFailure::Instruction { instruction, .. }
                if instruction.unit.name() == "bad.service"
        ));
        assert_eq!(
            connector.calls_for("good.service"),
            vec![
                MockCall::Command {
                    unit: "good.service".to_string(),
                    command: UnitCommand::Stop
                },
                MockCall::Disable {
                    unit: "good.service".to_string()
                },
                MockCall::Delete {
                    unit: "good.service".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_phases_are_ordered() {
        let connector = MockConnector::new();
        let manager = connector.connect().await.unwrap();

        let mut plan = Vec::new();
        for phase in [3, 0, 2, 1] {
            for unit in ["a.service", "b.service", "c.service"] {
                plan.push(instruction(phase, Operation::Write, &format!("{phase}-{unit}")));
            }
        }
        assert!(execute_plan(manager, plan).await.is_empty());

        let phases: Vec<char> = connector
            .calls()
            .iter()
            .map(|call| call.unit().chars().next().unwrap())
            .collect();
        let mut sorted = phases.clone();
        sorted.sort();
        assert_eq!(phases, sorted);
        assert_eq!(phases.len(), 12);
    }

    /// Manager whose calls only return once `barrier` is full.
    struct Rendezvous {
        barrier: Barrier,
    }

    impl Rendezvous {
        async fn meet(&self) -> Result<(), ManagerError> {
            self.barrier.wait().await;
            Ok(())
        }
    }

    #[async_trait]
    impl Manager for Rendezvous {
        async fn enable(&self, _: &UnitFile, _: bool) -> Result<(), ManagerError> {
            self.meet().await
        }

        async fn disable(&self, _: &UnitFile) -> Result<(), ManagerError> {
            self.meet().await
        }

        async fn write(&self, _: &UnitFile) -> Result<(), ManagerError> {
            self.meet().await
        }

        async fn delete(&self, _: &UnitFile) -> Result<(), ManagerError> {
            self.meet().await
        }

        async fn command(&self, _: &UnitFile, _: UnitCommand) -> Result<(), ManagerError> {
            self.meet().await
        }
    }

    #[tokio::test]
    async fn test_phase_runs_concurrently() {
        let manager = Arc::new(Rendezvous {
            barrier: Barrier::new(2),
        });

        // Each phase only completes if both of its instructions are running
        // at the same time.
        let plan = vec![
            instruction(PHASE_WRITE, Operation::Write, "a.service"),
            instruction(PHASE_WRITE, Operation::Write, "b.service"),
            instruction(PHASE_COMMAND, Operation::Command(UnitCommand::Start), "a.service"),
            instruction(PHASE_COMMAND, Operation::Command(UnitCommand::Start), "b.service"),
        ];
        let failures = tokio::time::timeout(Duration::from_secs(5), execute_plan(manager, plan))
            .await
            .expect("instructions of one phase did not run concurrently");
        assert!(failures.is_empty());
    }

    #[test]
    fn test_metrics_record() {
        let metrics = EvaluatorMetrics::default();
        metrics.record(0);
        metrics.record(3);
        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                evaluations: 2,
                failed_evaluations: 1,
                failures: 3,
            }
        );
    }
}
