//! Pod scheduling.
//!
//! ```text
//! facts ──► StrictPipe ──► Arbiter ──► Evaluator ──► EvaluatorState
//!                            │  approve: allocate        │ promote
//!                            │  decline: deallocate      ▼
//!                            │                       execute plan ──► commit ──► fan-out
//! ```
//!
//! The [`Scheduler`] binds every declared pod to the arbiter under its
//! name. When the node facts satisfy the pod's constraint the pod is
//! rendered and allocated; when they stop doing so, or the pod is no longer
//! declared, it is deallocated.

pub mod arbiter;
pub mod evaluation;
pub mod evaluator;
pub mod instruction;
pub mod state;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tilth_bus::{Consumer, Message, StrictPipe};
use tilth_manifest::{Constraint, Pod};
use tilth_reconcile::Mark;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

pub use arbiter::{Arbiter, Callback, Decision};
pub use evaluation::Evaluation;
pub use evaluator::{EvaluationFailure, Evaluator, EvaluatorMetrics, MetricsSnapshot};
pub use instruction::{Instruction, Operation, Phase};
pub use state::{EvaluatorState, ExecutorState, StateError};

/// A fact source the scheduler waits for.
#[derive(Debug, Clone)]
pub struct Source {
    pub id: String,
    /// Must hold for any pod to be scheduled.
    pub required: Constraint,
}

impl Source {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            required: Constraint::new(),
        }
    }

    pub fn with_required(mut self, required: Constraint) -> Self {
        self.required = required;
        self
    }
}

#[derive(Default)]
struct Declared {
    by_namespace: BTreeMap<String, Vec<Pod>>,
    /// Bound pod names and the mark of the declaration bound.
    bound: BTreeMap<String, Mark>,
}

/// Binds declared pods to the arbiter and the evaluator.
pub struct Scheduler {
    pipe: Arc<StrictPipe>,
    arbiter: Arbiter,
    evaluator: Evaluator,
    namespaces: Vec<String>,
    declared: Mutex<Declared>,
}

impl Scheduler {
    /// Build a scheduler fed by `sources`.
    ///
    /// `namespaces` lists namespaces by priority: a pod name declared in
    /// several namespaces is taken from the first one. Undeclared namespaces
    /// rank last, by name.
    pub fn new(
        sources: &[Source],
        namespaces: Vec<String>,
        evaluator: Evaluator,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let required = Constraint::new().merge(sources.iter().map(|source| &source.required));
        let arbiter = Arbiter::spawn("scheduler", required, shutdown);
        let pipe = Arc::new(StrictPipe::new(
            "scheduler",
            Arc::new(arbiter.clone()),
            sources.iter().map(|source| source.id.clone()),
        ));
        Self {
            pipe,
            arbiter,
            evaluator,
            namespaces,
            declared: Mutex::new(Declared::default()),
        }
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// Replace the pods declared in `namespace`.
    ///
    /// Newly resolved or changed pods are bound, pods no longer declared
    /// anywhere are unbound, and allocations of `namespace` that no pod
    /// claims are removed.
    pub async fn sync(&self, namespace: &str, pods: Vec<Pod>) {
        let mut declared = self.declared.lock().await;
        info!(namespace = %namespace, pods = pods.len(), "Syncing pods");
        declared.by_namespace.insert(namespace.to_string(), pods);
        let resolved = self.resolve(&declared.by_namespace);

        let gone: Vec<String> = declared
            .bound
            .keys()
            .filter(|name| !resolved.contains_key(*name))
            .cloned()
            .collect();
        for name in gone {
            declared.bound.remove(&name);
            debug!(pod = %name, "Unbinding pod");
            self.arbiter.unbind(name.clone(), self.removal(name)).await;
        }

        for (name, pod) in resolved {
            let mark = pod.mark();
            if declared.bound.get(&name) == Some(&mark) {
                continue;
            }
            declared.bound.insert(name.clone(), mark);
            debug!(pod = %name, namespace = %pod.namespace, "Binding pod");
            let constraint = pod.scheduling_constraint().clone();
            self.arbiter
                .bind(name, constraint, self.placement(Arc::new(pod)))
                .await;
        }

        for (name, header) in self.evaluator.list_actual() {
            if header.namespace == namespace && !declared.bound.contains_key(&name) {
                info!(pod = %name, namespace = %namespace, "Removing undeclared allocation");
                self.evaluator.deallocate(&name);
            }
        }
    }

    /// Pick one declaration per pod name by namespace priority.
    fn resolve(&self, by_namespace: &BTreeMap<String, Vec<Pod>>) -> BTreeMap<String, Pod> {
        let listed: BTreeSet<&str> = self.namespaces.iter().map(String::as_str).collect();
        let order = self
            .namespaces
            .iter()
            .map(String::as_str)
            .chain(
                by_namespace
                    .keys()
                    .map(String::as_str)
                    .filter(|namespace| !listed.contains(namespace)),
            );

        let mut resolved = BTreeMap::new();
        for namespace in order {
            for pod in by_namespace.get(namespace).into_iter().flatten() {
                resolved
                    .entry(pod.name.clone())
                    .or_insert_with(|| pod.clone());
            }
        }
        resolved
    }

    /// Callback allocating `pod` on approval and removing it otherwise.
    fn placement(&self, pod: Arc<Pod>) -> Callback {
        let evaluator = self.evaluator.clone();
        Arc::new(move |decision| match decision {
            Decision::Approved(facts) => evaluator.allocate(&pod, &facts.payload_map()),
            Decision::Declined(_) | Decision::Unbound => evaluator.deallocate(&pod.name),
        })
    }

    fn removal(&self, name: String) -> Callback {
        let evaluator = self.evaluator.clone();
        Arc::new(move |_| evaluator.deallocate(&name))
    }
}

#[async_trait]
impl Consumer for Scheduler {
    async fn consume_message(&self, message: Message) {
        self.pipe.consume_message(message).await;
    }
}
