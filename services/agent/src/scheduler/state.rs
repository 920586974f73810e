//! Allocation lifecycle state.
//!
//! Every pod name moves through three registries:
//!
//! ```text
//! submit ──► pending ──promote──► in progress ──commit──► ready
//! ```
//!
//! [`ExecutorState`] owns the registries and enforces at most one in-flight
//! allocation per name. [`EvaluatorState`] wraps it behind a mutex and
//! decides which pending allocations may start: an allocation is withheld
//! while one of its unit files is owned by a ready or in-progress allocation
//! of another pod.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, trace};

use crate::allocation::{Allocation, PodHeader};

use super::evaluation::Evaluation;

/// Registry contract violations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The name already has an allocation in progress.
    #[error("allocation {0:?} is not unique")]
    NotUnique(String),

    /// Nothing to promote or commit for the name.
    #[error("allocation {0:?} is not found")]
    NotFound(String),
}

/// Submitted but not yet started.
#[derive(Debug, Clone)]
struct Pending {
    seq: u64,
    allocation: Option<Arc<Allocation>>,
}

/// Pending, in-progress and ready allocations keyed by pod name.
///
/// `None` stands for a removal.
#[derive(Debug, Default)]
pub struct ExecutorState {
    pending: BTreeMap<String, Pending>,
    in_progress: BTreeMap<String, Option<Arc<Allocation>>>,
    ready: BTreeMap<String, Arc<Allocation>>,
    seq: u64,
}

impl ExecutorState {
    /// Seed `ready` with recovered allocations.
    pub fn new(recovered: impl IntoIterator<Item = Allocation>) -> Self {
        Self {
            ready: recovered
                .into_iter()
                .map(|alloc| (alloc.name().to_string(), Arc::new(alloc)))
                .collect(),
            ..Default::default()
        }
    }

    /// Record `allocation` as the desired state of `name`.
    ///
    /// Returns `false` if it is mark-equal to the latest known value.
    pub fn submit(&mut self, name: &str, allocation: Option<Arc<Allocation>>) -> bool {
        if Allocation::is_equal(self.latest(name), allocation.as_deref()) {
            return false;
        }
        self.seq += 1;
        self.pending.insert(
            name.to_string(),
            Pending {
                seq: self.seq,
                allocation,
            },
        );
        true
    }

    /// Move `name` from pending to in progress.
    ///
    /// Returns the last ready allocation and the one now in progress.
    pub fn promote(
        &mut self,
        name: &str,
    ) -> Result<(Option<Arc<Allocation>>, Option<Arc<Allocation>>), StateError> {
        if self.in_progress.contains_key(name) {
            return Err(StateError::NotUnique(name.to_string()));
        }
        let pending = self
            .pending
            .remove(name)
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        self.in_progress.insert(name.to_string(), pending.allocation.clone());
        Ok((self.ready.get(name).cloned(), pending.allocation))
    }

    /// Move the in-progress allocation of `name` to ready.
    ///
    /// Returns `true` if it was a removal.
    pub fn commit(&mut self, name: &str) -> Result<bool, StateError> {
        let active = self
            .in_progress
            .remove(name)
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        match active {
            Some(active) => {
                self.ready.insert(name.to_string(), active);
                Ok(false)
            }
            None => {
                self.ready.remove(name);
                Ok(true)
            }
        }
    }

    /// Latest known header per name. Names being removed are left out.
    pub fn list_actual(&self) -> BTreeMap<String, PodHeader> {
        let mut res: BTreeMap<String, Option<PodHeader>> = BTreeMap::new();
        let pending = self
            .pending
            .iter()
            .map(|(name, pending)| (name, pending.allocation.as_ref()));
        let in_progress = self
            .in_progress
            .iter()
            .map(|(name, alloc)| (name, alloc.as_ref()));
        let ready = self.ready.iter().map(|(name, alloc)| (name, Some(alloc)));

        for (name, alloc) in pending.chain(in_progress).chain(ready) {
            res.entry(name.clone())
                .or_insert_with(|| alloc.map(|alloc| alloc.header.clone()));
        }
        res.into_iter()
            .filter_map(|(name, header)| header.map(|header| (name, header)))
            .collect()
    }

    fn latest(&self, name: &str) -> Option<&Allocation> {
        if let Some(pending) = self.pending.get(name) {
            return pending.allocation.as_deref();
        }
        if let Some(active) = self.in_progress.get(name) {
            return active.as_deref();
        }
        self.ready.get(name).map(Arc::as_ref)
    }

    /// True if a ready or in-progress allocation of another pod shares a
    /// unit file with `allocation`.
    fn is_blocked(&self, name: &str, allocation: &Allocation) -> bool {
        let ready = self
            .ready
            .iter()
            .map(|(other, alloc)| (other, Some(alloc)));
        let in_progress = self
            .in_progress
            .iter()
            .map(|(other, alloc)| (other, alloc.as_ref()));
        ready
            .chain(in_progress)
            .filter(|(other, _)| other.as_str() != name)
            .filter_map(|(other, alloc)| alloc.map(|alloc| (other, alloc)))
            .any(|(other, alloc)| {
                let blocked = alloc.collides_with(allocation);
                if blocked {
                    trace!(pod = %name, blocker = %other, "Allocation blocked");
                }
                blocked
            })
    }

    /// Promote every pending allocation that may start now, in submission
    /// order.
    fn next(&mut self) -> Vec<Evaluation> {
        let mut candidates: Vec<(u64, String)> = self
            .pending
            .iter()
            .filter(|(name, _)| !self.in_progress.contains_key(*name))
            .map(|(name, pending)| (pending.seq, name.clone()))
            .collect();
        candidates.sort();

        let mut res = Vec::new();
        for (_, name) in candidates {
            let Some(pending) = self.pending.get(&name) else {
                continue;
            };
            if Allocation::is_equal(
                self.ready.get(&name).map(Arc::as_ref),
                pending.allocation.as_deref(),
            ) {
                debug!(pod = %name, "Pending allocation matches ready, dropping");
                self.pending.remove(&name);
                continue;
            }
            if let Some(allocation) = &pending.allocation {
                if self.is_blocked(&name, allocation) {
                    continue;
                }
            }
            match self.promote(&name) {
                Ok((left, right)) => res.push(Evaluation::new(name, left, right)),
                Err(e) => debug!(pod = %name, error = %e, "Promote skipped"),
            }
        }
        res
    }
}

/// Thread-safe scheduling state.
///
/// The lock is held only for registry operations, never across I/O.
#[derive(Debug, Default)]
pub struct EvaluatorState {
    inner: Mutex<ExecutorState>,
}

impl EvaluatorState {
    pub fn new(recovered: impl IntoIterator<Item = Allocation>) -> Self {
        Self {
            inner: Mutex::new(ExecutorState::new(recovered)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ExecutorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit the desired allocation of `name` (`None` to remove it).
    ///
    /// Returns the evaluations that may start now. A no-op change yields
    /// none.
    pub fn submit(&self, name: &str, allocation: Option<Allocation>) -> Vec<Evaluation> {
        let mut state = self.lock();
        if !state.submit(name, allocation.map(Arc::new)) {
            trace!(pod = %name, "Submission matches latest allocation, ignoring");
            return Vec::new();
        }
        state.next()
    }

    /// Finish the in-progress evaluation of `name`.
    ///
    /// Returns the evaluations unblocked by it.
    pub fn commit(&self, name: &str) -> Result<Vec<Evaluation>, StateError> {
        let mut state = self.lock();
        let destroyed = state.commit(name)?;
        debug!(pod = %name, destroyed, "Committed allocation");
        Ok(state.next())
    }

    pub fn list_actual(&self) -> BTreeMap<String, PodHeader> {
        self.lock().list_actual()
    }
}
