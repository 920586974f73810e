//! Constraint-gated notification.
//!
//! An arbiter holds the latest fact snapshot and a set of bound watchers.
//! Every bind, unbind and fact update goes through one mailbox processed by
//! a single task, so they are totally ordered. Each watcher is told whether
//! the snapshot satisfies the arbiter's required constraint and then its
//! own.
//!
//! Callbacks run on the arbiter task. They must not block and must not call
//! back into the arbiter; long work belongs on a spawned task.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tilth_bus::{Consumer, Message};
use tilth_manifest::{Constraint, ConstraintError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

const MAILBOX_SIZE: usize = 64;

/// Outcome delivered to a watcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Both constraints hold for the snapshot.
    Approved(Message),
    /// A constraint failed.
    Declined(ConstraintError),
    /// The watcher was unbound.
    Unbound,
}

/// Watcher callback.
pub type Callback = Arc<dyn Fn(Decision) + Send + Sync>;

enum Command {
    Bind {
        id: String,
        constraint: Constraint,
        callback: Callback,
    },
    Unbind {
        id: String,
        callback: Callback,
    },
    Consume(Message),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { id, .. } => write!(f, "Bind({id})"),
            Self::Unbind { id, .. } => write!(f, "Unbind({id})"),
            Self::Consume(message) => write!(f, "Consume({message:?})"),
        }
    }
}

/// Handle to an arbiter task.
///
/// Sends race against the shutdown signal: once it fires they are silently
/// dropped instead of blocking.
#[derive(Clone)]
pub struct Arbiter {
    name: String,
    tx: mpsc::Sender<Command>,
    shutdown: watch::Receiver<bool>,
}

impl Arbiter {
    /// Spawn an arbiter task. It stops when `shutdown` turns `true`.
    pub fn spawn(
        name: impl Into<String>,
        required: Constraint,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel(MAILBOX_SIZE);
        let state = ArbiterState {
            name: name.clone(),
            required,
            snapshot: Message::empty(&name),
            watchers: BTreeMap::new(),
        };
        tokio::spawn(state.run(rx, shutdown.clone()));
        Self { name, tx, shutdown }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind or replace the watcher `id`. It is evaluated right away unless
    /// no facts are known yet.
    pub async fn bind(&self, id: impl Into<String>, constraint: Constraint, callback: Callback) {
        self.send(Command::Bind {
            id: id.into(),
            constraint,
            callback,
        })
        .await;
    }

    /// Remove the watcher `id`. `callback` receives [`Decision::Unbound`]
    /// exactly once.
    pub async fn unbind(&self, id: impl Into<String>, callback: Callback) {
        self.send(Command::Unbind {
            id: id.into(),
            callback,
        })
        .await;
    }

    async fn send(&self, command: Command) {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            biased;

            _ = wait_shutdown(&mut shutdown) => {
                debug!(arbiter = %self.name, "Arbiter is shut down, dropping");
            }
            result = self.tx.send(command) => {
                if let Err(e) = result {
                    debug!(arbiter = %self.name, command = ?e.0, "Arbiter stopped, dropping");
                }
            }
        }
    }
}

#[async_trait]
impl Consumer for Arbiter {
    async fn consume_message(&self, message: Message) {
        self.send(Command::Consume(message)).await;
    }
}

/// Resolves once shutdown is signalled or its sender is gone.
async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

struct Watcher {
    constraint: Constraint,
    callback: Callback,
}

/// State owned by the arbiter task.
struct ArbiterState {
    name: String,
    required: Constraint,
    snapshot: Message,
    watchers: BTreeMap<String, Watcher>,
}

impl ArbiterState {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, mut shutdown: watch::Receiver<bool>) {
        debug!(arbiter = %self.name, "Arbiter started");

        loop {
            tokio::select! {
                biased;

                // Check shutdown first
                _ = wait_shutdown(&mut shutdown) => {
                    info!(arbiter = %self.name, "Arbiter received shutdown signal");
                    break;
                }

                command = rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        debug!(arbiter = %self.name, "Arbiter mailbox closed");
                        break;
                    }
                }
            }
        }

        info!(arbiter = %self.name, watchers = self.watchers.len(), "Arbiter stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Bind {
                id,
                constraint,
                callback,
            } => {
                let watcher = Watcher {
                    constraint,
                    callback,
                };
                if !self.snapshot.is_empty() {
                    self.notify(&id, &watcher);
                }
                self.watchers.insert(id, watcher);
            }
            Command::Unbind { id, callback } => {
                if self.watchers.remove(&id).is_none() {
                    debug!(arbiter = %self.name, id = %id, "Unbinding unknown watcher");
                }
                callback(Decision::Unbound);
            }
            Command::Consume(message) => {
                if message == self.snapshot {
                    trace!(arbiter = %self.name, "Facts unchanged");
                    return;
                }
                self.snapshot = message;
                if self.snapshot.is_empty() {
                    debug!(arbiter = %self.name, "Facts cleared, holding decisions");
                    return;
                }
                for (id, watcher) in &self.watchers {
                    self.notify(id, watcher);
                }
            }
        }
    }

    fn notify(&self, id: &str, watcher: &Watcher) {
        let decision = self.decide(id, &watcher.constraint);
        (watcher.callback)(decision);
    }

    fn decide(&self, id: &str, constraint: &Constraint) -> Decision {
        let facts = self.snapshot.payload_map();
        if let Err(e) = self.required.check(&facts) {
            warn!(arbiter = %self.name, id = %id, error = %e, "Required constraint failed");
            return Decision::Declined(e);
        }
        if let Err(e) = constraint.check(&facts) {
            debug!(arbiter = %self.name, id = %id, error = %e, "Constraint failed");
            return Decision::Declined(e);
        }
        trace!(arbiter = %self.name, id = %id, "Constraint passed");
        Decision::Approved(self.snapshot.clone())
    }
}
