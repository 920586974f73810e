//! Recording process manager for tests and development.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tilth_manifest::UnitCommand;
use tracing::info;

use super::{Connector, Manager, ManagerError};
use crate::allocation::UnitFile;

/// A call received by a mock manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Enable { unit: String, runtime: bool },
    Disable { unit: String },
    Write { unit: String },
    Delete { unit: String },
    Command { unit: String, command: UnitCommand },
}

impl MockCall {
    pub fn unit(&self) -> &str {
        match self {
            Self::Enable { unit, .. }
            | Self::Disable { unit }
            | Self::Write { unit }
            | Self::Delete { unit }
            | Self::Command { unit, .. } => unit,
        }
    }

    fn operation(&self) -> String {
        match self {
            Self::Enable { .. } => "enable".to_string(),
            Self::Disable { .. } => "disable".to_string(),
            Self::Write { .. } => "write".to_string(),
            Self::Delete { .. } => "delete".to_string(),
            Self::Command { command, .. } => command.to_string(),
        }
    }
}

type FailFn = dyn Fn(&MockCall) -> bool + Send + Sync;

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<MockCall>>,
    fail: Mutex<Option<Arc<FailFn>>>,
    fail_connect: AtomicBool,
    connections: AtomicU64,
    delay: Mutex<Duration>,
}

/// Connector whose managers record every call instead of touching the host.
///
/// All managers opened by one connector share the same call log.
#[derive(Clone, Default)]
pub struct MockConnector {
    shared: Arc<Shared>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call matching `predicate`. The call is still recorded.
    pub fn fail_when<F>(&self, predicate: F)
    where
        F: Fn(&MockCall) -> bool + Send + Sync + 'static,
    {
        *self
            .shared
            .fail
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(predicate));
    }

    /// Make every call take `delay` before it is recorded.
    pub fn delay_calls(&self, delay: Duration) {
        *self
            .shared
            .delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Make `connect` fail.
    pub fn fail_connect(&self, fail: bool) {
        self.shared.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Calls received so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.shared
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Calls concerning `unit`.
    pub fn calls_for(&self, unit: &str) -> Vec<MockCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.unit() == unit)
            .collect()
    }

    /// Number of successful connects.
    pub fn connections(&self) -> u64 {
        self.shared.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn Manager>, ManagerError> {
        if self.shared.fail_connect.load(Ordering::SeqCst) {
            return Err(ManagerError::Connect(
                "mock connector configured to fail".to_string(),
            ));
        }
        self.shared.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockManager {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MockManager {
    shared: Arc<Shared>,
}

impl MockManager {
    async fn record(&self, call: MockCall) -> Result<(), ManagerError> {
        info!(call = ?call, "[MOCK] Process manager call");
        let delay = *self
            .shared
            .delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if delay.is_zero() {
            // Let sibling instructions interleave.
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }

        let fail = self
            .shared
            .fail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let failed = fail.is_some_and(|predicate| predicate(&call));
        let result = if failed {
            Err(ManagerError::Rejected {
                operation: call.operation(),
                unit: call.unit().to_string(),
                reason: "mock manager configured to fail".to_string(),
            })
        } else {
            Ok(())
        };
        self.shared
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        result
    }
}

#[async_trait]
impl Manager for MockManager {
    async fn enable(&self, unit: &UnitFile, runtime: bool) -> Result<(), ManagerError> {
        self.record(MockCall::Enable {
            unit: unit.name(),
            runtime,
        })
        .await
    }

    async fn disable(&self, unit: &UnitFile) -> Result<(), ManagerError> {
        self.record(MockCall::Disable { unit: unit.name() }).await
    }

    async fn write(&self, unit: &UnitFile) -> Result<(), ManagerError> {
        self.record(MockCall::Write { unit: unit.name() }).await
    }

    async fn delete(&self, unit: &UnitFile) -> Result<(), ManagerError> {
        self.record(MockCall::Delete { unit: unit.name() }).await
    }

    async fn command(&self, unit: &UnitFile, command: UnitCommand) -> Result<(), ManagerError> {
        self.record(MockCall::Command {
            unit: unit.name(),
            command,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_calls() {
        let connector = MockConnector::new();
        let manager = connector.connect().await.unwrap();
        let unit = UnitFile::new("/run/systemd/system/a.service", "");

        manager.write(&unit).await.unwrap();
        manager.command(&unit, UnitCommand::Start).await.unwrap();

        assert_eq!(
            connector.calls(),
            vec![
                MockCall::Write {
                    unit: "a.service".to_string()
                },
                MockCall::Command {
                    unit: "a.service".to_string(),
                    command: UnitCommand::Start
                },
            ]
        );
        assert_eq!(connector.connections(), 1);
    }

    #[tokio::test]
    async fn test_mock_failing() {
        let connector = MockConnector::new();
        connector.fail_when(|call| matches!(call, MockCall::Disable { .. }));
        let manager = connector.connect().await.unwrap();
        let unit = UnitFile::new("/run/systemd/system/a.service", "");

        assert!(manager.disable(&unit).await.is_err());
        assert!(manager.delete(&unit).await.is_ok());
        assert_eq!(connector.calls().len(), 2);

        connector.fail_connect(true);
        assert!(connector.connect().await.is_err());
    }
}
