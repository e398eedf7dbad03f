//! Process-level agent startup.

use crate::capability::{Capabilities, PermissionGate, STARTUP_PERMISSIONS};
use crate::channel::Connector;
use crate::config::AgentConfig;
use crate::status::{Status, StatusBoard};
use crate::supervisor::Supervisor;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Everything needed to bring the agent up.
pub struct Agent<C> {
    config: AgentConfig,
    connector: C,
    capabilities: Arc<dyn Capabilities>,
    permissions: Arc<dyn PermissionGate>,
    status: StatusBoard,
}

impl<C> Agent<C>
where
    C: Connector + 'static,
{
    #[must_use]
    pub fn new(
        config: AgentConfig,
        connector: C,
        capabilities: Arc<dyn Capabilities>,
        permissions: Arc<dyn PermissionGate>,
    ) -> Self {
        Self {
            config,
            connector,
            capabilities,
            permissions,
            status: StatusBoard::new(),
        }
    }

    /// Request permissions, then launch the supervisor on a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> AgentHandle {
        self.permissions.request(&STARTUP_PERMISSIONS);

        let status = self.status.subscribe();
        info!(endpoint = %self.config.endpoint, "Launching supervisor");
        let supervisor = Supervisor::new(
            self.config,
            self.connector,
            self.capabilities,
            Arc::new(self.status),
        );
        let task = tokio::spawn(supervisor.run());

        AgentHandle { status, task }
    }
}

/// Foreground view of a running agent.
pub struct AgentHandle {
    status: watch::Receiver<Status>,
    task: JoinHandle<()>,
}

impl AgentHandle {
    /// Current status message.
    #[must_use]
    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// Wait for the status to change. `None` once the supervisor is gone.
    pub async fn next_status(&mut self) -> Option<Status> {
        self.status.changed().await.ok()?;
        Some(self.status.borrow_and_update().clone())
    }

    /// Whether the supervisor task has ended (it only does if aborted or
    /// it panicked).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the supervisor.
    pub fn abort(self) {
        self.task.abort();
    }
}
