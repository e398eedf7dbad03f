//! Connection supervisor.
//!
//! Dials the controller, runs the dispatcher until the connection ends,
//! waits, and dials again. There is no terminal state: every failure,
//! including an explicit `exit`, leads back to another attempt.

use crate::capability::Capabilities;
use crate::channel::{ChannelError, Connection, Connector};
use crate::config::{AgentConfig, RetryPolicy};
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::status::{Status, StatusSink};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Connected,
}

/// How one connect-and-dispatch cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    /// The dial failed.
    ConnectFailed(ChannelError),
    /// The controller sent `exit`.
    Exited,
    /// The connection broke while dispatching.
    Dropped(DispatchError),
}

/// Computes the wait before the next attempt.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff {
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Delay to apply now; advances the failure count.
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.policy {
            RetryPolicy::Constant(delay) => delay,
            RetryPolicy::Exponential {
                initial,
                max,
                jitter,
            } => {
                let factor = 2u32.saturating_pow(self.failures.min(31));
                let base = initial.saturating_mul(factor).min(max);
                if jitter {
                    let spread = base.as_millis() / 2;
                    let extra = rand::thread_rng().gen_range(0..=spread);
                    base + Duration::from_millis(u64::try_from(extra).unwrap_or(u64::MAX))
                } else {
                    base
                }
            }
        };
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Forget past failures after a successful connection.
    pub const fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Keeps the agent connected to its controller, forever.
pub struct Supervisor<C> {
    config: AgentConfig,
    connector: C,
    dispatcher: Dispatcher,
    status: Arc<dyn StatusSink>,
    backoff: Backoff,
    state: SupervisorState,
    attempts: u64,
}

impl<C: Connector> Supervisor<C> {
    #[must_use]
    pub fn new(
        config: AgentConfig,
        connector: C,
        capabilities: Arc<dyn Capabilities>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        let dispatcher = Dispatcher::new(capabilities, &config);
        let backoff = Backoff::new(config.retry);
        Self {
            config,
            connector,
            dispatcher,
            status,
            backoff,
            state: SupervisorState::Disconnected,
            attempts: 0,
        }
    }

    #[must_use]
    pub const fn state(&self) -> SupervisorState {
        self.state
    }

    /// Connection attempts made so far.
    #[must_use]
    pub const fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Run forever. Never returns.
    pub async fn run(mut self) {
        loop {
            let outcome = self.run_cycle().await;
            let delay = self.backoff.next_delay();
            debug!(?outcome, ?delay, "Cycle finished, waiting before next attempt");
            tokio::time::sleep(delay).await;
        }
    }

    /// One attempt: dial, dispatch until the connection ends, close.
    ///
    /// Leaves the supervisor `Disconnected`; the caller applies the delay.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.attempts += 1;
        self.state = SupervisorState::Connecting;
        self.status.publish(Status::Connecting);
        info!(attempt = self.attempts, endpoint = %self.config.endpoint, "Connecting");

        let stream = match self.connector.connect(&self.config.endpoint).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(attempt = self.attempts, %e, "Connection failed");
                self.state = SupervisorState::Disconnected;
                self.status.publish(Status::Retrying);
                return CycleOutcome::ConnectFailed(e);
            }
        };

        let mut conn = Connection::new(stream, self.config.framing);
        self.state = SupervisorState::Connected;
        self.backoff.reset();
        self.status.publish(Status::Connected);
        info!(endpoint = %self.config.endpoint, "Connected");

        let result = self.dispatcher.run(&mut conn).await;
        conn.close().await;
        self.state = SupervisorState::Disconnected;

        match result {
            Ok(()) => {
                info!("Disconnected by controller");
                self.status.publish(Status::Disconnected);
                CycleOutcome::Exited
            }
            Err(e) => {
                warn!(%e, "Connection lost");
                self.status.publish(Status::Retrying);
                CycleOutcome::Dropped(e)
            }
        }
    }
}
