//! Agent configuration.
//!
//! Everything the supervisor needs is carried in an [`AgentConfig`] value
//! built once at startup. The defaults are the compiled-in configuration:
//! controller at `127.0.0.1:12345`, constant 5 second retry delay, raw framing.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::channel::Framing;

/// Compiled-in controller host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Compiled-in controller port.
pub const DEFAULT_PORT: u16 = 12345;

/// Fixed delay between connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Upper bound for exponential backoff when none is given.
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Network address of the controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint from a host name (or IP literal) and port.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// How long the supervisor waits between connection attempts.
///
/// Both variants retry forever; they only differ in spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Same delay after every failure.
    Constant(Duration),
    /// Doubles after each consecutive failure, capped at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        /// Add up to half the delay again, chosen at random.
        jitter: bool,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Constant(DEFAULT_RETRY_DELAY)
    }
}

/// How streaming commands are run relative to the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// The dispatch loop waits for the session to finish.
    #[default]
    Inline,
    /// The session runs on its own task; commands keep being served.
    Detached,
}

/// What a data handler failure does to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerFailurePolicy {
    /// Send a diagnostic payload and keep the connection.
    #[default]
    Report,
    /// Treat it like a transport failure: tear down and reconnect.
    Reconnect,
}

/// Complete runtime configuration for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentConfig {
    pub endpoint: Endpoint,
    pub retry: RetryPolicy,
    pub framing: Framing,
    /// Dial timeout; `None` leaves it to the OS.
    pub connect_timeout: Option<Duration>,
    pub stream_mode: StreamMode,
    pub handler_failure: HandlerFailurePolicy,
}

impl AgentConfig {
    /// Default configuration pointed at a different controller.
    #[must_use]
    pub fn for_endpoint(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Self::default()
        }
    }
}
