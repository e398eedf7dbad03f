//! tether — remote-controlled agent
//!
//! Keeps an outbound connection to a controller, waits for single-word
//! commands and answers them through pluggable capability providers.

// Error documentation is deferred - the errors are self-explanatory from types
#![allow(clippy::missing_errors_doc)]

pub mod agent;
pub mod capability;
pub mod channel;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod protocol;
pub mod status;
pub mod supervisor;
pub mod testing;

pub use agent::{Agent, AgentHandle};
pub use capability::{
    Capabilities, HandlerError, HostCapabilities, NoPermissionModel, PermissionGate,
};
pub use channel::{ChannelError, Connection, Connector, Framing, TcpConnector};
pub use cli::Cli;
pub use config::{AgentConfig, Endpoint, HandlerFailurePolicy, RetryPolicy, StreamMode};
pub use dispatcher::{DispatchError, Dispatcher};
pub use protocol::{Command, Reply};
pub use status::{Status, StatusBoard, StatusSink};
pub use supervisor::{Backoff, CycleOutcome, Supervisor, SupervisorState};
