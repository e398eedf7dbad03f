//! Command-line interface for tether.
//!
//! Every flag is optional; with none given the agent runs on the
//! compiled-in configuration.

use crate::channel::Framing;
use crate::config::{
    AgentConfig, DEFAULT_HOST, DEFAULT_PORT, Endpoint, HandlerFailurePolicy, RetryPolicy,
    StreamMode,
};
use clap::{Parser, ValueEnum};
use std::time::Duration;

/// Remote-controlled agent that keeps a connection to its controller.
#[derive(Debug, Parser)]
#[command(name = "tether", version, about)]
pub struct Cli {
    /// Controller host name or IP address.
    #[arg(long, env = "TETHER_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Controller port.
    #[arg(long, env = "TETHER_PORT", default_value_t = DEFAULT_PORT,
          value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Seconds to wait between connection attempts (initial delay for
    /// exponential backoff).
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    pub retry_delay_secs: u64,

    /// Retry spacing strategy.
    #[arg(long, value_enum, default_value_t = BackoffArg::Constant)]
    pub backoff: BackoffArg,

    /// Upper bound for exponential backoff, in seconds.
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_delay_secs: u64,

    /// Randomize exponential backoff delays.
    #[arg(long)]
    pub jitter: bool,

    /// Message framing on the command channel.
    #[arg(long, value_enum, default_value_t = FramingArg::Raw)]
    pub framing: FramingArg,

    /// Give up on a single dial after this many seconds.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub connect_timeout_secs: Option<u64>,

    /// Run streaming sessions in the background and keep serving commands.
    #[arg(long)]
    pub detached_streams: bool,

    /// Reconnect when a data handler fails instead of reporting the error.
    #[arg(long)]
    pub reconnect_on_handler_error: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackoffArg {
    Constant,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FramingArg {
    Raw,
    Line,
    #[value(name = "length")]
    LengthPrefixed,
}

impl From<FramingArg> for Framing {
    fn from(arg: FramingArg) -> Self {
        match arg {
            FramingArg::Raw => Self::Raw,
            FramingArg::Line => Self::Line,
            FramingArg::LengthPrefixed => Self::LengthPrefixed,
        }
    }
}

impl Cli {
    /// Build the runtime configuration from the parsed flags.
    #[must_use]
    pub fn agent_config(&self) -> AgentConfig {
        let delay = Duration::from_secs(self.retry_delay_secs);
        let retry = match self.backoff {
            BackoffArg::Constant => RetryPolicy::Constant(delay),
            BackoffArg::Exponential => RetryPolicy::Exponential {
                initial: delay,
                max: Duration::from_secs(self.max_delay_secs).max(delay),
                jitter: self.jitter,
            },
        };

        AgentConfig {
            endpoint: Endpoint::new(self.host.clone(), self.port),
            retry,
            framing: self.framing.into(),
            connect_timeout: self.connect_timeout_secs.map(Duration::from_secs),
            stream_mode: if self.detached_streams {
                StreamMode::Detached
            } else {
                StreamMode::Inline
            },
            handler_failure: if self.reconnect_on_handler_error {
                HandlerFailurePolicy::Reconnect
            } else {
                HandlerFailurePolicy::Report
            },
        }
    }
}
