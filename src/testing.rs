//! Test doubles for the agent.
//!
//! Mock capabilities, an in-memory connector and a TCP controller stand-in:
//!
//! ```ignore
//! let (connector, mut controller) = ScriptedConnector::failing_first(2);
//! let supervisor = Supervisor::new(config, Arc::new(connector), caps, status);
//! tokio::spawn(supervisor.run());
//!
//! let mut stream = controller.next_connection().await.unwrap();
//! stream.write_all(b"battery").await?;
//! let battery: BatteryStatus = read_json(&mut stream).await?;
//! ```

use crate::capability::{Capabilities, HandlerError};
use crate::channel::{ChannelError, Connector};
use crate::config::Endpoint;
use crate::protocol::{
    BatteryStatus, CallKind, CallRecord, DeviceInfo, Location, MessageRecord, StreamKind,
};
use crate::status::{Status, StatusSink};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::time::Instant;

/// Capabilities with canned answers that record every call.
pub struct MockCapabilities {
    pub device: Result<DeviceInfo, HandlerError>,
    pub battery: Result<BatteryStatus, HandlerError>,
    pub location: Result<Option<Location>, HandlerError>,
    pub messages: Result<Vec<MessageRecord>, HandlerError>,
    pub calls: Result<Vec<CallRecord>, HandlerError>,
    pub stream_result: Result<(), HandlerError>,
    gate: Option<StreamGate>,
    events: Mutex<Vec<String>>,
}

impl MockCapabilities {
    /// Every provider succeeds with sample data.
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            device: Ok(sample_device_info()),
            battery: Ok(BatteryStatus { level: 73 }),
            location: Ok(Some(Location {
                latitude: 59.3293,
                longitude: 18.0686,
            })),
            messages: Ok(sample_messages()),
            calls: Ok(sample_calls()),
            stream_result: Ok(()),
            gate: None,
            events: Mutex::new(Vec::new()),
        }
    }

    /// Streams block until the returned gate is released.
    #[must_use]
    pub fn with_stream_gate(mut self) -> (Self, StreamGate) {
        let gate = StreamGate::default();
        self.gate = Some(gate.clone());
        (self, gate)
    }

    /// Calls seen so far, e.g. `["battery", "screen:start", "screen:end"]`.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn record(&self, event: impl Into<String>) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.into());
        }
    }

    async fn stream(&self, kind: StreamKind) -> Result<(), HandlerError> {
        self.record(format!("{kind}:start"));
        if let Some(gate) = &self.gate {
            gate.started.notify_one();
            if let Ok(permit) = gate.release.acquire().await {
                permit.forget();
            }
        }
        self.record(format!("{kind}:end"));
        self.stream_result.clone()
    }
}

#[async_trait]
impl Capabilities for MockCapabilities {
    async fn device_info(&self) -> Result<DeviceInfo, HandlerError> {
        self.record("device_info");
        self.device.clone()
    }

    async fn battery_level(&self) -> Result<BatteryStatus, HandlerError> {
        self.record("battery");
        self.battery.clone()
    }

    async fn last_known_location(&self) -> Result<Option<Location>, HandlerError> {
        self.record("gps");
        self.location.clone()
    }

    async fn message_log(&self) -> Result<Vec<MessageRecord>, HandlerError> {
        self.record("sms");
        self.messages.clone()
    }

    async fn call_log(&self) -> Result<Vec<CallRecord>, HandlerError> {
        self.record("call_log");
        self.calls.clone()
    }

    async fn run_screen_stream(&self, _endpoint: &Endpoint) -> Result<(), HandlerError> {
        self.stream(StreamKind::Screen).await
    }

    async fn run_camera_stream(&self, _endpoint: &Endpoint) -> Result<(), HandlerError> {
        self.stream(StreamKind::Camera).await
    }

    async fn run_audio_stream(&self, _endpoint: &Endpoint) -> Result<(), HandlerError> {
        self.stream(StreamKind::Audio).await
    }
}

/// Holds mock streaming sessions open until released.
#[derive(Clone)]
pub struct StreamGate {
    started: Arc<Notify>,
    release: Arc<Semaphore>,
}

impl Default for StreamGate {
    fn default() -> Self {
        Self {
            started: Arc::new(Notify::new()),
            release: Arc::new(Semaphore::new(0)),
        }
    }
}

impl StreamGate {
    /// Wait until a session has started.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    /// Let one session finish.
    pub fn release(&self) {
        self.release.add_permits(1);
    }
}

#[must_use]
pub fn sample_device_info() -> DeviceInfo {
    DeviceInfo {
        model: "Pixel 8".into(),
        manufacturer: "Google".into(),
        os_version: "14".into(),
        device_id: Some("358240051111110".into()),
        network_operator: Some("Telia".into()),
    }
}

#[must_use]
pub fn sample_messages() -> Vec<MessageRecord> {
    vec![
        MessageRecord {
            sender: "+46700000001".into(),
            body: "on my way".into(),
            timestamp: 1_706_140_800_000,
        },
        MessageRecord {
            sender: "+46700000002".into(),
            body: "ok".into(),
            timestamp: 1_706_140_860_000,
        },
    ]
}

#[must_use]
pub fn sample_calls() -> Vec<CallRecord> {
    vec![
        CallRecord {
            number: "+46700000001".into(),
            kind: CallKind::Incoming,
            timestamp: 1_706_140_000_000,
            duration: 42,
        },
        CallRecord {
            number: "+46700000003".into(),
            kind: CallKind::Missed,
            timestamp: 1_706_141_000_000,
            duration: 0,
        },
    ]
}

/// Status sink that keeps every value in order.
#[derive(Clone, Default)]
pub struct RecordingStatus {
    history: Arc<Mutex<Vec<Status>>>,
}

impl RecordingStatus {
    #[must_use]
    pub fn history(&self) -> Vec<Status> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

impl StatusSink for RecordingStatus {
    fn publish(&self, status: Status) {
        if let Ok(mut history) = self.history.lock() {
            history.push(status);
        }
    }
}

/// In-memory connector: refuses a set number of attempts, then hands out
/// duplex pipes whose far ends go to a [`ScriptedController`].
pub struct ScriptedConnector {
    remaining_failures: AtomicUsize,
    attempts: Mutex<Vec<Instant>>,
    accepted: mpsc::UnboundedSender<DuplexStream>,
}

/// Controller side of a [`ScriptedConnector`].
pub struct ScriptedController {
    accepted: mpsc::UnboundedReceiver<DuplexStream>,
}

impl ScriptedConnector {
    /// Fail the first `failures` attempts, then succeed every time.
    #[must_use]
    pub fn failing_first(failures: usize) -> (Self, ScriptedController) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            remaining_failures: AtomicUsize::new(failures),
            attempts: Mutex::new(Vec::new()),
            accepted: tx,
        };
        (connector, ScriptedController { accepted: rx })
    }

    /// Never succeed.
    #[must_use]
    pub fn unreachable() -> (Self, ScriptedController) {
        Self::failing_first(usize::MAX)
    }

    /// When each connection attempt was made.
    #[must_use]
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().map(|a| a.len()).unwrap_or_default()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Stream = DuplexStream;

    async fn connect(&self, endpoint: &Endpoint) -> Result<DuplexStream, ChannelError> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(Instant::now());
        }
        let refuse = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if refuse {
            return Err(ChannelError::Connect {
                endpoint: endpoint.clone(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }
        let (agent, controller) = tokio::io::duplex(64 * 1024);
        self.accepted
            .send(controller)
            .map_err(|_| ChannelError::Closed)?;
        Ok(agent)
    }
}

impl ScriptedController {
    /// Wait for the agent's next successful connection.
    pub async fn next_connection(&mut self) -> Option<DuplexStream> {
        self.accepted.recv().await
    }
}

/// A controller listening on a local TCP port.
pub struct FakeController {
    listener: TcpListener,
}

impl FakeController {
    pub async fn bind() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(Self { listener })
    }

    pub fn endpoint(&self) -> std::io::Result<Endpoint> {
        self.listener.local_addr().map(Endpoint::from)
    }

    /// Wait for the agent to dial in.
    pub async fn accept(&self) -> std::io::Result<ControllerSession> {
        let (stream, _) = self.listener.accept().await?;
        Ok(ControllerSession { stream })
    }
}

/// One accepted agent connection.
pub struct ControllerSession {
    stream: TcpStream,
}

impl ControllerSession {
    /// Send a command token, unframed.
    pub async fn command(&mut self, token: &str) -> std::io::Result<()> {
        self.stream.write_all(token.as_bytes()).await?;
        self.stream.flush().await
    }

    /// Read one JSON reply.
    pub async fn read_json<T: DeserializeOwned>(&mut self) -> std::io::Result<T> {
        read_json(&mut self.stream).await
    }

    /// Read whatever arrives within `wait`; `None` if nothing did.
    pub async fn read_raw(&mut self, wait: Duration) -> std::io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; 64 * 1024];
        match tokio::time::timeout(wait, self.stream.read(&mut buf)).await {
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    /// Whether the agent has closed its end.
    pub async fn is_closed(&mut self, wait: Duration) -> std::io::Result<bool> {
        Ok(matches!(self.read_raw(wait).await?, Some(bytes) if bytes.is_empty()))
    }
}

/// Read from `reader` until the bytes form one complete JSON value.
pub async fn read_json<T, R>(reader: &mut R) -> std::io::Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
        match serde_json::from_slice(&buf) {
            Ok(value) => return Ok(value),
            Err(e) if e.is_eof() => {}
            Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        }
    }
}
