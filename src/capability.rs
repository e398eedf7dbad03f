//! Capability providers.
//!
//! The dispatcher never talks to the platform directly; it goes through
//! [`Capabilities`]. Every method defaults to [`HandlerError::Unsupported`]
//! so a provider only implements what its platform can actually do.

use crate::config::Endpoint;
use crate::protocol::{BatteryStatus, CallRecord, DeviceInfo, Location, MessageRecord};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// A provider could not produce its result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("{0} is not supported on this device")]
    Unsupported(&'static str),

    #[error("{0} is currently unavailable")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),
}

/// Everything the agent can be asked to do.
#[async_trait]
pub trait Capabilities: Send + Sync {
    async fn device_info(&self) -> Result<DeviceInfo, HandlerError> {
        Err(HandlerError::Unsupported("device info"))
    }

    async fn battery_level(&self) -> Result<BatteryStatus, HandlerError> {
        Err(HandlerError::Unsupported("battery level"))
    }

    /// `Ok(None)` means the device has no last-known fix.
    async fn last_known_location(&self) -> Result<Option<Location>, HandlerError> {
        Ok(None)
    }

    async fn message_log(&self) -> Result<Vec<MessageRecord>, HandlerError> {
        Err(HandlerError::Unsupported("message log"))
    }

    async fn call_log(&self) -> Result<Vec<CallRecord>, HandlerError> {
        Err(HandlerError::Unsupported("call log"))
    }

    /// Stream the screen to `endpoint` until the session ends.
    async fn run_screen_stream(&self, _endpoint: &Endpoint) -> Result<(), HandlerError> {
        Err(HandlerError::Unsupported("screen streaming"))
    }

    /// Stream the camera to `endpoint` until the session ends.
    async fn run_camera_stream(&self, _endpoint: &Endpoint) -> Result<(), HandlerError> {
        Err(HandlerError::Unsupported("camera streaming"))
    }

    /// Stream the microphone to `endpoint` until the session ends.
    async fn run_audio_stream(&self, _endpoint: &Endpoint) -> Result<(), HandlerError> {
        Err(HandlerError::Unsupported("audio streaming"))
    }
}

/// Platform permissions the agent asks for at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Network,
    Camera,
    Microphone,
    Messages,
    CallLog,
    Location,
}

/// The set requested once at startup.
pub const STARTUP_PERMISSIONS: [Permission; 6] = [
    Permission::Network,
    Permission::Camera,
    Permission::Microphone,
    Permission::Messages,
    Permission::CallLog,
    Permission::Location,
];

/// Asks the platform for permissions. Fire-and-forget: the outcome is
/// never reported back, a denied permission shows up later as a
/// [`HandlerError`] from the affected provider.
pub trait PermissionGate: Send + Sync {
    fn request(&self, permissions: &[Permission]);
}

/// Gate for hosts without a runtime permission model.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPermissionModel;

impl PermissionGate for NoPermissionModel {
    fn request(&self, permissions: &[Permission]) {
        info!(?permissions, "No runtime permission model on this host");
    }
}

/// Provider backed by the host the agent runs on.
///
/// Reports identity and battery from sysfs where present. There is no
/// location source, and the logs and streams are unsupported.
#[derive(Debug, Clone)]
pub struct HostCapabilities {
    sysfs_root: PathBuf,
    procfs_root: PathBuf,
}

impl HostCapabilities {
    #[must_use]
    pub fn new() -> Self {
        Self::with_sysfs_root("/sys")
    }

    /// Read sysfs from somewhere other than `/sys`.
    #[must_use]
    pub fn with_sysfs_root(root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: root.into(),
            procfs_root: PathBuf::from("/proc"),
        }
    }

    async fn read_attr(path: &Path) -> Option<String> {
        match tokio::fs::read_to_string(path).await {
            Ok(s) => {
                let s = s.trim();
                (!s.is_empty()).then(|| s.to_string())
            }
            Err(e) => {
                debug!(path = %path.display(), %e, "sysfs attribute unreadable");
                None
            }
        }
    }
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capabilities for HostCapabilities {
    async fn device_info(&self) -> Result<DeviceInfo, HandlerError> {
        let dmi = self.sysfs_root.join("devices/virtual/dmi/id");
        let model = Self::read_attr(&dmi.join("product_name"))
            .await
            .unwrap_or_else(|| std::env::consts::ARCH.to_string());
        let manufacturer = Self::read_attr(&dmi.join("sys_vendor"))
            .await
            .unwrap_or_else(|| "unknown".to_string());
        let osrelease = self.procfs_root.join("sys/kernel/osrelease");
        let os_version = match Self::read_attr(&osrelease).await {
            Some(release) => format!("{} {release}", std::env::consts::OS),
            None => std::env::consts::OS.to_string(),
        };
        let device_id = hostname::get()
            .ok()
            .map(|name| name.to_string_lossy().into_owned());

        Ok(DeviceInfo {
            model,
            manufacturer,
            os_version,
            device_id,
            network_operator: None,
        })
    }

    async fn battery_level(&self) -> Result<BatteryStatus, HandlerError> {
        let supplies = self.sysfs_root.join("class/power_supply");
        let mut entries = tokio::fs::read_dir(&supplies)
            .await
            .map_err(|e| HandlerError::Unavailable(format!("battery ({e})")))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| HandlerError::Failed(format!("reading power supplies: {e}")))?
        {
            let dir = entry.path();
            if Self::read_attr(&dir.join("type")).await.as_deref() != Some("Battery") {
                continue;
            }
            let Some(capacity) = Self::read_attr(&dir.join("capacity")).await else {
                continue;
            };
            let level = capacity
                .parse::<u8>()
                .map_err(|e| HandlerError::Failed(format!("bad capacity {capacity:?}: {e}")))?;
            return Ok(BatteryStatus {
                level: level.min(100),
            });
        }

        Err(HandlerError::Unavailable("battery".to_string()))
    }
}
