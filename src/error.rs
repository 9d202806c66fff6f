//! Error types for every layer of the crate.
//!
//! | Type | Raised by | Recovery |
//! |---|---|---|
//! | [`FrameError`] | [`crate::parse`] | logged by the session, sample dropped, stream continues |
//! | [`TransportError`] | [`crate::transport::Transport`] implementations | wrapped by the session |
//! | [`SessionError`] | [`crate::session::DeviceSession`] | see variant docs |
//! | [`ConfigError`] | [`crate::config::SessionConfig::load`] | fix the file |

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Which notification stream a frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Emg,
    Imu,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Emg => f.write_str("EMG"),
            FrameKind::Imu => f.write_str("IMU"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The buffer length does not match the frame layout.
    #[error("malformed {kind} frame: expected {expected} bytes, got {actual}")]
    MalformedFrame {
        kind: FrameKind,
        expected: usize,
        actual: usize,
    },
}

/// Failures reported by a [`crate::transport::Transport`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The user or platform declined device selection, or no matching
    /// device showed up before the scan timed out.
    #[error("no device selected")]
    NoDeviceSelected,

    #[error("GATT connection failed: {0}")]
    GattConnectionFailed(String),

    #[error("service {0} not found")]
    ServiceNotFound(Uuid),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("write to {characteristic} failed: {reason}")]
    WriteFailed { characteristic: Uuid, reason: String },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("bluetooth backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "btle")]
impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        TransportError::Backend(e.to_string())
    }
}

/// The step of `connect()` that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStage {
    RequestDevice,
    GattConnect,
    ResolveService,
    ResolveCharacteristic,
    SubscribeNotifications,
    Initialize,
}

impl fmt::Display for ConnectStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectStage::RequestDevice => "device discovery",
            ConnectStage::GattConnect => "GATT connect",
            ConnectStage::ResolveService => "service resolution",
            ConnectStage::ResolveCharacteristic => "characteristic resolution",
            ConnectStage::SubscribeNotifications => "notification subscription",
            ConnectStage::Initialize => "device initialization",
        };
        f.write_str(s)
    }
}

/// Why a connect attempt was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectCause {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// `disconnect()` was called while the attempt was in flight.
    #[error("cancelled by disconnect")]
    Cancelled,

    /// The device link dropped before initialization finished.
    #[error("device disconnected during connect")]
    LinkLost,

    /// Another connect is in flight or a device is already bound.
    #[error("a session is already active")]
    AlreadyActive,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// No Bluetooth adapter is available. Not retryable without a change to
    /// the host environment.
    #[error("Bluetooth is not supported on this platform")]
    BluetoothUnsupported,

    /// Device selection was declined. The caller may retry.
    #[error("no device selected")]
    NoDeviceSelected,

    /// A step of discovery, GATT connection, resolution, subscription or
    /// initialization failed. The session is back in `Disconnected`; retry
    /// `connect()`.
    #[error("connection failed during {stage}: {cause}")]
    ConnectionFailed {
        stage: ConnectStage,
        #[source]
        cause: ConnectCause,
    },

    /// A control write failed. The connection state is unchanged.
    #[error("control command write failed: {0}")]
    CommandWriteFailed(#[source] TransportError),

    #[error("no device connected")]
    NotConnected,

    /// The transport rejected a teardown request. The session is
    /// `Disconnected` regardless.
    #[error("disconnect failed: {0}")]
    TeardownFailed(#[source] TransportError),
}

impl SessionError {
    pub(crate) fn connection_failed(stage: ConnectStage, cause: impl Into<ConnectCause>) -> Self {
        SessionError::ConnectionFailed {
            stage,
            cause: cause.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
