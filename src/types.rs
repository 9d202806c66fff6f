use std::collections::BTreeMap;

use serde::Serialize;

use crate::protocol::{DEFAULT_CHANNEL_THRESHOLD_UV, EMG_CHANNEL_COUNT, EMG_QUALITY_THRESHOLD};

/// Signal-quality verdict for one EMG channel reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelQuality {
    Good,
    Poor,
}

impl ChannelQuality {
    /// `Good` iff `|value| < EMG_QUALITY_THRESHOLD`.
    ///
    /// Takes an `i16` so the rule can be exercised on magnitudes an 8-bit
    /// frame cannot carry.
    pub fn classify(value: i16) -> Self {
        if value.unsigned_abs() < EMG_QUALITY_THRESHOLD as u16 {
            ChannelQuality::Good
        } else {
            ChannelQuality::Poor
        }
    }
}

/// One channel of one EMG notification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelReading {
    /// Electrode number, 1-based (1..=8).
    pub channel: u8,
    /// Raw signed 8-bit magnitude as sent by the armband.
    pub raw_value: i8,
    /// `|raw_value|`.
    ///
    /// This is a same-sample magnitude, not a windowed RMS. Consumers that
    /// need a true RMS must accumulate samples themselves.
    pub rms_estimate: f32,
    pub quality: ChannelQuality,
}

/// A decoded EMG notification: all eight channels at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmgSample {
    /// Wall-clock arrival time in milliseconds since Unix epoch.
    pub timestamp: f64,
    /// Readings in channel order 1..=8.
    pub channels: [ChannelReading; EMG_CHANNEL_COUNT],
}

/// A single 3-axis measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Orientation as a unit quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// A decoded IMU notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImuSample {
    /// Wall-clock arrival time in milliseconds since Unix epoch.
    pub timestamp: f64,
    /// Acceleration in g.
    pub accelerometer: Vector3,
    /// Angular rate in deg/s.
    pub gyroscope: Vector3,
    pub quaternion: Quaternion,
}

/// Lifecycle state of a [`crate::session::DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Connected and at least one notification has been delivered since the
    /// last (re)start of streaming.
    Streaming,
}

impl ConnectionState {
    /// `true` for `Connected` and `Streaming`.
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Streaming)
    }
}

/// Payload of the connection-status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// The device currently bound to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceHandle {
    /// Platform BLE identifier.
    /// • macOS / Windows: a UUID string
    /// • Linux: a Bluetooth MAC address
    pub id: String,
    /// Advertised name, or the configured fallback when the device has none.
    pub name: String,
}

/// Settings most recently written to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceSettings {
    pub sampling_rate_hz: u8,
    pub haptic_enabled: bool,
    pub streaming_paused: bool,
}

/// Which event stream a subscriber listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Emg,
    Imu,
    ConnectionStatus,
}

/// Everything the event bus carries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum TelemetryEvent {
    Emg(EmgSample),
    Imu(ImuSample),
    ConnectionStatus(ConnectionStatus),
}

impl TelemetryEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TelemetryEvent::Emg(_) => EventKind::Emg,
            TelemetryEvent::Imu(_) => EventKind::Imu,
            TelemetryEvent::ConnectionStatus(_) => EventKind::ConnectionStatus,
        }
    }
}

// ── Consumer-side settings ────────────────────────────────────────────────────

/// Display and alerting preferences for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSetting {
    pub muted: bool,
    pub threshold_microvolts: i32,
}

impl Default for ChannelSetting {
    fn default() -> Self {
        Self {
            muted: false,
            threshold_microvolts: DEFAULT_CHANNEL_THRESHOLD_UV,
        }
    }
}

/// Per-channel settings owned by the consumer.
///
/// The session never reads these; they exist so consumers can evaluate
/// breaches against the values the session supplies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSettings(BTreeMap<u8, ChannelSetting>);

impl Default for ChannelSettings {
    fn default() -> Self {
        Self(
            (1..=EMG_CHANNEL_COUNT as u8)
                .map(|ch| (ch, ChannelSetting::default()))
                .collect(),
        )
    }
}

impl ChannelSettings {
    /// Settings for `channel`, falling back to defaults for unknown channels.
    pub fn get(&self, channel: u8) -> ChannelSetting {
        self.0.get(&channel).copied().unwrap_or_default()
    }

    /// Replace the settings for `channel`. Channels outside 1..=8 are ignored.
    pub fn set(&mut self, channel: u8, setting: ChannelSetting) {
        if (1..=EMG_CHANNEL_COUNT as u8).contains(&channel) {
            self.0.insert(channel, setting);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, ChannelSetting)> + '_ {
        self.0.iter().map(|(ch, s)| (*ch, *s))
    }
}
