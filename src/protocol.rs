//! GATT UUIDs, wire constants, and control-command encoders for Myo armbands.
//!
//! All UUIDs belong to the Myo vendor namespace
//! `d506XXXX-a904-deb9-4748-2c7f4a124842`.

use uuid::Uuid;

// ── Service ──────────────────────────────────────────────────────────────────

/// Primary GATT service UUID advertised by Myo armbands.
///
/// Used as the scan filter and as the service that owns every characteristic
/// below.
pub const MYO_SERVICE_UUID: Uuid = Uuid::from_u128(0xd5060001_a904_deb9_4748_2c7f4a124842);

// ── Characteristics ───────────────────────────────────────────────────────────

/// EMG notification characteristic: one 8-byte frame per notification,
/// one signed byte per channel.
pub const EMG_DATA_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xd5060005_a904_deb9_4748_2c7f4a124842);

/// IMU notification characteristic: one 20-byte little-endian frame carrying
/// accelerometer, gyroscope, and orientation quaternion.
pub const IMU_DATA_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xd5060002_a904_deb9_4748_2c7f4a124842);

/// Write-only control characteristic. Accepts the fixed-layout commands built
/// by the `encode_*` functions in this module.
pub const CONTROL_CHARACTERISTIC: Uuid = Uuid::from_u128(0xd5060401_a904_deb9_4748_2c7f4a124842);

// ── Frame layout ──────────────────────────────────────────────────────────────

/// Number of EMG electrodes on the armband.
pub const EMG_CHANNEL_COUNT: usize = 8;

/// Exact length of an EMG notification payload.
pub const EMG_FRAME_LEN: usize = 8;

/// Minimum length of an IMU notification payload. Longer payloads are
/// accepted and the trailing bytes ignored.
pub const IMU_FRAME_LEN: usize = 20;

/// Raw accelerometer LSBs per g (offsets 0/2/4).
pub const ACCELEROMETER_SCALE: f32 = 2048.0;

/// Raw gyroscope LSBs per deg/s (offsets 6/8/10).
pub const GYROSCOPE_SCALE: f32 = 16.0;

/// Raw quaternion LSBs per unit (offsets 12/14/16/18).
pub const QUATERNION_SCALE: f32 = 16384.0;

// ── Signal thresholds ─────────────────────────────────────────────────────────

/// A channel reading is [`crate::types::ChannelQuality::Good`] when
/// `|raw| < EMG_QUALITY_THRESHOLD`, otherwise `Poor`.
///
/// Carried forward unchanged from the device firmware's companion app. Note
/// that a signed 8-bit reading can never reach it, so every decoded frame
/// currently reports `Good`.
pub const EMG_QUALITY_THRESHOLD: i16 = 200;

/// Average spectral magnitude in the tremor band above which downstream
/// consumers flag a tremor. The core never applies it.
pub const TREMOR_MAGNITUDE_THRESHOLD: f64 = 30.0;

/// Default per-channel breach threshold in µV used by consumer-side
/// [`crate::types::ChannelSettings`].
pub const DEFAULT_CHANNEL_THRESHOLD_UV: i32 = 75;

/// Sampling rate written during initialization.
pub const DEFAULT_SAMPLING_RATE_HZ: u8 = 50;

// ── Control commands ──────────────────────────────────────────────────────────
//
// The device only accepts these in a fixed order during initialization:
// enable EMG, enable IMU, set sampling rate.

/// Start EMG streaming: `[0x01, 0x03, 0x02, 0x01, 0x01]`.
pub fn encode_enable_emg_command() -> Vec<u8> {
    vec![0x01, 0x03, 0x02, 0x01, 0x01]
}

/// Start IMU streaming: `[0x01, 0x02, 0x01, 0x01]`.
pub fn encode_enable_imu_command() -> Vec<u8> {
    vec![0x01, 0x02, 0x01, 0x01]
}

/// Set the streaming rate: `[0x03, 0x01, hz]`.
///
/// ```
/// # use myo_link::protocol::encode_set_sampling_rate_command;
/// assert_eq!(encode_set_sampling_rate_command(50), &[0x03, 0x01, 0x32]);
/// ```
pub fn encode_set_sampling_rate_command(hz: u8) -> Vec<u8> {
    vec![0x03, 0x01, hz]
}

/// Toggle haptic feedback: `[0x03, 0x01, 0x01]` on, `[0x03, 0x01, 0x00]` off.
///
/// Shares its header with [`encode_set_sampling_rate_command`]; the device
/// tells them apart by session phase.
pub fn encode_haptic_command(enabled: bool) -> Vec<u8> {
    vec![0x03, 0x01, u8::from(enabled)]
}

/// Set-mode with EMG, IMU and classifier all off:
/// `[0x01, 0x03, 0x00, 0x00, 0x00]`.
pub fn encode_disable_streaming_command() -> Vec<u8> {
    vec![0x01, 0x03, 0x00, 0x00, 0x00]
}
