//! Binary decoders for Myo BLE notification payloads.
//!
//! All public functions in this module are pure (no I/O, no allocation) and
//! are safe to call from any async or sync context.
//!
//! | Function | Sensor | Format |
//! |---|---|---|
//! | [`decode_emg_frame`] | EMG | exactly 8 × `i8`, channels 1..=8 |
//! | [`decode_imu_frame`] | IMU | ≥ 20 bytes, 10 × `i16` LE |
//!
//! Timestamps are not part of either frame; the session stamps samples on
//! arrival.

use crate::error::{FrameError, FrameKind};
use crate::protocol::{
    ACCELEROMETER_SCALE, EMG_CHANNEL_COUNT, EMG_FRAME_LEN, GYROSCOPE_SCALE, IMU_FRAME_LEN,
    QUATERNION_SCALE,
};
use crate::types::{ChannelQuality, ChannelReading, Quaternion, Vector3};

// ── EMG ──────────────────────────────────────────────────────────────────────

/// Decode an 8-byte EMG notification into per-channel readings.
///
/// Each byte is one signed sample. `rms_estimate` is the sample's absolute
/// value and `quality` follows [`ChannelQuality::classify`].
///
/// Fails with [`FrameError::MalformedFrame`] unless `data.len() == 8`.
pub fn decode_emg_frame(data: &[u8]) -> Result<[ChannelReading; EMG_CHANNEL_COUNT], FrameError> {
    let bytes: &[u8; EMG_FRAME_LEN] = data.try_into().map_err(|_| FrameError::MalformedFrame {
        kind: FrameKind::Emg,
        expected: EMG_FRAME_LEN,
        actual: data.len(),
    })?;

    Ok(std::array::from_fn(|i| {
        let raw_value = bytes[i] as i8;
        let magnitude = (raw_value as i16).abs();
        ChannelReading {
            channel: i as u8 + 1,
            raw_value,
            rms_estimate: magnitude as f32,
            quality: ChannelQuality::classify(magnitude),
        }
    }))
}

// ── IMU ───────────────────────────────────────────────────────────────────────

/// Decoded IMU fields, before the session attaches a timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuFrame {
    pub accelerometer: Vector3,
    pub gyroscope: Vector3,
    pub quaternion: Quaternion,
}

/// Read a little-endian signed 16-bit integer from `data` at byte `offset`.
///
/// # Panics
/// Panics if `offset + 1 >= data.len()`.
fn read_i16_le(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

/// Decode an IMU notification.
///
/// | Bytes | Field | Conversion |
/// |---|---|---|
/// | 0–5 | accel x, y, z | ÷ 2048 → g |
/// | 6–11 | gyro x, y, z | ÷ 16 → deg/s |
/// | 12–19 | quaternion w, x, y, z | ÷ 16384 |
///
/// Fails with [`FrameError::MalformedFrame`] if `data` is shorter than 20
/// bytes. Anything past byte 19 is ignored.
pub fn decode_imu_frame(data: &[u8]) -> Result<ImuFrame, FrameError> {
    if data.len() < IMU_FRAME_LEN {
        return Err(FrameError::MalformedFrame {
            kind: FrameKind::Imu,
            expected: IMU_FRAME_LEN,
            actual: data.len(),
        });
    }

    let scaled = |off: usize, scale: f32| read_i16_le(data, off) as f32 / scale;
    let xyz = |off: usize, scale: f32| Vector3 {
        x: scaled(off, scale),
        y: scaled(off + 2, scale),
        z: scaled(off + 4, scale),
    };

    Ok(ImuFrame {
        accelerometer: xyz(0, ACCELEROMETER_SCALE),
        gyroscope: xyz(6, GYROSCOPE_SCALE),
        quaternion: Quaternion {
            w: scaled(12, QUATERNION_SCALE),
            x: scaled(14, QUATERNION_SCALE),
            y: scaled(16, QUATERNION_SCALE),
            z: scaled(18, QUATERNION_SCALE),
        },
    })
}
