//! # myo-link
//!
//! Async Rust library and CLI for streaming EMG and IMU telemetry from
//! Myo-class gesture armbands over Bluetooth Low Energy.
//!
//! ## Wire format
//!
//! | Characteristic | Payload | Decoded into |
//! |---|---|---|
//! | EMG `d5060005-…` | 8 × `i8`, channels 1–8 | [`types::EmgSample`] |
//! | IMU `d5060002-…` | 10 × `i16` LE: accel ÷2048, gyro ÷16, quat ÷16384 | [`types::ImuSample`] |
//! | Control `d5060401-…` | fixed command bytes, see [`protocol`] | — |
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use myo_link::prelude::*;
//!
//! # #[cfg(feature = "btle")]
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SessionConfig::default();
//!     let transport = Arc::new(BtleTransport::new(&config).await);
//!     let bus = Arc::new(TelemetryBus::new());
//!     let session = DeviceSession::new(transport, Arc::clone(&bus), config);
//!
//!     bus.subscribe(EventKind::Emg, |event| {
//!         if let TelemetryEvent::Emg(sample) = event {
//!             println!("{:?}", sample.channels.map(|c| c.raw_value));
//!         }
//!         Ok(())
//!     });
//!
//!     let device = session.connect().await?;
//!     println!("connected to {}", device.name);
//!     tokio::signal::ctrl_c().await?;
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! # #[cfg(not(feature = "btle"))]
//! # fn main() {}
//! ```
//!
//! Build with `default-features = false` to drop `btleplug` and drive the
//! session from your own [`transport::Transport`].
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`session`] | Connection state machine, initialization, control commands |
//! | [`event_bus`] | Typed publish/subscribe for decoded telemetry |
//! | [`transport`] | The wireless capability trait the session depends on |
//! | [`btle`] | `btleplug` implementation of that trait (feature `btle`) |
//! | [`parse`] | Byte-to-sample decoders for EMG and IMU frames |
//! | [`protocol`] | GATT UUIDs, constants, and control-command encoders |
//! | [`types`] | Samples, events, and states |
//! | [`config`] | `SessionConfig` and TOML loading |
//! | [`error`] | Error types |

#[cfg(feature = "btle")]
pub mod btle;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod parse;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Session ───────────────────────────────────────────────────────────────
    #[cfg(feature = "btle")]
    pub use crate::btle::BtleTransport;
    pub use crate::config::SessionConfig;
    pub use crate::event_bus::{SubscriptionToken, TelemetryBus};
    pub use crate::session::DeviceSession;
    pub use crate::transport::Transport;

    // ── Events and data types ─────────────────────────────────────────────────
    pub use crate::types::{
        ChannelQuality, ChannelReading, ChannelSetting, ChannelSettings, ConnectionState,
        ConnectionStatus, DeviceHandle, EmgSample, EventKind, ImuSample, Quaternion,
        TelemetryEvent, Vector3,
    };

    // ── Errors ────────────────────────────────────────────────────────────────
    pub use crate::error::{FrameError, SessionError, TransportError};

    // ── Protocol constants ────────────────────────────────────────────────────
    pub use crate::protocol::{
        EMG_CHANNEL_COUNT, EMG_QUALITY_THRESHOLD, TREMOR_MAGNITUDE_THRESHOLD,
    };
}
