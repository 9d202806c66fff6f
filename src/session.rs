//! Connection lifecycle and control commands for one armband.
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──init ok──▶ Connected ──first frame──▶ Streaming
//!      ▲                          │                        │                        │
//!      └──── failure / cancel ────┘                        └── disconnect() / link drop ┘
//! ```
//!
//! Every connect attempt gets a fresh generation number. Callbacks registered
//! during an attempt carry that number and are ignored once the attempt is
//! over, which is how cancellation, stale disconnect callbacks and duplicate
//! link-drop reports are handled.

use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use parking_lot::{Mutex, ReentrantMutex};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{ConnectCause, ConnectStage, FrameKind, SessionError, TransportError};
use crate::event_bus::TelemetryBus;
use crate::parse::{decode_emg_frame, decode_imu_frame};
use crate::protocol::{
    encode_disable_streaming_command, encode_enable_emg_command, encode_enable_imu_command,
    encode_haptic_command, encode_set_sampling_rate_command, CONTROL_CHARACTERISTIC,
    EMG_DATA_CHARACTERISTIC, IMU_DATA_CHARACTERISTIC, MYO_SERVICE_UUID,
};
use crate::transport::{
    CharacteristicRef, DeviceRef, NotificationHandler, ServiceFilter, ServiceRef, Transport,
};
use crate::types::{
    ConnectionState, ConnectionStatus, DeviceHandle, DeviceSettings, EmgSample, ImuSample,
    TelemetryEvent,
};

// ── Timestamp helper ──────────────────────────────────────────────────────────

fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

// ── Shared state ──────────────────────────────────────────────────────────────

struct Inner {
    state: ConnectionState,
    generation: u64,
    /// Why the current generation's connect was aborted from outside.
    abort_cause: ConnectCause,
    /// Set once GATT is up; the device teardown is owed to.
    device: Option<DeviceRef>,
    handle: Option<DeviceHandle>,
    control: Option<CharacteristicRef>,
    /// `disconnect()` ran and the link-drop callback has not arrived yet.
    awaiting_teardown: bool,
    settings: DeviceSettings,
}

impl Inner {
    fn is_current_attempt(&self, generation: u64) -> bool {
        self.generation == generation && self.state == ConnectionState::Connecting
    }

    fn clear_binding(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.handle = None;
        self.control = None;
        self.device = None;
    }
}

struct Shared<T> {
    transport: Arc<T>,
    bus: Arc<TelemetryBus>,
    config: SessionConfig,
    inner: Mutex<Inner>,
    /// Serializes notification dispatch and the Connected commit.
    dispatch: ReentrantMutex<()>,
    /// Control writes never overlap.
    writes: tokio::sync::Mutex<()>,
}

impl<T: Transport> Shared<T> {
    fn publish_status(&self, status: ConnectionStatus) {
        self.bus.publish(&TelemetryEvent::ConnectionStatus(status));
    }

    async fn write_control(
        &self,
        control: &CharacteristicRef,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let _gate = self.writes.lock().await;
        debug!("control write {payload:02x?}");
        self.transport.write_value(control, payload).await
    }

    /// Decode one notification and publish it if the session is accepting
    /// telemetry for `generation`.
    fn deliver(&self, generation: u64, kind: FrameKind, data: &[u8]) {
        let _gate = self.dispatch.lock();
        let timestamp = now_ms();
        let decoded = match kind {
            FrameKind::Emg => decode_emg_frame(data)
                .map(|channels| TelemetryEvent::Emg(EmgSample { timestamp, channels })),
            FrameKind::Imu => decode_imu_frame(data).map(|f| {
                TelemetryEvent::Imu(ImuSample {
                    timestamp,
                    accelerometer: f.accelerometer,
                    gyroscope: f.gyroscope,
                    quaternion: f.quaternion,
                })
            }),
        };

        {
            let mut inner = self.inner.lock();
            if inner.generation != generation
                || !inner.state.is_connected()
                || inner.settings.streaming_paused
            {
                debug!("{kind} notification dropped in state {:?}", inner.state);
                return;
            }
            if decoded.is_ok() && inner.state == ConnectionState::Connected {
                inner.state = ConnectionState::Streaming;
                info!("Streaming telemetry.");
            }
        }

        match decoded {
            Ok(event) => self.bus.publish(&event),
            Err(e) => warn!("Dropping frame: {e}"),
        }
    }

    /// Link-drop callback for the attempt that registered it.
    fn link_lost(&self, generation: u64) {
        let publish = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                debug!("Ignoring stale disconnect callback (generation {generation})");
                false
            } else {
                match inner.state {
                    ConnectionState::Connecting => {
                        // connect() fails at its next checkpoint; a newer
                        // attempt may already be running by then.
                        info!("Device dropped during connect.");
                        inner.abort_cause = ConnectCause::LinkLost;
                        inner.generation += 1;
                        inner.clear_binding();
                        true
                    }
                    ConnectionState::Connected | ConnectionState::Streaming => {
                        info!("Device disconnected.");
                        inner.generation += 1;
                        inner.clear_binding();
                        true
                    }
                    ConnectionState::Disconnected if inner.awaiting_teardown => {
                        info!("Disconnect complete.");
                        inner.awaiting_teardown = false;
                        inner.generation += 1;
                        true
                    }
                    ConnectionState::Disconnected => false,
                }
            }
        };
        if publish {
            self.publish_status(ConnectionStatus::Disconnected);
        }
    }
}

// ── DeviceSession ─────────────────────────────────────────────────────────────

/// Owns the connection to one armband and the state machine around it.
///
/// Cloning is cheap; clones share the same session.
pub struct DeviceSession<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for DeviceSession<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> DeviceSession<T> {
    pub fn new(transport: Arc<T>, bus: Arc<TelemetryBus>, config: SessionConfig) -> Self {
        let settings = DeviceSettings {
            sampling_rate_hz: config.sampling_rate_hz,
            haptic_enabled: false,
            streaming_paused: false,
        };
        Self {
            shared: Arc::new(Shared {
                transport,
                bus,
                config,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    abort_cause: ConnectCause::Cancelled,
                    device: None,
                    handle: None,
                    control: None,
                    awaiting_teardown: false,
                    settings,
                }),
                dispatch: ReentrantMutex::new(()),
                writes: tokio::sync::Mutex::new(()),
            }),
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn bus(&self) -> &Arc<TelemetryBus> {
        &self.shared.bus
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// `true` while Connected or Streaming.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn device(&self) -> Option<DeviceHandle> {
        self.shared.inner.lock().handle.clone()
    }

    pub fn current_device_name(&self) -> Option<String> {
        self.shared.inner.lock().handle.as_ref().map(|h| h.name.clone())
    }

    pub fn settings(&self) -> DeviceSettings {
        self.shared.inner.lock().settings
    }

    // ── Connect ──────────────────────────────────────────────────────────────

    /// Select a device, connect, subscribe to EMG and IMU, and run the
    /// initialization sequence.
    ///
    /// On any failure after `Connecting` was published the session ends up
    /// `Disconnected` and publishes exactly one Disconnected status.
    pub async fn connect(&self) -> Result<DeviceHandle, SessionError> {
        if !self.shared.transport.is_supported() {
            return Err(SessionError::BluetoothUnsupported);
        }

        let (generation, owed_disconnect) = {
            let mut inner = self.shared.inner.lock();
            if inner.state != ConnectionState::Disconnected {
                return Err(SessionError::connection_failed(
                    ConnectStage::RequestDevice,
                    ConnectCause::AlreadyActive,
                ));
            }
            inner.generation += 1;
            inner.state = ConnectionState::Connecting;
            inner.abort_cause = ConnectCause::Cancelled;
            inner.settings.streaming_paused = false;
            let owed = std::mem::take(&mut inner.awaiting_teardown);
            (inner.generation, owed)
        };
        if owed_disconnect {
            // The previous link's drop report is still in flight and is
            // stale from here on.
            info!("Previous disconnect not yet confirmed; reporting it now.");
            self.shared.publish_status(ConnectionStatus::Disconnected);
        }
        info!("Connecting …");
        self.shared.publish_status(ConnectionStatus::Connecting);

        match self.establish(generation).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.abandon(generation, &e).await;
                Err(e)
            }
        }
    }

    async fn establish(&self, generation: u64) -> Result<DeviceHandle, SessionError> {
        let transport = &self.shared.transport;
        let config = &self.shared.config;

        let filter = ServiceFilter {
            services: vec![MYO_SERVICE_UUID],
            name_prefix: Some(config.name_prefix.clone()),
        };
        let device = transport
            .request_device(&filter)
            .await
            .map_err(|e| match e {
                TransportError::NoDeviceSelected => SessionError::NoDeviceSelected,
                e => SessionError::connection_failed(ConnectStage::RequestDevice, e),
            })?;
        self.checkpoint(generation, ConnectStage::RequestDevice)?;
        info!("Selected device {} ({:?})", device.id, device.name);

        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        transport.on_disconnected(
            &device,
            Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.link_lost(generation);
                }
            }),
        );

        let server = transport
            .connect_gatt(&device)
            .await
            .map_err(|e| SessionError::connection_failed(ConnectStage::GattConnect, e))?;
        if let Err(e) = self.bind_device(generation, &device) {
            // Cancelled while the GATT handshake was in flight. Close the
            // link unless a newer attempt is already working on the device.
            let superseded = self.shared.inner.lock().state != ConnectionState::Disconnected;
            if superseded {
                debug!("Cancelled connect leaves the link to the newer attempt");
            } else if let Err(te) = transport.disconnect(&device).await {
                debug!("Teardown after cancelled connect failed: {te}");
            }
            return Err(e);
        }

        let service = transport
            .get_primary_service(&server, MYO_SERVICE_UUID)
            .await
            .map_err(|e| SessionError::connection_failed(ConnectStage::ResolveService, e))?;
        self.checkpoint(generation, ConnectStage::ResolveService)?;

        let emg = self.resolve(&service, EMG_DATA_CHARACTERISTIC, generation).await?;
        let imu = self.resolve(&service, IMU_DATA_CHARACTERISTIC, generation).await?;
        let control = self.resolve(&service, CONTROL_CHARACTERISTIC, generation).await?;

        for (characteristic, kind) in [(&emg, FrameKind::Emg), (&imu, FrameKind::Imu)] {
            transport
                .subscribe_notifications(characteristic, self.notification_handler(generation, kind))
                .await
                .map_err(|e| {
                    SessionError::connection_failed(ConnectStage::SubscribeNotifications, e)
                })?;
            self.checkpoint(generation, ConnectStage::SubscribeNotifications)?;
        }

        self.initialize(&control, generation).await?;

        let handle = DeviceHandle {
            id: device.id.clone(),
            name: device
                .name
                .clone()
                .unwrap_or_else(|| config.default_device_name.clone()),
        };

        let _gate = self.shared.dispatch.lock();
        {
            let mut inner = self.shared.inner.lock();
            if !inner.is_current_attempt(generation) {
                return Err(SessionError::connection_failed(
                    ConnectStage::Initialize,
                    inner.abort_cause.clone(),
                ));
            }
            inner.state = ConnectionState::Connected;
            inner.handle = Some(handle.clone());
            inner.control = Some(control);
            inner.settings.sampling_rate_hz = config.sampling_rate_hz;
        }
        info!("Connected to {}", handle.name);
        self.shared.publish_status(ConnectionStatus::Connected);
        Ok(handle)
    }

    /// Enable EMG, then IMU, then set the sampling rate. The device requires
    /// this order and one write at a time.
    async fn initialize(
        &self,
        control: &CharacteristicRef,
        generation: u64,
    ) -> Result<(), SessionError> {
        let sequence = [
            ("enable EMG", encode_enable_emg_command()),
            ("enable IMU", encode_enable_imu_command()),
            (
                "set sampling rate",
                encode_set_sampling_rate_command(self.shared.config.sampling_rate_hz),
            ),
        ];
        for (step, payload) in sequence {
            self.checkpoint(generation, ConnectStage::Initialize)?;
            debug!("init: {step}");
            self.shared
                .write_control(control, &payload)
                .await
                .map_err(|e| SessionError::connection_failed(ConnectStage::Initialize, e))?;
        }
        self.checkpoint(generation, ConnectStage::Initialize)
    }

    async fn resolve(
        &self,
        service: &ServiceRef,
        uuid: Uuid,
        generation: u64,
    ) -> Result<CharacteristicRef, SessionError> {
        let c = self
            .shared
            .transport
            .get_characteristic(service, uuid)
            .await
            .map_err(|e| SessionError::connection_failed(ConnectStage::ResolveCharacteristic, e))?;
        self.checkpoint(generation, ConnectStage::ResolveCharacteristic)?;
        Ok(c)
    }

    fn notification_handler(&self, generation: u64, kind: FrameKind) -> NotificationHandler {
        let weak = Arc::downgrade(&self.shared);
        Arc::new(move |data: &[u8]| {
            if let Some(shared) = weak.upgrade() {
                shared.deliver(generation, kind, data);
            }
        })
    }

    /// Fail if the attempt was cancelled or superseded while suspended.
    fn checkpoint(&self, generation: u64, stage: ConnectStage) -> Result<(), SessionError> {
        let inner = self.shared.inner.lock();
        if inner.is_current_attempt(generation) {
            Ok(())
        } else {
            Err(SessionError::connection_failed(stage, inner.abort_cause.clone()))
        }
    }

    fn bind_device(&self, generation: u64, device: &DeviceRef) -> Result<(), SessionError> {
        let mut inner = self.shared.inner.lock();
        if inner.is_current_attempt(generation) {
            inner.device = Some(device.clone());
            Ok(())
        } else {
            Err(SessionError::connection_failed(
                ConnectStage::GattConnect,
                inner.abort_cause.clone(),
            ))
        }
    }

    /// Return to `Disconnected` after a failed attempt.
    ///
    /// An attempt aborted from outside (cancel or link drop) was already
    /// reset and reported by whoever aborted it.
    async fn abandon(&self, generation: u64, err: &SessionError) {
        let (teardown, publish) = {
            let mut inner = self.shared.inner.lock();
            if inner.generation == generation {
                let device = inner.device.take();
                inner.clear_binding();
                // Callbacks from this attempt are stale from here on.
                inner.generation += 1;
                (device, true)
            } else {
                (None, false)
            }
        };
        warn!("Connect failed: {err}");
        if let Some(device) = teardown {
            if let Err(e) = self.shared.transport.disconnect(&device).await {
                debug!("Teardown after failed connect failed: {e}");
            }
        }
        if publish {
            self.shared.publish_status(ConnectionStatus::Disconnected);
        }
    }

    // ── Disconnect ───────────────────────────────────────────────────────────

    /// Tear the link down. Calling this while already disconnected does
    /// nothing.
    ///
    /// From Connected or Streaming the Disconnected status is published when
    /// the transport reports the link drop, or by the next `connect()` if
    /// that report has not arrived yet. Cancelling a connect in progress
    /// publishes it right away.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let (device, cancelled) = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                ConnectionState::Disconnected => {
                    debug!("disconnect(): already disconnected");
                    return Ok(());
                }
                ConnectionState::Connecting => {
                    info!("Cancelling connect in progress.");
                    inner.abort_cause = ConnectCause::Cancelled;
                    inner.generation += 1;
                    let device = inner.device.take();
                    inner.clear_binding();
                    (device, true)
                }
                ConnectionState::Connected | ConnectionState::Streaming => {
                    info!("Disconnecting …");
                    let device = inner.device.take();
                    inner.clear_binding();
                    inner.awaiting_teardown = true;
                    (device, false)
                }
            }
        };
        if cancelled {
            // The cancelled attempt may not reach a checkpoint before the
            // next connect() starts.
            self.shared.publish_status(ConnectionStatus::Disconnected);
        }

        let Some(device) = device else {
            return Ok(());
        };
        match self.shared.transport.disconnect(&device).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let publish = {
                    let mut inner = self.shared.inner.lock();
                    std::mem::take(&mut inner.awaiting_teardown)
                };
                if publish {
                    self.shared.publish_status(ConnectionStatus::Disconnected);
                }
                Err(SessionError::TeardownFailed(e))
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    fn connected_control(&self) -> Option<CharacteristicRef> {
        let inner = self.shared.inner.lock();
        if inner.state.is_connected() {
            inner.control.clone()
        } else {
            None
        }
    }

    /// Turn haptic feedback on or off.
    ///
    /// Returns `false` without writing anything when no device is connected,
    /// and `false` when the write fails. Never affects the connection.
    pub async fn set_haptic_feedback(&self, enabled: bool) -> bool {
        let Some(control) = self.connected_control() else {
            debug!("set_haptic_feedback({enabled}): not connected");
            return false;
        };
        match self
            .shared
            .write_control(&control, &encode_haptic_command(enabled))
            .await
        {
            Ok(()) => {
                self.shared.inner.lock().settings.haptic_enabled = enabled;
                true
            }
            Err(e) => {
                warn!("{}", SessionError::CommandWriteFailed(e));
                false
            }
        }
    }

    /// Change the streaming rate of a connected device.
    pub async fn set_sampling_rate(&self, hz: u8) -> Result<(), SessionError> {
        let control = self.connected_control().ok_or(SessionError::NotConnected)?;
        self.shared
            .write_control(&control, &encode_set_sampling_rate_command(hz))
            .await
            .map_err(SessionError::CommandWriteFailed)?;
        self.shared.inner.lock().settings.sampling_rate_hz = hz;
        info!("Sampling rate set to {hz} Hz");
        Ok(())
    }

    /// Ask the device to stop streaming and drop anything still in flight.
    /// The session stays `Connected`.
    pub async fn stop_streaming(&self) -> Result<(), SessionError> {
        let control = self.connected_control().ok_or(SessionError::NotConnected)?;
        self.shared
            .write_control(&control, &encode_disable_streaming_command())
            .await
            .map_err(SessionError::CommandWriteFailed)?;
        let mut inner = self.shared.inner.lock();
        inner.settings.streaming_paused = true;
        if inner.state == ConnectionState::Streaming {
            inner.state = ConnectionState::Connected;
        }
        info!("Streaming paused.");
        Ok(())
    }

    /// Re-enable EMG and IMU streaming after [`DeviceSession::stop_streaming`].
    pub async fn start_streaming(&self) -> Result<(), SessionError> {
        let control = self.connected_control().ok_or(SessionError::NotConnected)?;
        for payload in [encode_enable_emg_command(), encode_enable_imu_command()] {
            self.shared
                .write_control(&control, &payload)
                .await
                .map_err(SessionError::CommandWriteFailed)?;
        }
        self.shared.inner.lock().settings.streaming_paused = false;
        info!("Streaming resumed.");
        Ok(())
    }
}
