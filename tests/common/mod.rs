//! In-memory [`Transport`] for driving a session without a radio.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use myo_link::config::SessionConfig;
use myo_link::error::TransportError;
use myo_link::event_bus::TelemetryBus;
use myo_link::protocol::{EMG_DATA_CHARACTERISTIC, IMU_DATA_CHARACTERISTIC};
use myo_link::session::DeviceSession;
use myo_link::transport::{
    CharacteristicRef, DeviceRef, DisconnectHandler, GattServerRef, NotificationHandler,
    ServiceFilter, ServiceRef, Transport,
};
use myo_link::types::{ConnectionStatus, EventKind, TelemetryEvent};

pub const DEVICE_ID: &str = "AA:BB:CC:DD:EE:01";

/// Where the fake injects a failure.
#[derive(Debug, Clone)]
pub enum Fault {
    Request(TransportError),
    Gatt,
    Service,
    Characteristic(Uuid),
    Subscribe,
    /// Fail the n-th control write (0-based, counting every attempt).
    Write(usize),
    /// Reject `disconnect` without reporting a link drop.
    Teardown,
}

/// Where the fake parks until the test releases it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hold {
    Gatt,
    FirstWrite,
}

pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

pub struct FakeTransport {
    supported: bool,
    name: Option<String>,
    fault: Option<Fault>,
    hold: Option<(Hold, Arc<Gate>)>,
    write_attempts: AtomicUsize,
    writes: Mutex<Vec<Vec<u8>>>,
    disconnect_calls: AtomicUsize,
    notify: Mutex<HashMap<Uuid, NotificationHandler>>,
    on_drop: Mutex<Option<DisconnectHandler>>,
    /// Requested teardowns report the drop only on `deliver_drop_reports`.
    defer_drops: bool,
    queued_drops: Mutex<Vec<DisconnectHandler>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            supported: true,
            name: Some("Myo-Test".into()),
            fault: None,
            hold: None,
            write_attempts: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
            disconnect_calls: AtomicUsize::new(0),
            notify: Mutex::new(HashMap::new()),
            on_drop: Mutex::new(None),
            defer_drops: false,
            queued_drops: Mutex::new(Vec::new()),
        }
    }

    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::new()
        }
    }

    pub fn unnamed(mut self) -> Self {
        self.name = None;
        self
    }

    pub fn failing(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    /// Report requested link drops late, the way an adapter event stream does.
    pub fn deferring_drops(mut self) -> Self {
        self.defer_drops = true;
        self
    }

    /// Fire every queued link-drop report, oldest first.
    pub fn deliver_drop_reports(&self) -> usize {
        let queued = std::mem::take(&mut *self.queued_drops.lock());
        for cb in &queued {
            cb();
        }
        queued.len()
    }

    pub fn holding(mut self, at: Hold) -> (Self, Arc<Gate>) {
        let gate = Arc::new(Gate {
            entered: Notify::new(),
            release: Notify::new(),
        });
        self.hold = Some((at, Arc::clone(&gate)));
        (self, gate)
    }

    async fn pass(&self, at: Hold) {
        if let Some((point, gate)) = &self.hold {
            if *point == at {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
        }
    }

    /// Acknowledged control writes, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn handler(&self, characteristic: Uuid) -> Option<NotificationHandler> {
        self.notify.lock().get(&characteristic).cloned()
    }

    pub fn emit(&self, characteristic: Uuid, value: &[u8]) {
        if let Some(h) = self.handler(characteristic) {
            h(value);
        }
    }

    pub fn emit_emg(&self, value: &[u8]) {
        self.emit(EMG_DATA_CHARACTERISTIC, value);
    }

    pub fn emit_imu(&self, value: &[u8]) {
        self.emit(IMU_DATA_CHARACTERISTIC, value);
    }

    /// Simulate the armband going out of range.
    pub fn drop_link(&self) {
        self.notify.lock().clear();
        let callback = self.on_drop.lock().take();
        if let Some(cb) = callback {
            cb();
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn request_device(&self, _filter: &ServiceFilter) -> Result<DeviceRef, TransportError> {
        if let Some(Fault::Request(e)) = &self.fault {
            return Err(e.clone());
        }
        Ok(DeviceRef {
            id: DEVICE_ID.into(),
            name: self.name.clone(),
        })
    }

    async fn connect_gatt(&self, device: &DeviceRef) -> Result<GattServerRef, TransportError> {
        self.pass(Hold::Gatt).await;
        if let Some(Fault::Gatt) = &self.fault {
            return Err(TransportError::GattConnectionFailed("refused".into()));
        }
        Ok(GattServerRef {
            device_id: device.id.clone(),
        })
    }

    async fn get_primary_service(
        &self,
        server: &GattServerRef,
        service: Uuid,
    ) -> Result<ServiceRef, TransportError> {
        if let Some(Fault::Service) = &self.fault {
            return Err(TransportError::ServiceNotFound(service));
        }
        Ok(ServiceRef {
            device_id: server.device_id.clone(),
            uuid: service,
        })
    }

    async fn get_characteristic(
        &self,
        service: &ServiceRef,
        characteristic: Uuid,
    ) -> Result<CharacteristicRef, TransportError> {
        if let Some(Fault::Characteristic(missing)) = &self.fault {
            if *missing == characteristic {
                return Err(TransportError::CharacteristicNotFound(characteristic));
            }
        }
        Ok(CharacteristicRef {
            device_id: service.device_id.clone(),
            service: service.uuid,
            uuid: characteristic,
        })
    }

    async fn subscribe_notifications(
        &self,
        characteristic: &CharacteristicRef,
        on_value_changed: NotificationHandler,
    ) -> Result<(), TransportError> {
        if let Some(Fault::Subscribe) = &self.fault {
            return Err(TransportError::Backend("notify refused".into()));
        }
        self.notify.lock().insert(characteristic.uuid, on_value_changed);
        Ok(())
    }

    async fn write_value(
        &self,
        characteristic: &CharacteristicRef,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let index = self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if index == 0 {
            self.pass(Hold::FirstWrite).await;
        }
        if let Some(Fault::Write(n)) = &self.fault {
            if *n == index {
                return Err(TransportError::WriteFailed {
                    characteristic: characteristic.uuid,
                    reason: "injected".into(),
                });
            }
        }
        self.writes.lock().push(value.to_vec());
        Ok(())
    }

    fn on_disconnected(&self, _device: &DeviceRef, callback: DisconnectHandler) {
        *self.on_drop.lock() = Some(callback);
    }

    async fn disconnect(&self, _device: &DeviceRef) -> Result<(), TransportError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(Fault::Teardown) = &self.fault {
            return Err(TransportError::Backend("adapter busy".into()));
        }
        if self.defer_drops {
            self.notify.lock().clear();
            if let Some(cb) = self.on_drop.lock().take() {
                self.queued_drops.lock().push(cb);
            }
            return Ok(());
        }
        self.drop_link();
        Ok(())
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

/// Events published on one kind, in order.
pub type Recorded = Arc<Mutex<Vec<TelemetryEvent>>>;

pub fn record(bus: &TelemetryBus, kind: EventKind) -> Recorded {
    let seen: Recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(kind, move |event| {
        sink.lock().push(event.clone());
        Ok(())
    });
    seen
}

pub fn statuses(recorded: &Recorded) -> Vec<ConnectionStatus> {
    recorded
        .lock()
        .iter()
        .filter_map(|e| match e {
            TelemetryEvent::ConnectionStatus(s) => Some(*s),
            _ => None,
        })
        .collect()
}

pub struct Rig {
    pub transport: Arc<FakeTransport>,
    pub bus: Arc<TelemetryBus>,
    pub session: DeviceSession<FakeTransport>,
    pub status: Recorded,
}

pub fn rig(transport: FakeTransport) -> Rig {
    let transport = Arc::new(transport);
    let bus = Arc::new(TelemetryBus::new());
    let status = record(&bus, EventKind::ConnectionStatus);
    let session = DeviceSession::new(
        Arc::clone(&transport),
        Arc::clone(&bus),
        SessionConfig::default(),
    );
    Rig {
        transport,
        bus,
        session,
        status,
    }
}
