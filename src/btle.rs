//! [`Transport`] on the host Bluetooth stack via `btleplug`.
//!
//! One notification pump task runs per connected peripheral and routes values
//! to the handler registered for their characteristic. Link drops are picked
//! up from the adapter's `CentralEvent` stream, which fires reliably when the
//! armband is switched off or walks out of range, and also after a requested
//! disconnect. When no watcher could be started, `disconnect` reports the drop
//! itself so the session still hears about it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::TransportError;
use crate::transport::{
    CharacteristicRef, DeviceRef, DisconnectHandler, GattServerRef, NotificationHandler,
    ServiceFilter, ServiceRef, Transport,
};

type HandlerTable = Arc<Mutex<HashMap<Uuid, NotificationHandler>>>;

/// A disconnect callback that fires at most once, from whichever side sees
/// the drop first.
#[derive(Clone)]
struct DropReport(Arc<Mutex<Option<DisconnectHandler>>>);

impl DropReport {
    fn new(callback: DisconnectHandler) -> Self {
        Self(Arc::new(Mutex::new(Some(callback))))
    }

    fn fire(&self) -> bool {
        let callback = self.0.lock().take();
        match callback {
            Some(cb) => {
                cb();
                true
            }
            None => false,
        }
    }
}

fn watcher_running(watcher: Option<&JoinHandle<()>>) -> bool {
    watcher.is_some_and(|w| !w.is_finished())
}

/// A peripheral handed out by `request_device`.
struct Link {
    peripheral: Peripheral,
    handlers: HandlerTable,
    pump: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    report: Option<DropReport>,
}

impl Link {
    fn new(peripheral: Peripheral) -> Self {
        Self {
            peripheral,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            pump: None,
            watcher: None,
            report: None,
        }
    }
}

pub struct BtleTransport {
    adapter: Option<Adapter>,
    scan_timeout: Duration,
    connect_timeout: Duration,
    links: Mutex<HashMap<String, Link>>,
}

impl BtleTransport {
    /// Open the first Bluetooth adapter.
    ///
    /// Never fails: when there is no usable adapter the transport reports
    /// itself unsupported and the session refuses to connect.
    pub async fn new(config: &SessionConfig) -> Self {
        let adapter = match first_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("Bluetooth unavailable: {e}");
                None
            }
        };
        if let Some(adapter) = &adapter {
            wait_until_powered_on(adapter).await;
        }
        Self {
            adapter,
            scan_timeout: config.scan_timeout(),
            connect_timeout: config.connect_timeout(),
            links: Mutex::new(HashMap::new()),
        }
    }

    fn adapter(&self) -> Result<&Adapter, TransportError> {
        self.adapter
            .as_ref()
            .ok_or_else(|| TransportError::Backend("no Bluetooth adapter".into()))
    }

    fn peripheral(&self, device_id: &str) -> Result<Peripheral, TransportError> {
        self.links
            .lock()
            .get(device_id)
            .map(|l| l.peripheral.clone())
            .ok_or_else(|| TransportError::UnknownDevice(device_id.to_owned()))
    }

    fn find_char(
        &self,
        c: &CharacteristicRef,
    ) -> Result<(Peripheral, Characteristic), TransportError> {
        let peripheral = self.peripheral(&c.device_id)?;
        let found = peripheral
            .characteristics()
            .into_iter()
            .find(|ch| ch.uuid == c.uuid && ch.service_uuid == c.service)
            .ok_or(TransportError::CharacteristicNotFound(c.uuid))?;
        Ok((peripheral, found))
    }

    /// Poll until the first matching peripheral appears or the scan times out.
    async fn find_first(
        &self,
        adapter: &Adapter,
        filter: &ServiceFilter,
    ) -> Result<(Peripheral, Option<String>), TransportError> {
        let scan = async {
            loop {
                for p in adapter.peripherals().await.unwrap_or_default() {
                    if let Ok(Some(props)) = p.properties().await {
                        if filter.matches(&props.services, props.local_name.as_deref()) {
                            return (p, props.local_name);
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        };
        tokio::time::timeout(self.scan_timeout, scan).await.map_err(|_| {
            info!(
                "No matching device after {} s",
                self.scan_timeout.as_secs()
            );
            TransportError::NoDeviceSelected
        })
    }
}

async fn first_adapter() -> Result<Option<Adapter>, btleplug::Error> {
    let manager = Manager::new().await?;
    Ok(manager.adapters().await?.into_iter().next())
}

/// On macOS `CBCentralManager` starts out in an "unknown" state and silently
/// ignores scans until it reports poweredOn.
#[cfg(target_os = "macos")]
async fn wait_until_powered_on(adapter: &Adapter) {
    use btleplug::api::CentralState;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => break,
            Ok(state) if tokio::time::Instant::now() >= deadline => {
                warn!("macOS: adapter still {state:?} after 3 s, proceeding anyway");
                break;
            }
            Ok(state) => debug!("macOS: adapter state = {state:?}, waiting…"),
            Err(e) => {
                warn!("macOS: adapter_state() error: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[cfg(not(target_os = "macos"))]
async fn wait_until_powered_on(_adapter: &Adapter) {}

fn spawn_watcher(adapter: Adapter, watched: String, report: DropReport) -> JoinHandle<()> {
    tokio::spawn(async move {
        match adapter.events().await {
            Ok(mut events) => {
                while let Some(event) = events.next().await {
                    if let CentralEvent::DeviceDisconnected(pid) = event {
                        if pid.to_string() == watched {
                            info!("Disconnect watcher: device {watched} disconnected.");
                            report.fire();
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!("Disconnect watcher: could not subscribe to adapter events: {e}"),
        }
    })
}

#[async_trait]
impl Transport for BtleTransport {
    fn is_supported(&self) -> bool {
        self.adapter.is_some()
    }

    async fn request_device(&self, filter: &ServiceFilter) -> Result<DeviceRef, TransportError> {
        let adapter = self.adapter()?;
        info!("Scanning for Myo devices (timeout: {} s) …", self.scan_timeout.as_secs());
        adapter.start_scan(ScanFilter::default()).await?;
        let found = self.find_first(adapter, filter).await;
        adapter.stop_scan().await.ok();

        let (peripheral, name) = found?;
        let id = peripheral.id().to_string();
        info!("Found device: {} ({id})", name.as_deref().unwrap_or("unnamed"));

        let mut links = self.links.lock();
        if let Some(old) = links.insert(id.clone(), Link::new(peripheral)) {
            for task in [old.pump, old.watcher].into_iter().flatten() {
                task.abort();
            }
        }
        Ok(DeviceRef { id, name })
    }

    async fn connect_gatt(&self, device: &DeviceRef) -> Result<GattServerRef, TransportError> {
        let peripheral = self.peripheral(&device.id)?;
        let limit = self.connect_timeout;

        // BlueZ's Device1.Connect can block forever when the device is out
        // of range or the stack is wedged.
        tokio::time::timeout(limit, peripheral.connect())
            .await
            .map_err(|_| TransportError::Timeout(limit))?
            .map_err(|e| TransportError::GattConnectionFailed(e.to_string()))?;

        // BlueZ reports the connection before the remote GATT cache is
        // populated; discovering too early returns an empty set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(limit, peripheral.discover_services())
            .await
            .map_err(|_| TransportError::Timeout(limit))?
            .map_err(|e| TransportError::GattConnectionFailed(e.to_string()))?;
        info!("Connected and services discovered: {}", device.id);

        Ok(GattServerRef {
            device_id: device.id.clone(),
        })
    }

    async fn get_primary_service(
        &self,
        server: &GattServerRef,
        service: Uuid,
    ) -> Result<ServiceRef, TransportError> {
        let peripheral = self.peripheral(&server.device_id)?;
        peripheral
            .services()
            .iter()
            .find(|s| s.uuid == service && s.primary)
            .map(|s| ServiceRef {
                device_id: server.device_id.clone(),
                uuid: s.uuid,
            })
            .ok_or(TransportError::ServiceNotFound(service))
    }

    async fn get_characteristic(
        &self,
        service: &ServiceRef,
        characteristic: Uuid,
    ) -> Result<CharacteristicRef, TransportError> {
        let c = CharacteristicRef {
            device_id: service.device_id.clone(),
            service: service.uuid,
            uuid: characteristic,
        };
        self.find_char(&c)?;
        Ok(c)
    }

    async fn subscribe_notifications(
        &self,
        characteristic: &CharacteristicRef,
        on_value_changed: NotificationHandler,
    ) -> Result<(), TransportError> {
        let (peripheral, c) = self.find_char(characteristic)?;
        peripheral.subscribe(&c).await?;

        let (handlers, needs_pump) = {
            let links = self.links.lock();
            let link = links
                .get(&characteristic.device_id)
                .ok_or_else(|| TransportError::UnknownDevice(characteristic.device_id.clone()))?;
            link.handlers.lock().insert(characteristic.uuid, on_value_changed);
            (Arc::clone(&link.handlers), link.pump.is_none())
        };
        if !needs_pump {
            return Ok(());
        }

        let mut notifications = peripheral.notifications().await?;
        let device_id = characteristic.device_id.clone();
        let pump = tokio::spawn(async move {
            let mut count: u64 = 0;
            while let Some(n) = notifications.next().await {
                count += 1;
                if count <= 3 || count % 500 == 0 {
                    debug!("notif #{count} uuid={} len={}", n.uuid, n.value.len());
                }
                let handler = handlers.lock().get(&n.uuid).cloned();
                match handler {
                    Some(h) => h(n.value.as_slice()),
                    None => debug!("Unrouted notification from {}", n.uuid),
                }
            }
            info!("Notification stream for {device_id} ended.");
        });
        if let Some(link) = self.links.lock().get_mut(&characteristic.device_id) {
            link.pump = Some(pump);
        }
        Ok(())
    }

    async fn write_value(
        &self,
        characteristic: &CharacteristicRef,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let (peripheral, c) = self.find_char(characteristic)?;
        peripheral
            .write(&c, value, WriteType::WithResponse)
            .await
            .map_err(|e| TransportError::WriteFailed {
                characteristic: characteristic.uuid,
                reason: e.to_string(),
            })
    }

    fn on_disconnected(&self, device: &DeviceRef, callback: DisconnectHandler) {
        let report = DropReport::new(callback);
        let watcher = match self.adapter() {
            Ok(adapter) => Some(spawn_watcher(
                adapter.clone(),
                device.id.clone(),
                report.clone(),
            )),
            Err(e) => {
                warn!("Disconnect watcher not started: {e}");
                None
            }
        };
        if let Some(link) = self.links.lock().get_mut(&device.id) {
            link.report = Some(report);
            if let Some(old) = std::mem::replace(&mut link.watcher, watcher) {
                old.abort();
            }
        }
    }

    async fn disconnect(&self, device: &DeviceRef) -> Result<(), TransportError> {
        let mut link = self
            .links
            .lock()
            .remove(&device.id)
            .ok_or_else(|| TransportError::UnknownDevice(device.id.clone()))?;
        if let Some(pump) = link.pump.take() {
            pump.abort();
        }
        link.handlers.lock().clear();

        if let Err(e) = link.peripheral.disconnect().await {
            if let Some(watcher) = link.watcher.take() {
                watcher.abort();
            }
            return Err(e.into());
        }
        // A live watcher reports the drop when the adapter event arrives.
        if !watcher_running(link.watcher.as_ref()) {
            if let Some(report) = &link.report {
                if report.fire() {
                    debug!("No disconnect watcher for {}; reported drop directly", device.id);
                }
            }
        }
        Ok(())
    }
}
