//! The capability boundary between the session and a wireless stack.
//!
//! [`crate::session::DeviceSession`] only ever talks to a [`Transport`]. The
//! crate ships [`crate::btle::BtleTransport`] for real hardware; tests drive
//! the session with a fake that replays recorded frames.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::TransportError;

/// Called with the raw bytes of each characteristic notification.
pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Called once when the transport observes the device link drop, whether the
/// drop was requested or not.
pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Which devices [`Transport::request_device`] may return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFilter {
    /// Accept devices advertising any of these services.
    pub services: Vec<Uuid>,
    /// Also accept devices whose advertised name starts with this prefix.
    pub name_prefix: Option<String>,
}

impl ServiceFilter {
    pub fn matches(&self, advertised: &[Uuid], name: Option<&str>) -> bool {
        let by_service = advertised.iter().any(|u| self.services.contains(u));
        let by_name = match (&self.name_prefix, name) {
            (Some(prefix), Some(name)) => name.starts_with(prefix.as_str()),
            _ => false,
        };
        by_service || by_name
    }
}

/// A device returned by device selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRef {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattServerRef {
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    pub device_id: String,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicRef {
    pub device_id: String,
    pub service: Uuid,
    pub uuid: Uuid,
}

/// Platform wireless primitives needed by the session.
///
/// Implementations must deliver notifications for one characteristic in
/// arrival order. Any timeout should surface as
/// [`TransportError::Timeout`]; the session does not impose its own.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Whether the platform has a usable wireless adapter at all.
    fn is_supported(&self) -> bool;

    /// Select one device matching `filter`. Fails with
    /// [`TransportError::NoDeviceSelected`] if selection is cancelled.
    async fn request_device(&self, filter: &ServiceFilter) -> Result<DeviceRef, TransportError>;

    async fn connect_gatt(&self, device: &DeviceRef) -> Result<GattServerRef, TransportError>;

    async fn get_primary_service(
        &self,
        server: &GattServerRef,
        service: Uuid,
    ) -> Result<ServiceRef, TransportError>;

    async fn get_characteristic(
        &self,
        service: &ServiceRef,
        characteristic: Uuid,
    ) -> Result<CharacteristicRef, TransportError>;

    /// Enable notifications and route every value change to `on_value_changed`.
    async fn subscribe_notifications(
        &self,
        characteristic: &CharacteristicRef,
        on_value_changed: NotificationHandler,
    ) -> Result<(), TransportError>;

    /// Write with response; resolves once the device acknowledged.
    async fn write_value(
        &self,
        characteristic: &CharacteristicRef,
        value: &[u8],
    ) -> Result<(), TransportError>;

    /// Register `callback` for the next link drop of `device`.
    fn on_disconnected(&self, device: &DeviceRef, callback: DisconnectHandler);

    /// Request link teardown. The drop is reported through the
    /// [`Transport::on_disconnected`] callback.
    async fn disconnect(&self, device: &DeviceRef) -> Result<(), TransportError>;
}
