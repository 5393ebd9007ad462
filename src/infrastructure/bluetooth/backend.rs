//! Host BLE stack abstraction
//!
//! The session only talks to these traits. Each platform backend maps them
//! onto its own GATT API; the simulated backend implements them in memory.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BleError {
    #[error("no device was selected")]
    NoDeviceSelected,
    #[error("link is not connected")]
    NotConnected,
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("GATT operation failed: {0}")]
    Gatt(String),
    #[error("no Bluetooth adapter available")]
    NoAdapter,
    #[error("{0}")]
    Platform(String),
}

/// What the host asks the platform to discover
#[derive(Debug, Clone)]
pub struct DeviceRequest {
    pub name_prefix: String,
    /// When set, only the device with this address is picked, whatever its name
    pub address: Option<String>,
    /// Services the platform must expose after connecting
    pub optional_services: Vec<Uuid>,
    pub scan_timeout: Duration,
}

impl DeviceRequest {
    pub fn matches(&self, advertised_name: &str) -> bool {
        advertised_name.starts_with(&self.name_prefix)
    }

    /// Decide on one advertisement. A requested address takes precedence
    /// over the name prefix; devices that advertise no name only match by
    /// address.
    pub fn accepts(&self, advertised_name: Option<&str>, address: &str) -> bool {
        match &self.address {
            Some(wanted) => same_address(wanted, address),
            None => advertised_name.is_some_and(|name| self.matches(name)),
        }
    }

    /// What the log should say is being looked for
    pub fn target(&self) -> String {
        match &self.address {
            Some(address) => address.clone(),
            None => format!("'{}*'", self.name_prefix),
        }
    }
}

/// Compare two addresses ignoring case and separators, so `aa-bb-..`,
/// `AA:BB:..` and `aabb..` are the same device
pub fn same_address(a: &str, b: &str) -> bool {
    let digits = |s: &str| -> Vec<char> {
        s.chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect()
    };
    let a = digits(a);
    !a.is_empty() && a == digits(b)
}

/// Render a 48-bit Bluetooth address as `AA:BB:CC:DD:EE:FF`
pub fn format_address(raw: u64) -> String {
    let bytes = raw.to_be_bytes();
    bytes[2..]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    pub fn pushes_values(&self) -> bool {
        self.notify || self.indicate
    }

    pub fn accepts_writes(&self) -> bool {
        self.write || self.write_without_response
    }
}

pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type DisconnectHandler = Box<dyn Fn() + Send + Sync>;

#[async_trait]
pub trait BleBackend: Send + Sync {
    /// Pick a device matching the request and open a GATT link to it
    async fn request_device(&self, request: &DeviceRequest) -> Result<Arc<dyn GattLink>, BleError>;
}

#[async_trait]
pub trait GattLink: Send + Sync {
    fn device_name(&self) -> String;

    fn is_connected(&self) -> bool;

    async fn open_service(&self, uuid: Uuid) -> Result<Arc<dyn GattService>, BleError>;

    async fn disconnect(&self) -> Result<(), BleError>;

    /// Called once per link loss, explicit or not
    fn set_disconnect_handler(&self, handler: DisconnectHandler);
}

#[async_trait]
pub trait GattService: Send + Sync {
    fn uuid(&self) -> Uuid;

    async fn characteristic(&self, uuid: Uuid)
        -> Result<Arc<dyn GattCharacteristic>, BleError>;
}

#[async_trait]
pub trait GattCharacteristic: Send + Sync {
    fn uuid(&self) -> Uuid;

    /// None when the platform does not report properties
    fn properties(&self) -> Option<CharacteristicProperties>;

    async fn write(&self, value: &[u8]) -> Result<(), BleError>;

    /// Enable notifications; the handler only sees values after this resolves
    async fn subscribe(&self, handler: NotificationHandler) -> Result<(), BleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(address: Option<&str>) -> DeviceRequest {
        DeviceRequest {
            name_prefix: "BBC micro:bit".to_string(),
            address: address.map(str::to_string),
            optional_services: Vec::new(),
            scan_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_name_prefix_without_address() {
        let request = request(None);
        assert!(request.accepts(Some("BBC micro:bit [tapug]"), "D4:5C:0F:1A:2B:3C"));
        assert!(!request.accepts(Some("Calliope mini"), "D4:5C:0F:1A:2B:3C"));
        assert!(!request.accepts(None, "D4:5C:0F:1A:2B:3C"));
    }

    #[test]
    fn test_address_wins_over_name() {
        let request = request(Some("d4-5c-0f-1a-2b-3c"));
        assert!(request.accepts(Some("Calliope mini"), "D4:5C:0F:1A:2B:3C"));
        assert!(request.accepts(None, "D45C0F1A2B3C"));
        assert!(!request.accepts(Some("BBC micro:bit [tapug]"), "D4:5C:0F:1A:2B:3D"));
    }

    #[test]
    fn test_format_address() {
        assert_eq!(format_address(0xD45C_0F1A_2B3C), "D4:5C:0F:1A:2B:3C");
        assert_eq!(format_address(0x01), "00:00:00:00:00:01");
        assert!(!same_address("", ""));
    }
}
