//! In-process micro:bit
//!
//! Implements the backend traits without a radio. Used by the tests and by
//! `--simulate` on machines without a micro:bit nearby. Failures the real
//! device is known for can be scripted: missing services, rejected or
//! oversized writes, and link loss in the middle of service activation.

use crate::infrastructure::bluetooth::backend::{
    BleBackend, BleError, CharacteristicProperties, DeviceRequest, DisconnectHandler, GattCharacteristic,
    GattLink, GattService, NotificationHandler,
};
use crate::infrastructure::bluetooth::protocol::{self, uuids, Access};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Largest value accepted in one write with the default ATT MTU
pub const DEFAULT_MAX_WRITE_LEN: usize = 20;

/// Address a simulated device reports unless told otherwise
pub const DEFAULT_ADDRESS: &str = "D4:5C:0F:1A:2B:3C";

struct DeviceState {
    connected: bool,
    missing_services: HashSet<Uuid>,
    missing_characteristics: HashSet<Uuid>,
    drop_link_on_open: Option<Uuid>,
    reject_writes: bool,
    max_write_len: usize,
    swapped_uart_roles: bool,
    echo_uart: bool,
    opened_services: Vec<Uuid>,
    writes: Vec<(Uuid, Vec<u8>)>,
    subscriptions: HashMap<Uuid, NotificationHandler>,
    disconnect_handler: Option<Arc<dyn Fn() + Send + Sync>>,
}

pub struct SimulatedMicrobit {
    name: String,
    address: String,
    state: Mutex<DeviceState>,
}

impl SimulatedMicrobit {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            address: DEFAULT_ADDRESS.to_string(),
            state: Mutex::new(DeviceState {
                connected: false,
                missing_services: HashSet::new(),
                missing_characteristics: HashSet::new(),
                drop_link_on_open: None,
                reject_writes: false,
                max_write_len: DEFAULT_MAX_WRITE_LEN,
                swapped_uart_roles: false,
                echo_uart: false,
                opened_services: Vec::new(),
                writes: Vec::new(),
                subscriptions: HashMap::new(),
                disconnect_handler: None,
            }),
        }
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.address = address.to_string();
        self
    }

    /// The MakeCode program did not enable this service
    pub fn without_service(self, uuid: Uuid) -> Self {
        self.lock().missing_services.insert(uuid);
        self
    }

    pub fn without_characteristic(self, uuid: Uuid) -> Self {
        self.lock().missing_characteristics.insert(uuid);
        self
    }

    /// Drop the link while the given service is being opened
    pub fn dropping_link_on(self, service: Uuid) -> Self {
        self.lock().drop_link_on_open = Some(service);
        self
    }

    pub fn rejecting_writes(self) -> Self {
        self.lock().reject_writes = true;
        self
    }

    /// Report the UART characteristics with the roles the firmware actually
    /// uses: 6e400002 indicates and 6e400003 accepts writes.
    pub fn with_swapped_uart_roles(self) -> Self {
        self.lock().swapped_uart_roles = true;
        self
    }

    /// Send every UART line back, like the usual MakeCode echo program
    pub fn echoing_uart(self) -> Self {
        self.lock().echo_uart = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn opened_services(&self) -> Vec<Uuid> {
        self.lock().opened_services.clone()
    }

    pub fn writes_to(&self, uuid: Uuid) -> Vec<Vec<u8>> {
        self.lock()
            .writes
            .iter()
            .filter(|(target, _)| *target == uuid)
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub fn is_subscribed(&self, uuid: Uuid) -> bool {
        self.lock().subscriptions.contains_key(&uuid)
    }

    /// Push a value to a subscribed characteristic. Returns false when nobody
    /// is subscribed.
    pub fn notify(&self, uuid: Uuid, value: &[u8]) -> bool {
        let handler = self.lock().subscriptions.get(&uuid).cloned();
        match handler {
            Some(handler) => {
                handler(value);
                true
            }
            None => false,
        }
    }

    /// Lose the link as if the device went out of range
    pub fn drop_link(&self) {
        let handler = {
            let mut state = self.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.subscriptions.clear();
            state.disconnect_handler.clone()
        };
        info!("Simulated micro:bit '{}' dropped the link", self.name);
        if let Some(handler) = handler {
            handler();
        }
    }

    /// UUID the device pushes UART text on
    pub fn uart_notify_uuid(&self) -> Uuid {
        if self.lock().swapped_uart_roles {
            uuids::UART_RX
        } else {
            uuids::UART_TX
        }
    }

    /// Generate plausible sensor traffic until the link drops
    pub fn spawn_sensor_feed(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let device = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut tick: u32 = 0;
            loop {
                ticker.tick().await;
                if !device.is_connected() {
                    debug!("Sensor feed stopped");
                    break;
                }
                let phase = (tick % 360) as i16;
                let accel = [
                    (phase * 2).to_le_bytes(),
                    (-phase).to_le_bytes(),
                    1024i16.to_le_bytes(),
                ]
                .concat();
                device.notify(uuids::ACCELEROMETER_DATA, &accel);
                device.notify(uuids::MAGNETOMETER_BEARING, &(phase as u16).to_le_bytes());
                if tick % 5 == 0 {
                    let celsius = 20 + (tick / 5 % 4) as i8;
                    device.notify(uuids::TEMPERATURE_DATA, &celsius.to_le_bytes());
                }
                if tick % 7 == 0 {
                    device.notify(uuids::BUTTON_A, &[(tick / 7 % 2) as u8]);
                }
                tick = tick.wrapping_add(1);
            }
        })
    }

    fn connect(&self) {
        let mut state = self.lock();
        state.connected = true;
        state.opened_services.clear();
    }

    fn properties_of(&self, uuid: Uuid) -> CharacteristicProperties {
        let swapped = self.lock().swapped_uart_roles;
        let access = match protocol::characteristic_spec(uuid) {
            Some((_, spec)) => spec.access,
            None => return CharacteristicProperties::default(),
        };
        let access = if swapped && uuid == uuids::UART_RX {
            Access::Notify
        } else if swapped && uuid == uuids::UART_TX {
            Access::Write
        } else {
            access
        };
        match access {
            Access::Notify => CharacteristicProperties {
                notify: true,
                indicate: uuid == uuids::UART_TX || uuid == uuids::UART_RX,
                ..Default::default()
            },
            Access::Write => CharacteristicProperties {
                write: true,
                write_without_response: uuid == uuids::UART_TX || uuid == uuids::UART_RX,
                ..Default::default()
            },
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Picker that always offers the one simulated device
pub struct SimulatedBackend {
    device: Arc<SimulatedMicrobit>,
    cancel_picker: AtomicBool,
    link_fails: AtomicBool,
}

impl SimulatedBackend {
    pub fn new(device: Arc<SimulatedMicrobit>) -> Self {
        Self {
            device,
            cancel_picker: AtomicBool::new(false),
            link_fails: AtomicBool::new(false),
        }
    }

    /// The user dismisses the device picker
    pub fn cancel_picker(&self, cancel: bool) {
        self.cancel_picker.store(cancel, Ordering::SeqCst);
    }

    /// The GATT connect completes but the link never reports connected
    pub fn fail_link(&self, fail: bool) {
        self.link_fails.store(fail, Ordering::SeqCst);
    }

    pub fn device(&self) -> &Arc<SimulatedMicrobit> {
        &self.device
    }
}

#[async_trait]
impl BleBackend for SimulatedBackend {
    async fn request_device(&self, request: &DeviceRequest) -> Result<Arc<dyn GattLink>, BleError> {
        if self.cancel_picker.load(Ordering::SeqCst)
            || !request.accepts(Some(self.device.name()), self.device.address())
        {
            return Err(BleError::NoDeviceSelected);
        }
        if !self.link_fails.load(Ordering::SeqCst) {
            self.device.connect();
        }
        Ok(Arc::new(SimulatedLink {
            device: self.device.clone(),
        }))
    }
}

struct SimulatedLink {
    device: Arc<SimulatedMicrobit>,
}

#[async_trait]
impl GattLink for SimulatedLink {
    fn device_name(&self) -> String {
        self.device.name.clone()
    }

    fn is_connected(&self) -> bool {
        self.device.is_connected()
    }

    async fn open_service(&self, uuid: Uuid) -> Result<Arc<dyn GattService>, BleError> {
        let drop_now = {
            let mut state = self.device.lock();
            if !state.connected {
                return Err(BleError::NotConnected);
            }
            state.opened_services.push(uuid);
            state.drop_link_on_open == Some(uuid)
        };
        if drop_now {
            self.device.drop_link();
            return Err(BleError::NotConnected);
        }
        if self.device.lock().missing_services.contains(&uuid) {
            return Err(BleError::ServiceNotFound(uuid));
        }
        Ok(Arc::new(SimulatedService {
            device: self.device.clone(),
            uuid,
        }))
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.device.drop_link();
        Ok(())
    }

    fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        self.device.lock().disconnect_handler = Some(Arc::from(handler));
    }
}

struct SimulatedService {
    device: Arc<SimulatedMicrobit>,
    uuid: Uuid,
}

#[async_trait]
impl GattService for SimulatedService {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn characteristic(&self, uuid: Uuid) -> Result<Arc<dyn GattCharacteristic>, BleError> {
        let belongs = protocol::characteristic_spec(uuid)
            .map(|(service, _)| service.uuid == self.uuid)
            .unwrap_or(false);
        let state = self.device.lock();
        if !state.connected {
            return Err(BleError::NotConnected);
        }
        if !belongs || state.missing_characteristics.contains(&uuid) {
            return Err(BleError::CharacteristicNotFound(uuid));
        }
        Ok(Arc::new(SimulatedCharacteristic {
            device: self.device.clone(),
            uuid,
        }))
    }
}

struct SimulatedCharacteristic {
    device: Arc<SimulatedMicrobit>,
    uuid: Uuid,
}

#[async_trait]
impl GattCharacteristic for SimulatedCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn properties(&self) -> Option<CharacteristicProperties> {
        Some(self.device.properties_of(self.uuid))
    }

    async fn write(&self, value: &[u8]) -> Result<(), BleError> {
        if !self.device.properties_of(self.uuid).accepts_writes() {
            return Err(BleError::Gatt(format!("{} is not writable", self.uuid)));
        }
        let echo = {
            let mut state = self.device.lock();
            if !state.connected {
                return Err(BleError::NotConnected);
            }
            if state.reject_writes {
                return Err(BleError::Gatt("write rejected by device".to_string()));
            }
            if value.len() > state.max_write_len {
                return Err(BleError::Gatt(format!(
                    "value of {} bytes exceeds the {} byte limit",
                    value.len(),
                    state.max_write_len
                )));
            }
            state.writes.push((self.uuid, value.to_vec()));
            state.echo_uart && (self.uuid == uuids::UART_TX || self.uuid == uuids::UART_RX)
        };
        if echo {
            let target = self.device.uart_notify_uuid();
            self.device.notify(target, value);
        }
        Ok(())
    }

    async fn subscribe(&self, handler: NotificationHandler) -> Result<(), BleError> {
        if !self.device.properties_of(self.uuid).pushes_values() {
            return Err(BleError::Gatt(format!("{} does not notify", self.uuid)));
        }
        let mut state = self.device.lock();
        if !state.connected {
            return Err(BleError::NotConnected);
        }
        state.subscriptions.insert(self.uuid, handler);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prefix: &str) -> DeviceRequest {
        DeviceRequest {
            name_prefix: prefix.to_string(),
            address: None,
            optional_services: protocol::service_uuids(),
            scan_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_picker_filters_by_prefix() {
        let backend = SimulatedBackend::new(Arc::new(SimulatedMicrobit::new("BBC micro:bit [tapug]")));
        assert!(matches!(
            backend.request_device(&request("Calliope")).await,
            Err(BleError::NoDeviceSelected)
        ));
        let link = backend.request_device(&request("BBC micro:bit")).await.unwrap();
        assert!(link.is_connected());
    }

    #[tokio::test]
    async fn test_picker_prefers_address() {
        let device = SimulatedMicrobit::new("BBC micro:bit [tapug]").with_address("E1:02:03:04:05:06");
        let backend = SimulatedBackend::new(Arc::new(device));

        let mut wanted = request("Calliope");
        wanted.address = Some("e1:02:03:04:05:06".to_string());
        assert!(backend.request_device(&wanted).await.is_ok());

        let mut other = request("BBC micro:bit");
        other.address = Some(DEFAULT_ADDRESS.to_string());
        assert!(matches!(
            backend.request_device(&other).await,
            Err(BleError::NoDeviceSelected)
        ));
    }

    #[tokio::test]
    async fn test_write_limit_and_disconnect_handler() {
        let device = Arc::new(SimulatedMicrobit::new("BBC micro:bit"));
        let backend = SimulatedBackend::new(device.clone());
        let link = backend.request_device(&request("BBC")).await.unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        link.set_disconnect_handler(Box::new(move || fired_clone.store(true, Ordering::SeqCst)));

        let led = link
            .open_service(uuids::LED_SERVICE)
            .await
            .unwrap()
            .characteristic(uuids::LED_TEXT)
            .await
            .unwrap();
        assert!(led.write(&[b'x'; 21]).await.is_err());
        led.write(b"ok").await.unwrap();
        assert_eq!(device.writes_to(uuids::LED_TEXT), vec![b"ok".to_vec()]);

        link.disconnect().await.unwrap();
        assert!(fired.load(Ordering::SeqCst));
        assert!(matches!(led.write(b"late").await, Err(BleError::NotConnected)));
    }

    #[tokio::test]
    async fn test_swapped_uart_properties() {
        let device = Arc::new(SimulatedMicrobit::new("BBC micro:bit").with_swapped_uart_roles());
        assert!(device.properties_of(uuids::UART_RX).pushes_values());
        assert!(device.properties_of(uuids::UART_TX).accepts_writes());
        assert_eq!(device.uart_notify_uuid(), uuids::UART_RX);
    }
}
