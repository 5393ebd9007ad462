//! Cross-platform backend on btleplug (BlueZ, CoreBluetooth, WinRT).
//!
//! One notification stream per peripheral is routed to handlers by
//! characteristic UUID.

use crate::infrastructure::bluetooth::backend::{
    BleBackend, BleError, CharacteristicProperties, DeviceRequest, DisconnectHandler,
    GattCharacteristic, GattLink, GattService, NotificationHandler,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, Service, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type Routes = Arc<Mutex<HashMap<Uuid, NotificationHandler>>>;
type SharedHandler = Arc<Mutex<Option<Arc<dyn Fn() + Send + Sync>>>>;

impl From<btleplug::Error> for BleError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::NotConnected => BleError::NotConnected,
            other => BleError::Platform(other.to_string()),
        }
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
pub struct BtleplugBackend;

impl BtleplugBackend {
    pub fn new() -> Self {
        Self
    }

    async fn adapter() -> Result<Adapter, BleError> {
        let manager = Manager::new().await?;
        manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BleError::NoAdapter)
    }

    /// Poll discovered peripherals until one has the requested address or
    /// advertises a matching name
    async fn find_device(
        adapter: &Adapter,
        request: &DeviceRequest,
    ) -> Result<Option<(Peripheral, String)>, BleError> {
        let start = Instant::now();

        while start.elapsed() < request.scan_timeout {
            for peripheral in adapter.peripherals().await? {
                if let Some(props) = peripheral.properties().await? {
                    let address = props.address.to_string();
                    let local_name = props.local_name.as_deref();
                    // CoreBluetooth hides the address and exposes a UUID instead
                    let accepted = request.accepts(local_name, &address)
                        || request.accepts(local_name, &peripheral.id().to_string());
                    if accepted {
                        let name = local_name.map(str::to_string).unwrap_or(address);
                        return Ok(Some((peripheral, name)));
                    }
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }

        Ok(None)
    }
}

#[async_trait]
impl BleBackend for BtleplugBackend {
    async fn request_device(&self, request: &DeviceRequest) -> Result<Arc<dyn GattLink>, BleError> {
        let adapter = Self::adapter().await?;

        info!("Scanning for {}", request.target());
        adapter.start_scan(ScanFilter::default()).await?;
        let found = Self::find_device(&adapter, request).await;
        if let Err(e) = adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        let Some((peripheral, name)) = found? else {
            return Err(BleError::NoDeviceSelected);
        };

        info!("Connecting to {}", name);
        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let link = BtleplugLink::start(adapter, peripheral, name).await?;
        Ok(Arc::new(link))
    }
}

struct BtleplugLink {
    peripheral: Peripheral,
    name: String,
    connected: Arc<AtomicBool>,
    fired: Arc<AtomicBool>,
    handler: SharedHandler,
    routes: Routes,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugLink {
    async fn start(adapter: Adapter, peripheral: Peripheral, name: String) -> Result<Self, BleError> {
        let connected = Arc::new(AtomicBool::new(true));
        let fired = Arc::new(AtomicBool::new(false));
        let handler: SharedHandler = Arc::new(Mutex::new(None));
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));

        let mut notifications = peripheral.notifications().await?;
        let pump_routes = routes.clone();
        let pump = tokio::spawn(async move {
            while let Some(data) = notifications.next().await {
                let route = pump_routes
                    .lock()
                    .ok()
                    .and_then(|routes| routes.get(&data.uuid).cloned());
                match route {
                    Some(route) => route(&data.value),
                    None => debug!("Unrouted notification from {}", data.uuid),
                }
            }
        });

        let mut events = adapter.events().await?;
        let id = peripheral.id();
        let watch_connected = connected.clone();
        let watch_fired = fired.clone();
        let watch_handler = handler.clone();
        let watcher = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        watch_connected.store(false, Ordering::SeqCst);
                        fire_once(&watch_handler, &watch_fired);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            peripheral,
            name,
            connected,
            fired,
            handler,
            routes,
            tasks: Mutex::new(vec![pump, watcher]),
        })
    }
}

fn fire_once(handler: &SharedHandler, fired: &AtomicBool) {
    if fired.swap(true, Ordering::SeqCst) {
        return;
    }
    let callback = handler.lock().ok().and_then(|slot| slot.clone());
    if let Some(callback) = callback {
        callback();
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    fn device_name(&self) -> String {
        self.name.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn open_service(&self, uuid: Uuid) -> Result<Arc<dyn GattService>, BleError> {
        if !self.is_connected() {
            return Err(BleError::NotConnected);
        }
        let service = self
            .peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == uuid)
            .ok_or(BleError::ServiceNotFound(uuid))?;

        Ok(Arc::new(BtleplugService {
            peripheral: self.peripheral.clone(),
            service,
            routes: self.routes.clone(),
        }))
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        let result = self.peripheral.disconnect().await;
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        fire_once(&self.handler, &self.fired);
        result.map_err(BleError::from)
    }

    fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        if let Ok(mut slot) = self.handler.lock() {
            *slot = Some(Arc::from(handler));
        }
    }
}

struct BtleplugService {
    peripheral: Peripheral,
    service: Service,
    routes: Routes,
}

#[async_trait]
impl GattService for BtleplugService {
    fn uuid(&self) -> Uuid {
        self.service.uuid
    }

    async fn characteristic(&self, uuid: Uuid) -> Result<Arc<dyn GattCharacteristic>, BleError> {
        let characteristic = self
            .service
            .characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or(BleError::CharacteristicNotFound(uuid))?;

        Ok(Arc::new(BtleplugCharacteristic {
            peripheral: self.peripheral.clone(),
            characteristic,
            routes: self.routes.clone(),
        }))
    }
}

struct BtleplugCharacteristic {
    peripheral: Peripheral,
    characteristic: Characteristic,
    routes: Routes,
}

#[async_trait]
impl GattCharacteristic for BtleplugCharacteristic {
    fn uuid(&self) -> Uuid {
        self.characteristic.uuid
    }

    fn properties(&self) -> Option<CharacteristicProperties> {
        let flags = self.characteristic.properties;
        Some(CharacteristicProperties {
            read: flags.contains(CharPropFlags::READ),
            write: flags.contains(CharPropFlags::WRITE),
            write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
            notify: flags.contains(CharPropFlags::NOTIFY),
            indicate: flags.contains(CharPropFlags::INDICATE),
        })
    }

    async fn write(&self, value: &[u8]) -> Result<(), BleError> {
        let flags = self.characteristic.properties;
        let write_type = if !flags.contains(CharPropFlags::WRITE)
            && flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        self.peripheral
            .write(&self.characteristic, value, write_type)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, handler: NotificationHandler) -> Result<(), BleError> {
        self.peripheral.subscribe(&self.characteristic).await?;
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(self.characteristic.uuid, handler);
        }
        Ok(())
    }
}
