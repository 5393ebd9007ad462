//! BLE Connection Module
//!
//! GATT link, service and characteristic handles on top of WinRT.

use crate::infrastructure::bluetooth::backend::{
    BleError, CharacteristicProperties, DisconnectHandler, GattCharacteristic, GattLink,
    GattService, NotificationHandler,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic as WinGattCharacteristic, GattCharacteristicProperties,
    GattClientCharacteristicConfigurationDescriptorValue, GattCommunicationStatus,
    GattDeviceService, GattSession, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};

type SharedHandler = Arc<Mutex<Option<Arc<dyn Fn() + Send + Sync>>>>;

pub fn to_guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

fn platform(e: windows::core::Error) -> BleError {
    BleError::Platform(e.message().to_string())
}

fn check(status: GattCommunicationStatus, what: &str) -> Result<(), BleError> {
    if status == GattCommunicationStatus::Success {
        Ok(())
    } else {
        Err(BleError::Gatt(format!("{} returned {:?}", what, status)))
    }
}

pub struct WinRtLink {
    device: BluetoothLEDevice,
    name: String,
    session: Mutex<Option<GattSession>>,
    handler: SharedHandler,
    fired: Arc<AtomicBool>,
    status_token: Mutex<Option<i64>>,
}

impl WinRtLink {
    /// Open the device and keep a GATT session alive for it
    pub async fn open(address: u64, fallback_name: &str) -> Result<Self, BleError> {
        info!("Connecting to Bluetooth device: {:#X}", address);
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)
            .map_err(platform)?
            .await
            .map_err(platform)?;

        let name = device
            .Name()
            .map(|n| n.to_string())
            .ok()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| fallback_name.to_string());

        // Without a maintained session Windows drops idle links quickly
        let session = match Self::create_gatt_session(&device).await {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Failed to create GattSession, continuing anyway: {}", e);
                None
            }
        };

        // WinRT connects lazily; an uncached service query brings the link up
        let services = device
            .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)
            .map_err(platform)?
            .await
            .map_err(platform)?;
        check(services.Status().map_err(platform)?, "service discovery")?;

        let link = Self {
            device,
            name,
            session: Mutex::new(session),
            handler: Arc::new(Mutex::new(None)),
            fired: Arc::new(AtomicBool::new(false)),
            status_token: Mutex::new(None),
        };
        link.watch_status()?;
        Ok(link)
    }

    async fn create_gatt_session(device: &BluetoothLEDevice) -> windows::core::Result<GattSession> {
        let device_id = device.BluetoothDeviceId()?;
        let session = GattSession::FromDeviceIdAsync(&device_id)?.await?;
        session.SetMaintainConnection(true)?;
        Ok(session)
    }

    fn watch_status(&self) -> Result<(), BleError> {
        let handler = self.handler.clone();
        let fired = self.fired.clone();
        let status_handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        fire_once(&handler, &fired);
                    }
                }
                Ok(())
            });
        let token = self
            .device
            .ConnectionStatusChanged(&status_handler)
            .map_err(platform)?;
        if let Ok(mut slot) = self.status_token.lock() {
            *slot = Some(token);
        }
        Ok(())
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
impl GattLink for WinRtLink {
    fn device_name(&self) -> String {
        self.name.clone()
    }

    fn is_connected(&self) -> bool {
        self.device
            .ConnectionStatus()
            .map(|s| s == BluetoothConnectionStatus::Connected)
            .unwrap_or(false)
    }

    async fn open_service(&self, uuid: Uuid) -> Result<Arc<dyn GattService>, BleError> {
        let result = self
            .device
            .GetGattServicesForUuidAsync(to_guid(uuid))
            .map_err(platform)?
            .await
            .map_err(platform)?;
        if result.Status().map_err(platform)? != GattCommunicationStatus::Success {
            if !self.is_connected() {
                return Err(BleError::NotConnected);
            }
            return Err(BleError::ServiceNotFound(uuid));
        }

        let services = result.Services().map_err(platform)?;
        if services.Size().map_err(platform)? == 0 {
            return Err(BleError::ServiceNotFound(uuid));
        }
        let service = services.GetAt(0).map_err(platform)?;
        debug!("Found service {}", uuid);

        Ok(Arc::new(WinRtService { service, uuid }))
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        if let Some(token) = self.status_token.lock().ok().and_then(|mut t| t.take()) {
            let _ = self.device.RemoveConnectionStatusChanged(token);
        }
        if let Some(session) = self.session.lock().ok().and_then(|mut s| s.take()) {
            let _ = session.Close();
        }
        self.device.Close().map_err(platform)?;
        // Closing the device does not raise ConnectionStatusChanged
        fire_once(&self.handler, &self.fired);
        Ok(())
    }

    fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        if let Ok(mut slot) = self.handler.lock() {
            *slot = Some(Arc::from(handler));
        }
    }
}

struct WinRtService {
    service: GattDeviceService,
    uuid: Uuid,
}

#[async_trait]
impl GattService for WinRtService {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn characteristic(&self, uuid: Uuid) -> Result<Arc<dyn GattCharacteristic>, BleError> {
        let result = self
            .service
            .GetCharacteristicsForUuidAsync(to_guid(uuid))
            .map_err(platform)?
            .await
            .map_err(platform)?;
        check(result.Status().map_err(platform)?, "characteristic discovery")?;

        let characteristics = result.Characteristics().map_err(platform)?;
        if characteristics.Size().map_err(platform)? == 0 {
            return Err(BleError::CharacteristicNotFound(uuid));
        }
        let characteristic = characteristics.GetAt(0).map_err(platform)?;

        Ok(Arc::new(WinRtCharacteristic {
            characteristic,
            uuid,
            token: Mutex::new(None),
        }))
    }
}

struct WinRtCharacteristic {
    characteristic: WinGattCharacteristic,
    uuid: Uuid,
    token: Mutex<Option<i64>>,
}

fn has(props: GattCharacteristicProperties, flag: GattCharacteristicProperties) -> bool {
    props.0 & flag.0 != 0
}

#[async_trait]
impl GattCharacteristic for WinRtCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn properties(&self) -> Option<CharacteristicProperties> {
        let props = self.characteristic.CharacteristicProperties().ok()?;
        Some(CharacteristicProperties {
            read: has(props, GattCharacteristicProperties::Read),
            write: has(props, GattCharacteristicProperties::Write),
            write_without_response: has(props, GattCharacteristicProperties::WriteWithoutResponse),
            notify: has(props, GattCharacteristicProperties::Notify),
            indicate: has(props, GattCharacteristicProperties::Indicate),
        })
    }

    async fn write(&self, value: &[u8]) -> Result<(), BleError> {
        let buffer = {
            let writer = DataWriter::new().map_err(platform)?;
            writer.WriteBytes(value).map_err(platform)?;
            writer.DetachBuffer().map_err(platform)?
        };

        let option = match self.properties() {
            Some(props) if !props.write && props.write_without_response => {
                GattWriteOption::WriteWithoutResponse
            }
            _ => GattWriteOption::WriteWithResponse,
        };

        let status = self
            .characteristic
            .WriteValueWithOptionAsync(&buffer, option)
            .map_err(platform)?
            .await
            .map_err(platform)?;
        check(status, "write")
    }

    async fn subscribe(&self, handler: NotificationHandler) -> Result<(), BleError> {
        let value_handler = TypedEventHandler::new(
            move |_: windows::core::Ref<WinGattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let buffer = args.CharacteristicValue()?;
                    let reader = DataReader::FromBuffer(&buffer)?;
                    let length = reader.UnconsumedBufferLength()? as usize;
                    let mut bytes = vec![0u8; length];
                    reader.ReadBytes(&mut bytes)?;
                    handler(&bytes);
                }
                Ok(())
            },
        );
        let token = self
            .characteristic
            .ValueChanged(&value_handler)
            .map_err(platform)?;
        if let Ok(mut slot) = self.token.lock() {
            *slot = Some(token);
        }

        // The UART characteristic indicates, the sensors notify
        let cccd = match self.properties() {
            Some(props) if !props.notify && props.indicate => {
                GattClientCharacteristicConfigurationDescriptorValue::Indicate
            }
            _ => GattClientCharacteristicConfigurationDescriptorValue::Notify,
        };
        let status = self
            .characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(cccd)
            .map_err(platform)?
            .await
            .map_err(platform)?;
        check(status, "notification subscription")
    }
}

impl Drop for WinRtCharacteristic {
    fn drop(&mut self) {
        if let Some(token) = self.token.lock().ok().and_then(|mut t| t.take()) {
            let _ = self.characteristic.RemoveValueChanged(token);
        }
    }
}
