//! BLE Scanner Module
//!
//! Watches advertisements for the requested device: by address when one is
//! given, otherwise by local name prefix.

use crate::infrastructure::bluetooth::backend::{format_address, DeviceRequest};
use tokio::sync::mpsc;
use tracing::info;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Foundation::TypedEventHandler;

#[derive(Debug, Clone)]
pub struct ScannedDevice {
    pub name: String,
    pub address: u64,
    pub signal_strength: i16,
}

/// Advertisement watcher, stopped on drop
pub struct BleScanner {
    watcher: Option<BluetoothLEAdvertisementWatcher>,
}

impl BleScanner {
    pub fn new() -> Self {
        Self { watcher: None }
    }

    /// Report every advertisement the request accepts
    pub fn start(
        &mut self,
        request: &DeviceRequest,
        sender: mpsc::UnboundedSender<ScannedDevice>,
    ) -> windows::core::Result<()> {
        // Stop any existing scan
        self.stop()?;

        info!("Starting BLE scan for {}", request.target());

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        // Active scanning so scan responses carrying the name are received
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let request = request.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    let address = args.BluetoothAddress()?;
                    let address_text = format_address(address);
                    let advertised = (!name.is_empty()).then_some(name.as_str());
                    if request.accepts(advertised, &address_text) {
                        let device = ScannedDevice {
                            name: advertised.map(str::to_string).unwrap_or(address_text),
                            address,
                            signal_strength: args.RawSignalStrengthInDBm()?,
                        };
                        let _ = sender.send(device);
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&handler)?;
        watcher.Start()?;
        self.watcher = Some(watcher);

        Ok(())
    }

    pub fn stop(&mut self) -> windows::core::Result<()> {
        if let Some(watcher) = self.watcher.take() {
            info!("Stopping BLE scan");
            watcher.Stop()?;
        }
        Ok(())
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
