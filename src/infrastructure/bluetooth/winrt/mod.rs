//! WinRT backend
//!
//! Device picking is an advertisement scan: the first micro:bit with the
//! requested address, or whose name matches the prefix, within the scan
//! timeout is selected.

pub mod connection;
pub mod scanner;

use crate::infrastructure::bluetooth::backend::{BleBackend, BleError, DeviceRequest, GattLink};
use async_trait::async_trait;
use connection::WinRtLink;
use scanner::BleScanner;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Default)]
pub struct WinRtBackend;

impl WinRtBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BleBackend for WinRtBackend {
    async fn request_device(&self, request: &DeviceRequest) -> Result<Arc<dyn GattLink>, BleError> {
        debug!(
            "Optional services: {:?}",
            request.optional_services
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let found = {
            let mut scanner = BleScanner::new();
            scanner
                .start(request, tx)
                .map_err(|e| BleError::Platform(e.message().to_string()))?;
            let found = tokio::time::timeout(request.scan_timeout, rx.recv()).await;
            let _ = scanner.stop();
            found
        };

        let device = match found {
            Ok(Some(device)) => device,
            _ => {
                info!(
                    "No device {} found within {:?}",
                    request.target(),
                    request.scan_timeout
                );
                return Err(BleError::NoDeviceSelected);
            }
        };

        info!(
            "Selected {} ({:#X}, {} dBm)",
            device.name, device.address, device.signal_strength
        );
        let link = WinRtLink::open(device.address, &device.name).await?;
        Ok(Arc::new(link))
    }
}
