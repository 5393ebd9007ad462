//! Handles of the services opened on the current link.

use crate::infrastructure::bluetooth::backend::{GattCharacteristic, GattService};
use crate::infrastructure::bluetooth::protocol::{Channel, ServiceKind};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// A writable characteristic. Writes on one characteristic never overlap.
#[derive(Clone)]
pub struct WriteChannel {
    characteristic: Arc<dyn GattCharacteristic>,
    in_flight: Arc<Mutex<()>>,
}

impl WriteChannel {
    pub fn new(characteristic: Arc<dyn GattCharacteristic>) -> Self {
        Self {
            characteristic,
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    pub async fn write(
        &self,
        value: &[u8],
    ) -> Result<(), crate::infrastructure::bluetooth::backend::BleError> {
        let _guard = self.in_flight.lock().await;
        self.characteristic.write(value).await
    }
}

pub struct ActiveService {
    pub service: Arc<dyn GattService>,
    pub writers: HashMap<Channel, WriteChannel>,
    /// Notify channels that subscribed successfully
    pub subscribed: Vec<Channel>,
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: BTreeMap<ServiceKind, ActiveService>,
}

impl ServiceRegistry {
    pub fn insert(&mut self, kind: ServiceKind, service: ActiveService) -> bool {
        self.services.insert(kind, service).is_none()
    }

    pub fn contains(&self, kind: ServiceKind) -> bool {
        self.services.contains_key(&kind)
    }

    pub fn writer(&self, kind: ServiceKind, channel: Channel) -> Option<WriteChannel> {
        self.services
            .get(&kind)
            .and_then(|service| service.writers.get(&channel))
            .cloned()
    }

    pub fn started(&self) -> Vec<ServiceKind> {
        self.services.keys().copied().collect()
    }

    /// Drop every handle opened on the link
    pub fn clear(&mut self) {
        for (kind, active) in std::mem::take(&mut self.services) {
            debug!("Released {} ({})", kind, active.service.uuid());
        }
    }
}
