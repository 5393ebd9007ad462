//! micro:bit Session
//!
//! Owns one GATT link and everything opened on it: connection state, the
//! service registry and the event bus the decoded notifications go to.
//! Every handle is tied to a link generation; once the link is lost the
//! registry is cleared and callbacks from the dead link are ignored.

use crate::domain::decode;
use crate::domain::events::{Event, EventBus};
use crate::domain::models::ConnectionState;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::backend::{
    BleBackend, BleError, DeviceRequest, GattCharacteristic, GattLink, NotificationHandler,
};
use crate::infrastructure::bluetooth::protocol::{
    self, Access, Channel, CharacteristicSpec, ServiceKind, ServiceSpec, PROFILE,
};
use crate::infrastructure::bluetooth::registry::{ActiveService, ServiceRegistry, WriteChannel};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no micro:bit was selected")]
    DeviceNotSelected,
    #[error("link failure: {0}")]
    LinkFailure(String),
    #[error("service {service} unavailable: {reason}")]
    ServiceUnavailable {
        service: ServiceKind,
        reason: String,
    },
    #[error("write failed: {0}")]
    WriteFailure(String),
    #[error("not connected to a micro:bit")]
    NotConnected,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name_prefix: String,
    /// Pick this device by address instead of by name
    pub address: Option<String>,
    pub scan_timeout: Duration,
    /// Pause between two service activations
    pub service_start_delay: Duration,
    /// Run the service starter right after connecting
    pub auto_start_services: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            name_prefix: settings.name_prefix.clone(),
            address: None,
            scan_timeout: Duration::from_millis(settings.scan_timeout_ms),
            service_start_delay: Duration::from_millis(settings.service_start_delay_ms),
            auto_start_services: settings.auto_start_services,
        }
    }
}

/// Writable text characteristics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextTarget {
    Uart,
    Led,
}

impl TextTarget {
    pub fn service(&self) -> ServiceKind {
        self.channel().service()
    }

    pub fn channel(&self) -> Channel {
        match self {
            Self::Uart => Channel::UartRx,
            Self::Led => Channel::LedText,
        }
    }

    /// UART lines are newline terminated, LED text is sent as is
    pub fn encode(&self, text: &str) -> Vec<u8> {
        let mut payload = text.as_bytes().to_vec();
        if *self == Self::Uart {
            payload.push(b'\n');
        }
        payload
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    pub started: Vec<ServiceKind>,
    pub failed: Vec<(ServiceKind, String)>,
}

struct SessionState {
    connection: ConnectionState,
    link: Option<Arc<dyn GattLink>>,
    device_name: Option<String>,
    registry: ServiceRegistry,
    generation: u64,
}

struct Shared {
    state: Mutex<SessionState>,
    events: Arc<EventBus>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.lock();
        state.generation == generation && state.link.is_some()
    }

    /// Tear down everything tied to a link. Runs at most once per link.
    fn handle_link_lost(&self, generation: u64) {
        let device_name = {
            let mut state = self.lock();
            if state.generation != generation || state.link.is_none() {
                return;
            }
            state.link = None;
            state.registry.clear();
            state.connection = ConnectionState::Disconnected;
            state.device_name.take()
        };

        info!(
            "Link to {} closed, service registry cleared",
            device_name.as_deref().unwrap_or("micro:bit")
        );
        self.events.emit(&Event::Disconnection { device_name });
    }

    fn dispatch(&self, generation: u64, channel: Channel, bytes: &[u8]) {
        if !self.is_current(generation) {
            trace!("Dropping {:?} notification from a closed link", channel);
            return;
        }
        match decode::decode(channel, bytes) {
            Ok(sample) => self.events.emit(&Event::from(sample)),
            Err(e) => {
                warn!("Undecodable {:?} notification {:02X?}: {}", channel, bytes, e);
                self.events.emit(&Event::Error {
                    service: Some(channel.service()),
                    message: format!("could not decode {:?}: {}", channel, e),
                });
            }
        }
    }
}

/// A connection to one micro:bit. Owned by the caller; nothing here is global.
pub struct MicrobitSession {
    backend: Arc<dyn BleBackend>,
    config: SessionConfig,
    shared: Arc<Shared>,
}

impl MicrobitSession {
    pub fn new(backend: Arc<dyn BleBackend>, config: SessionConfig) -> Self {
        Self::with_events(backend, config, Arc::new(EventBus::new()))
    }

    pub fn with_events(
        backend: Arc<dyn BleBackend>,
        config: SessionConfig,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            backend,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState {
                    connection: ConnectionState::Disconnected,
                    link: None,
                    device_name: None,
                    registry: ServiceRegistry::default(),
                    generation: 0,
                }),
                events,
            }),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.shared.events
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.lock().connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn device_name(&self) -> Option<String> {
        self.shared.lock().device_name.clone()
    }

    pub fn started_services(&self) -> Vec<ServiceKind> {
        self.shared.lock().registry.started()
    }

    /// Pick a micro:bit whose name starts with `name_prefix` (or the
    /// configured prefix) and open a GATT link to it.
    pub async fn connect(&self, name_prefix: Option<&str>) -> Result<String, SessionError> {
        if self.shared.lock().link.is_some() {
            info!("Already connected, closing the previous link first");
            self.disconnect().await;
        }

        let busy = {
            let mut state = self.shared.lock();
            let busy = state.connection == ConnectionState::Connecting;
            if !busy {
                state.connection = ConnectionState::Connecting;
            }
            busy
        };
        if busy {
            return Err(self.report(SessionError::LinkFailure(
                "another connection attempt is in progress".to_string(),
            )));
        }

        let request = DeviceRequest {
            name_prefix: name_prefix.unwrap_or(&self.config.name_prefix).to_string(),
            address: self.config.address.clone(),
            optional_services: protocol::service_uuids(),
            scan_timeout: self.config.scan_timeout,
        };
        info!("Requesting device {}", request.target());

        let link = match self.backend.request_device(&request).await {
            Ok(link) => link,
            Err(e) => {
                self.shared.lock().connection = ConnectionState::Disconnected;
                let err = match e {
                    BleError::NoDeviceSelected => SessionError::DeviceNotSelected,
                    other => SessionError::LinkFailure(other.to_string()),
                };
                return Err(self.report(err));
            }
        };

        if !link.is_connected() {
            self.shared.lock().connection = ConnectionState::Disconnected;
            return Err(self.report(SessionError::LinkFailure(format!(
                "{} did not report connected",
                link.device_name()
            ))));
        }

        let device_name = link.device_name();
        let generation = {
            let mut state = self.shared.lock();
            state.generation += 1;
            state.link = Some(link.clone());
            state.registry.clear();
            state.device_name = Some(device_name.clone());
            state.connection = ConnectionState::Connected;
            state.generation
        };

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        link.set_disconnect_handler(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.handle_link_lost(generation);
            }
        }));
        // The link may have dropped before the handler was in place
        if !link.is_connected() {
            self.shared.handle_link_lost(generation);
            return Err(self.report(SessionError::LinkFailure(
                "link dropped while connecting".to_string(),
            )));
        }

        info!("Connected to {}", device_name);
        self.shared.events.emit(&Event::Connection {
            device_name: device_name.clone(),
        });

        if self.config.auto_start_services {
            self.start_services().await?;
        }

        Ok(device_name)
    }

    /// Close the link if one is open
    pub async fn disconnect(&self) {
        let (link, generation) = {
            let state = self.shared.lock();
            match &state.link {
                Some(link) => (link.clone(), state.generation),
                None => return,
            }
        };

        info!("Disconnecting from {}", link.device_name());
        if let Err(e) = link.disconnect().await {
            warn!("Platform disconnect failed: {}", e);
        }
        // No-op when the platform callback already ran
        self.shared.handle_link_lost(generation);
    }

    /// Open every known service in profile order, one at a time.
    ///
    /// Failures of required services are collected and the first one is
    /// returned once all services were attempted. Optional service failures
    /// are only logged.
    pub async fn start_services(&self) -> Result<StartReport, SessionError> {
        let (link, generation) = {
            let state = self.shared.lock();
            match &state.link {
                Some(link) => (link.clone(), state.generation),
                None => return Err(self.report(SessionError::NotConnected)),
            }
        };

        let mut report = StartReport::default();
        let mut first_failure: Option<(ServiceKind, String)> = None;

        for (index, spec) in PROFILE.iter().enumerate() {
            if index > 0 {
                // The firmware runs out of attribute table space when
                // services are activated back to back
                tokio::time::sleep(self.config.service_start_delay).await;
            }

            if !self.shared.is_current(generation) {
                warn!("Link lost while starting {}", spec.kind);
                return Err(self.report(SessionError::NotConnected));
            }

            if self.shared.lock().registry.contains(spec.kind) {
                debug!("Service {} already started", spec.kind);
                report.started.push(spec.kind);
                continue;
            }

            match self.open_service(&link, spec, generation).await {
                Ok(active) => {
                    let subscribed = active.subscribed.len();
                    {
                        let mut state = self.shared.lock();
                        if state.generation != generation || state.link.is_none() {
                            drop(state);
                            warn!("Link lost while starting {}", spec.kind);
                            return Err(self.report(SessionError::NotConnected));
                        }
                        state.registry.insert(spec.kind, active);
                    }
                    info!(
                        "Service {} started ({} notification(s))",
                        spec.kind, subscribed
                    );
                    self.shared
                        .events
                        .emit(&Event::ServiceStarted { service: spec.kind });
                    report.started.push(spec.kind);
                }
                Err(e) => {
                    if !self.shared.is_current(generation) {
                        warn!("Link lost while starting {}: {}", spec.kind, e);
                        return Err(self.report(SessionError::NotConnected));
                    }

                    let reason = e.to_string();
                    self.shared.events.emit(&Event::ServiceFailed {
                        service: spec.kind,
                        reason: reason.clone(),
                    });

                    if spec.required {
                        error!("Failed to start {}: {}", spec.kind, reason);
                        self.shared.events.emit(&Event::Error {
                            service: Some(spec.kind),
                            message: format!("failed to start {}: {}", spec.kind, reason),
                        });
                        first_failure.get_or_insert((spec.kind, reason.clone()));
                    } else {
                        warn!("Optional service {} unavailable: {}", spec.kind, reason);
                    }
                    report.failed.push((spec.kind, reason));
                }
            }
        }

        match first_failure {
            Some((service, reason)) => Err(SessionError::ServiceUnavailable { service, reason }),
            None => Ok(report),
        }
    }

    async fn open_service(
        &self,
        link: &Arc<dyn GattLink>,
        spec: &ServiceSpec,
        generation: u64,
    ) -> Result<ActiveService, BleError> {
        debug!("Opening service {} ({})", spec.kind, spec.uuid);
        let handle = link.open_service(spec.uuid).await?;

        let mut resolved: Vec<(CharacteristicSpec, Arc<dyn GattCharacteristic>)> = Vec::new();
        for characteristic in spec.characteristics {
            match handle.characteristic(characteristic.uuid).await {
                Ok(c) => resolved.push((*characteristic, c)),
                Err(e) if !characteristic.required => {
                    debug!(
                        "Skipping {:?} of {}: {}",
                        characteristic.channel, spec.kind, e
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if spec.kind == ServiceKind::Uart {
            assign_uart_roles(&mut resolved);
        }

        let mut writers = HashMap::new();
        let mut subscribed = Vec::new();
        let mut notify_channels = 0;
        for (characteristic, gatt) in resolved {
            match characteristic.access {
                Access::Write => {
                    writers.insert(characteristic.channel, WriteChannel::new(gatt));
                }
                Access::Notify => {
                    notify_channels += 1;
                    match self.subscribe(&gatt, characteristic.channel, generation).await {
                        Ok(()) => subscribed.push(characteristic.channel),
                        Err(e) if !characteristic.required => {
                            debug!(
                                "Could not subscribe to {:?} of {}: {}",
                                characteristic.channel, spec.kind, e
                            );
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        let expects_notifications = spec
            .characteristics
            .iter()
            .any(|c| c.access == Access::Notify);
        if expects_notifications && subscribed.is_empty() {
            return Err(BleError::Gatt(format!(
                "none of {} notification characteristic(s) could be subscribed",
                notify_channels
            )));
        }

        Ok(ActiveService {
            service: handle,
            writers,
            subscribed,
        })
    }

    async fn subscribe(
        &self,
        characteristic: &Arc<dyn GattCharacteristic>,
        channel: Channel,
        generation: u64,
    ) -> Result<(), BleError> {
        // Values are only decoded once the subscription is confirmed
        let armed = Arc::new(AtomicBool::new(false));
        let handler: NotificationHandler = {
            let armed = armed.clone();
            let weak = Arc::downgrade(&self.shared);
            Arc::new(move |bytes: &[u8]| {
                if !armed.load(Ordering::Acquire) {
                    return;
                }
                if let Some(shared) = weak.upgrade() {
                    shared.dispatch(generation, channel, bytes);
                }
            })
        };

        characteristic.subscribe(handler).await?;
        armed.store(true, Ordering::Release);
        trace!("Subscribed to {:?}", channel);
        Ok(())
    }

    /// Write `text` to the UART or the LED matrix
    pub async fn send_text(&self, target: TextTarget, text: &str) -> Result<(), SessionError> {
        let payload = target.encode(text);
        let writer = self.writer(target.service(), target.channel())?;

        debug!("Writing {} byte(s) to {:?}", payload.len(), target);
        writer
            .write(&payload)
            .await
            .map_err(|e| self.report(write_error(e)))
    }

    /// Change how often a sensor service notifies
    pub async fn set_sample_period(
        &self,
        service: ServiceKind,
        period_ms: u16,
    ) -> Result<(), SessionError> {
        let channel = protocol::period_channel(service).ok_or_else(|| {
            self.report(SessionError::ServiceUnavailable {
                service,
                reason: "service has no period characteristic".to_string(),
            })
        })?;
        let writer = self.writer(service, channel)?;

        debug!("Setting {} period to {} ms", service, period_ms);
        writer
            .write(&protocol::encode_period(period_ms))
            .await
            .map_err(|e| self.report(write_error(e)))
    }

    fn writer(&self, service: ServiceKind, channel: Channel) -> Result<WriteChannel, SessionError> {
        let lookup = {
            let state = self.shared.lock();
            if state.link.is_none() || state.connection != ConnectionState::Connected {
                Err(SessionError::NotConnected)
            } else {
                state
                    .registry
                    .writer(service, channel)
                    .ok_or_else(|| SessionError::ServiceUnavailable {
                        service,
                        reason: if state.registry.contains(service) {
                            format!("{:?} characteristic is missing", channel)
                        } else if !service.spec().required {
                            "optional service is not available on this device".to_string()
                        } else {
                            "service was not started".to_string()
                        },
                    })
            }
        };
        lookup.map_err(|e| self.report(e))
    }

    /// Surface a failure on the event bus before handing it to the caller
    fn report(&self, err: SessionError) -> SessionError {
        let service = match &err {
            SessionError::ServiceUnavailable { service, .. } => Some(*service),
            _ => None,
        };
        self.shared.events.emit(&Event::Error {
            service,
            message: err.to_string(),
        });
        err
    }
}

fn write_error(e: BleError) -> SessionError {
    match e {
        BleError::NotConnected => SessionError::NotConnected,
        other => SessionError::WriteFailure(other.to_string()),
    }
}

/// Swap the UART roles when the device reports that the characteristic
/// listed as RX is the one that pushes values.
fn assign_uart_roles(resolved: &mut [(CharacteristicSpec, Arc<dyn GattCharacteristic>)]) {
    let tx = resolved.iter().position(|(c, _)| c.channel == Channel::UartTx);
    let rx = resolved.iter().position(|(c, _)| c.channel == Channel::UartRx);
    let (Some(tx), Some(rx)) = (tx, rx) else {
        return;
    };

    let swapped = match (resolved[tx].1.properties(), resolved[rx].1.properties()) {
        (Some(tx_props), Some(rx_props)) => {
            !tx_props.pushes_values() && rx_props.pushes_values()
        }
        _ => false,
    };

    if swapped {
        debug!("UART roles reported swapped, subscribing to {}", resolved[rx].1.uuid());
        let tx_handle = resolved[tx].1.clone();
        resolved[tx].1 = resolved[rx].1.clone();
        resolved[rx].1 = tx_handle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::EventKind;
    use crate::domain::models::{Button, Vector3};
    use crate::infrastructure::bluetooth::protocol::uuids;
    use crate::infrastructure::bluetooth::simulated::{SimulatedBackend, SimulatedMicrobit};

    const NAME: &str = "BBC micro:bit [vuvot]";

    fn setup(device: SimulatedMicrobit) -> (MicrobitSession, Arc<SimulatedBackend>, Arc<Mutex<Vec<Event>>>) {
        let backend = Arc::new(SimulatedBackend::new(Arc::new(device)));
        let session = MicrobitSession::new(backend.clone(), SessionConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        session.events().on_each(&EventKind::ALL, move |event| {
            log_clone.lock().unwrap().push(event.clone());
            Ok(())
        });
        (session, backend, log)
    }

    fn kinds(log: &Arc<Mutex<Vec<Event>>>) -> Vec<EventKind> {
        log.lock().unwrap().iter().map(Event::kind).collect()
    }

    #[test]
    fn test_text_encoding() {
        assert_eq!(TextTarget::Uart.encode("hi"), vec![b'h', b'i', b'\n']);
        assert_eq!(TextTarget::Led.encode("A"), vec![b'A']);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_starts_all_services_in_order() {
        let (session, backend, log) = setup(SimulatedMicrobit::new(NAME));

        let name = session.connect(None).await.unwrap();

        assert_eq!(name, NAME);
        assert!(session.is_connected());
        let expected: Vec<_> = PROFILE.iter().map(|s| s.uuid).collect();
        assert_eq!(backend.device().opened_services(), expected);
        assert_eq!(session.started_services().len(), PROFILE.len());

        let events = kinds(&log);
        assert_eq!(events[0], EventKind::Connection);
        assert_eq!(
            events.iter().filter(|k| **k == EventKind::ServiceStarted).count(),
            PROFILE.len()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_services_are_started_with_delay() {
        let (session, _backend, _log) = setup(SimulatedMicrobit::new(NAME));

        let before = tokio::time::Instant::now();
        session.connect(None).await.unwrap();
        let elapsed = before.elapsed();

        let expected = SessionConfig::default().service_start_delay * (PROFILE.len() as u32 - 1);
        assert!(elapsed >= expected, "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_picker_cancel() {
        let (session, backend, log) = setup(SimulatedMicrobit::new(NAME));
        backend.cancel_picker(true);

        assert_eq!(session.connect(None).await, Err(SessionError::DeviceNotSelected));
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert_eq!(kinds(&log), vec![EventKind::Error]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_name_filter_mismatch() {
        let (session, _backend, _log) = setup(SimulatedMicrobit::new(NAME));
        assert_eq!(
            session.connect(Some("Calliope mini")).await,
            Err(SessionError::DeviceNotSelected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_failure() {
        let (session, backend, _log) = setup(SimulatedMicrobit::new(NAME));
        backend.fail_link(true);

        assert!(matches!(
            session.connect(None).await,
            Err(SessionError::LinkFailure(_))
        ));
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);

        backend.fail_link(false);
        assert!(session.connect(None).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_magnetometer_failure_is_tolerated() {
        let device = SimulatedMicrobit::new(NAME).without_service(uuids::MAGNETOMETER_SERVICE);
        let (session, _backend, log) = setup(device);

        session.connect(None).await.unwrap();

        let started = session.started_services();
        for kind in [
            ServiceKind::Uart,
            ServiceKind::Temperature,
            ServiceKind::Accelerometer,
            ServiceKind::Buttons,
            ServiceKind::Led,
        ] {
            assert!(started.contains(&kind), "{} not started", kind);
        }
        assert!(!started.contains(&ServiceKind::Magnetometer));

        let events = kinds(&log);
        assert!(events.contains(&EventKind::ServiceFailed));
        assert!(!events.contains(&EventKind::Error));

        match session.set_sample_period(ServiceKind::Magnetometer, 80).await {
            Err(SessionError::ServiceUnavailable { service, reason }) => {
                assert_eq!(service, ServiceKind::Magnetometer);
                assert!(reason.contains("optional"), "{}", reason);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_required_failure_does_not_abort_sequence() {
        let device = SimulatedMicrobit::new(NAME).without_service(uuids::TEMPERATURE_SERVICE);
        let (session, backend, log) = setup(device);

        let result = session.connect(None).await;

        assert!(matches!(
            result,
            Err(SessionError::ServiceUnavailable {
                service: ServiceKind::Temperature,
                ..
            })
        ));
        // Still connected, later services were attempted and started
        assert!(session.is_connected());
        assert_eq!(backend.device().opened_services().len(), PROFILE.len());
        assert!(session.started_services().contains(&ServiceKind::Magnetometer));
        assert!(kinds(&log).contains(&EventKind::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_bearing_is_only_logged() {
        let device =
            SimulatedMicrobit::new(NAME).without_characteristic(uuids::MAGNETOMETER_BEARING);
        let (session, backend, _log) = setup(device);

        session.connect(None).await.unwrap();

        assert!(session.started_services().contains(&ServiceKind::Magnetometer));
        assert!(backend.device().is_subscribed(uuids::MAGNETOMETER_DATA));
        assert!(!backend.device().is_subscribed(uuids::MAGNETOMETER_BEARING));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_start_clears_registry() {
        let device = SimulatedMicrobit::new(NAME).dropping_link_on(uuids::BUTTON_SERVICE);
        let (session, backend, log) = setup(device);

        assert_eq!(session.connect(None).await, Err(SessionError::NotConnected));

        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(session.started_services().is_empty());
        assert!(!backend.device().opened_services().contains(&uuids::LED_SERVICE));
        assert_eq!(
            session.send_text(TextTarget::Uart, "x").await,
            Err(SessionError::NotConnected)
        );
        let events = kinds(&log);
        assert_eq!(
            events.iter().filter(|k| **k == EventKind::Disconnection).count(),
            1
        );
        assert!(!events.contains(&EventKind::ServiceFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_are_decoded_into_events() {
        let (session, backend, log) = setup(SimulatedMicrobit::new(NAME));
        session.connect(None).await.unwrap();
        log.lock().unwrap().clear();

        let device = backend.device();
        assert!(device.notify(uuids::TEMPERATURE_DATA, &[0xE8]));
        assert!(device.notify(
            uuids::ACCELEROMETER_DATA,
            &[0x10, 0x00, 0xF0, 0xFF, 0x00, 0x04]
        ));
        assert!(device.notify(uuids::BUTTON_A, &[1]));
        assert!(device.notify(uuids::MAGNETOMETER_BEARING, &[0x2D, 0x00]));
        assert!(device.notify(uuids::UART_TX, b"hello"));

        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                Event::TemperatureChanged { celsius: -24 },
                Event::AccelerometerChanged {
                    milli_g: Vector3 {
                        x: 16,
                        y: -16,
                        z: 1024
                    }
                },
                Event::ButtonChanged {
                    button: Button::A,
                    pressed: true,
                    state: crate::domain::models::ButtonState::Pressed,
                },
                Event::BearingChanged { degrees: 45 },
                Event::UartReceived {
                    text: "hello".to_string()
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_payload_raises_error_event() {
        let (session, backend, log) = setup(SimulatedMicrobit::new(NAME));
        session.connect(None).await.unwrap();
        log.lock().unwrap().clear();

        backend.device().notify(uuids::ACCELEROMETER_DATA, &[0x01, 0x02]);

        assert_eq!(kinds(&log), vec![EventKind::Error]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_text() {
        let (session, backend, _log) = setup(SimulatedMicrobit::new(NAME));
        session.connect(None).await.unwrap();

        session.send_text(TextTarget::Uart, "hi").await.unwrap();
        session.send_text(TextTarget::Led, "A").await.unwrap();

        let device = backend.device();
        assert_eq!(device.writes_to(uuids::UART_RX), vec![b"hi\n".to_vec()]);
        assert_eq!(device.writes_to(uuids::LED_TEXT), vec![b"A".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_text_errors() {
        let (session, _backend, _log) = setup(SimulatedMicrobit::new(NAME));
        assert_eq!(
            session.send_text(TextTarget::Led, "A").await,
            Err(SessionError::NotConnected)
        );

        let device = SimulatedMicrobit::new(NAME).without_service(uuids::LED_SERVICE);
        let (session, _backend, _log) = setup(device);
        let _ = session.connect(None).await;
        assert!(matches!(
            session.send_text(TextTarget::Led, "A").await,
            Err(SessionError::ServiceUnavailable {
                service: ServiceKind::Led,
                ..
            })
        ));

        let (session, _backend, _log) = setup(SimulatedMicrobit::new(NAME));
        session.connect(None).await.unwrap();
        let too_long = "this text is longer than one write";
        assert!(matches!(
            session.send_text(TextTarget::Led, too_long).await,
            Err(SessionError::WriteFailure(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_write() {
        let (session, _backend, log) = setup(SimulatedMicrobit::new(NAME).rejecting_writes());
        session.connect(None).await.unwrap();
        log.lock().unwrap().clear();

        assert!(matches!(
            session.send_text(TextTarget::Uart, "hi").await,
            Err(SessionError::WriteFailure(_))
        ));
        assert_eq!(kinds(&log), vec![EventKind::Error]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_swapped_uart_roles() {
        let device = SimulatedMicrobit::new(NAME)
            .with_swapped_uart_roles()
            .echoing_uart();
        let (session, backend, log) = setup(device);
        session.connect(None).await.unwrap();
        log.lock().unwrap().clear();

        session.send_text(TextTarget::Uart, "ping").await.unwrap();

        assert_eq!(backend.device().writes_to(uuids::UART_TX), vec![b"ping\n".to_vec()]);
        assert_eq!(
            log.lock().unwrap().clone(),
            vec![Event::UartReceived {
                text: "ping\n".to_string()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_period() {
        let (session, backend, _log) = setup(SimulatedMicrobit::new(NAME));
        session.connect(None).await.unwrap();

        session
            .set_sample_period(ServiceKind::Accelerometer, 80)
            .await
            .unwrap();
        assert_eq!(
            backend.device().writes_to(uuids::ACCELEROMETER_PERIOD),
            vec![vec![80, 0]]
        );
        assert!(matches!(
            session.set_sample_period(ServiceKind::Buttons, 80).await,
            Err(SessionError::ServiceUnavailable { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_and_reconnect() {
        let (session, backend, log) = setup(SimulatedMicrobit::new(NAME));
        session.connect(None).await.unwrap();

        backend.device().drop_link();

        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(session.started_services().is_empty());
        assert!(!backend.device().notify(uuids::TEMPERATURE_DATA, &[20]));

        log.lock().unwrap().clear();
        session.connect(None).await.unwrap();
        let started = kinds(&log)
            .into_iter()
            .filter(|k| *k == EventKind::ServiceStarted)
            .count();
        assert_eq!(started, PROFILE.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let (session, _backend, log) = setup(SimulatedMicrobit::new(NAME));
        session.disconnect().await;
        assert!(log.lock().unwrap().is_empty());

        session.connect(None).await.unwrap();
        session.disconnect().await;
        session.disconnect().await;

        let disconnections = kinds(&log)
            .into_iter()
            .filter(|k| *k == EventKind::Disconnection)
            .count();
        assert_eq!(disconnections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_does_not_duplicate_services() {
        let (session, _backend, log) = setup(SimulatedMicrobit::new(NAME));
        session.connect(None).await.unwrap();
        log.lock().unwrap().clear();

        let report = session.start_services().await.unwrap();

        assert_eq!(report.started.len(), PROFILE.len());
        assert!(!kinds(&log).contains(&EventKind::ServiceStarted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_services_requires_link() {
        let (session, _backend, _log) = setup(SimulatedMicrobit::new(NAME));
        assert_eq!(session.start_services().await, Err(SessionError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_by_address() {
        let device = SimulatedMicrobit::new("Calliope mini").with_address("E1:02:03:04:05:06");
        let backend = Arc::new(SimulatedBackend::new(Arc::new(device)));

        let config = SessionConfig {
            address: Some("e1-02-03-04-05-06".to_string()),
            ..SessionConfig::default()
        };
        let session = MicrobitSession::new(backend.clone(), config);
        assert_eq!(session.connect(None).await.unwrap(), "Calliope mini");
        session.disconnect().await;

        let config = SessionConfig {
            address: Some("E1:02:03:04:05:07".to_string()),
            ..SessionConfig::default()
        };
        let session = MicrobitSession::new(backend, config);
        assert_eq!(session.connect(None).await, Err(SessionError::DeviceNotSelected));
        assert!(!session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_start() {
        let backend = Arc::new(SimulatedBackend::new(Arc::new(SimulatedMicrobit::new(NAME))));
        let config = SessionConfig {
            auto_start_services: false,
            ..SessionConfig::default()
        };
        let session = MicrobitSession::new(backend, config);

        session.connect(None).await.unwrap();
        assert!(session.started_services().is_empty());

        let report = session.start_services().await.unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(report.started.len(), PROFILE.len());
    }
}
