//! Session events and the listener table that fans them out.

use crate::domain::decode::Sample;
use crate::domain::models::{Button, ButtonState, Vector3};
use crate::domain::profile::ServiceKind;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, trace};

/// Event names other components bind to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connection,
    Disconnection,
    UartReceived,
    TemperatureChanged,
    AccelerometerChanged,
    ButtonAChanged,
    ButtonBChanged,
    MagnetometerChanged,
    BearingChanged,
    ServiceStarted,
    ServiceFailed,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        Self::Connection,
        Self::Disconnection,
        Self::UartReceived,
        Self::TemperatureChanged,
        Self::AccelerometerChanged,
        Self::ButtonAChanged,
        Self::ButtonBChanged,
        Self::MagnetometerChanged,
        Self::BearingChanged,
        Self::ServiceStarted,
        Self::ServiceFailed,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Disconnection => "disconnection",
            Self::UartReceived => "uart:received",
            Self::TemperatureChanged => "temperature:changed",
            Self::AccelerometerChanged => "accelerometer:changed",
            Self::ButtonAChanged => "button:a:changed",
            Self::ButtonBChanged => "button:b:changed",
            Self::MagnetometerChanged => "magnetometer:changed",
            Self::BearingChanged => "magnetometer:bearing:changed",
            Self::ServiceStarted => "service:started",
            Self::ServiceFailed => "service:failed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event '{}'", s))
    }
}

/// Payload of every event the session emits
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Connection {
        device_name: String,
    },
    Disconnection {
        device_name: Option<String>,
    },
    UartReceived {
        text: String,
    },
    TemperatureChanged {
        celsius: i8,
    },
    AccelerometerChanged {
        #[serde(flatten)]
        milli_g: Vector3,
    },
    ButtonChanged {
        button: Button,
        pressed: bool,
        state: ButtonState,
    },
    MagnetometerChanged {
        #[serde(flatten)]
        field: Vector3,
    },
    BearingChanged {
        degrees: u16,
    },
    ServiceStarted {
        service: ServiceKind,
    },
    ServiceFailed {
        service: ServiceKind,
        reason: String,
    },
    Error {
        service: Option<ServiceKind>,
        message: String,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connection { .. } => EventKind::Connection,
            Self::Disconnection { .. } => EventKind::Disconnection,
            Self::UartReceived { .. } => EventKind::UartReceived,
            Self::TemperatureChanged { .. } => EventKind::TemperatureChanged,
            Self::AccelerometerChanged { .. } => EventKind::AccelerometerChanged,
            Self::ButtonChanged {
                button: Button::A, ..
            } => EventKind::ButtonAChanged,
            Self::ButtonChanged {
                button: Button::B, ..
            } => EventKind::ButtonBChanged,
            Self::MagnetometerChanged { .. } => EventKind::MagnetometerChanged,
            Self::BearingChanged { .. } => EventKind::BearingChanged,
            Self::ServiceStarted { .. } => EventKind::ServiceStarted,
            Self::ServiceFailed { .. } => EventKind::ServiceFailed,
            Self::Error { .. } => EventKind::Error,
        }
    }
}

impl From<Sample> for Event {
    fn from(sample: Sample) -> Self {
        match sample {
            Sample::Temperature(celsius) => Self::TemperatureChanged { celsius },
            Sample::Accelerometer(milli_g) => Self::AccelerometerChanged { milli_g },
            Sample::Magnetometer(field) => Self::MagnetometerChanged { field },
            Sample::Bearing(degrees) => Self::BearingChanged { degrees },
            Sample::Button { button, state } => Self::ButtonChanged {
                button,
                pressed: state.is_pressed(),
                state,
            },
            Sample::Uart(text) => Self::UartReceived { text },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Named-event listener table.
///
/// Listeners of one event run in registration order. A listener that returns
/// an error or panics is logged and skipped; the rest still run.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<EventKind, Vec<(ListenerId, Callback)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.lock();
        listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Register one callback for several events
    pub fn on_each<F>(&self, kinds: &[EventKind], callback: F) -> Vec<ListenerId>
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        kinds
            .iter()
            .map(|kind| {
                let callback = callback.clone();
                self.on(*kind, move |event| callback(event))
            })
            .collect()
    }

    /// Returns false when the listener was already gone
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        for entries in listeners.values_mut() {
            if let Some(pos) = entries.iter().position(|(entry_id, _)| *entry_id == id) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Forward the given events into a channel, e.g. for a UI thread
    pub fn forward(
        &self,
        kinds: &[EventKind],
        sender: mpsc::UnboundedSender<Event>,
    ) -> Vec<ListenerId> {
        self.on_each(kinds, move |event| {
            sender
                .send(event.clone())
                .map_err(|_| anyhow::anyhow!("event receiver dropped"))
        })
    }

    pub fn emit(&self, event: &Event) {
        let kind = event.kind();
        // Snapshot so listeners can register or remove listeners re-entrantly
        let callbacks: Vec<(ListenerId, Callback)> =
            self.lock().get(&kind).cloned().unwrap_or_default();

        trace!("Emitting {} to {} listener(s)", kind, callbacks.len());

        for (id, callback) in callbacks {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Listener {:?} for '{}' failed: {:#}", id, kind, e),
                Err(_) => error!("Listener {:?} for '{}' panicked", id, kind),
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EventKind, Vec<(ListenerId, Callback)>>> {
        // A poisoned table is still structurally valid
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(bus: &EventBus, kind: EventKind, log: &Arc<Mutex<Vec<String>>>, tag: &str) {
        let log = log.clone();
        let tag = tag.to_string();
        bus.on(kind, move |_| {
            log.lock().unwrap().push(tag.clone());
            Ok(())
        });
    }

    #[test]
    fn test_event_names() {
        assert_eq!(EventKind::BearingChanged.as_str(), "magnetometer:bearing:changed");
        assert_eq!("button:b:changed".parse(), Ok(EventKind::ButtonBChanged));
        assert!("button:c:changed".parse::<EventKind>().is_err());
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse(), Ok(kind));
        }
    }

    #[test]
    fn test_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, EventKind::TemperatureChanged, &log, "first");
        recorder(&bus, EventKind::TemperatureChanged, &log, "second");
        recorder(&bus, EventKind::AccelerometerChanged, &log, "other");

        bus.emit(&Event::TemperatureChanged { celsius: 21 });

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_failing_listeners_do_not_stop_others() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on(EventKind::UartReceived, |_| anyhow::bail!("boom"));
        bus.on(EventKind::UartReceived, |_| panic!("listener panic"));
        recorder(&bus, EventKind::UartReceived, &log, "survivor");

        let event = Event::UartReceived { text: "hi".into() };
        bus.emit(&event);
        bus.emit(&event);

        assert_eq!(*log.lock().unwrap(), vec!["survivor", "survivor"]);
        assert_eq!(bus.listener_count(EventKind::UartReceived), 3);
    }

    #[test]
    fn test_off() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let id = bus.on(EventKind::Error, move |_| {
            log_clone.lock().unwrap().push("removed".to_string());
            Ok(())
        });

        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(&Event::Error {
            service: None,
            message: "x".into(),
        });
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_reentrant_registration() {
        let bus = Arc::new(EventBus::new());
        let inner = bus.clone();
        bus.on(EventKind::Connection, move |_| {
            inner.on(EventKind::Disconnection, |_| Ok(()));
            Ok(())
        });

        bus.emit(&Event::Connection {
            device_name: "BBC micro:bit [zezet]".into(),
        });
        assert_eq!(bus.listener_count(EventKind::Disconnection), 1);
    }

    #[test]
    fn test_button_kind_and_payload() {
        let event = Event::from(Sample::Button {
            button: Button::B,
            state: ButtonState::LongPress,
        });
        assert_eq!(event.kind(), EventKind::ButtonBChanged);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "button_changed");
        assert_eq!(json["button"], "b");
        assert_eq!(json["pressed"], true);
    }

    #[test]
    fn test_vector_payload_is_flat() {
        let event = Event::AccelerometerChanged {
            milli_g: Vector3 { x: 1, y: 2, z: 3 },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["x"], 1);
        assert_eq!(json["z"], 3);
    }

    #[tokio::test]
    async fn test_forward_to_channel() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.forward(&[EventKind::BearingChanged], tx);

        bus.emit(&Event::BearingChanged { degrees: 90 });
        assert_eq!(rx.recv().await, Some(Event::BearingChanged { degrees: 90 }));
    }
}
