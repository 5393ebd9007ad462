//! BLE client for the BBC micro:bit: connection management, service
//! activation, decoded sensor events and text output to UART and LED.

pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use domain::events::{Event, EventBus, EventKind};
pub use infrastructure::bluetooth::{MicrobitSession, SessionConfig, SessionError, TextTarget};
