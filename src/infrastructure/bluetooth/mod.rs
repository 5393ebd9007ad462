//! Bluetooth Module
//!
//! BLE client for the BBC micro:bit.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    MicrobitSession                       │
//! │  (connect, start services, send text, fan out events)    │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Backend  │  │  Registry  │  │ Protocol │
//! │           │  │            │  │          │
//! │ - WinRT   │  │ - started  │  │ - UUIDs  │
//! │ - btleplug│  │   services │  │ - Profile│
//! │ - Simul.  │  │ - writers  │  │ - Order  │
//! └───────────┘  └────────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - micro:bit GATT profile, UUIDs and start order
//! - [`backend`] - platform traits every BLE stack implements
//! - [`registry`] - services started on the current link
//! - [`session`] - connection manager and service starter
//! - [`simulated`] - in-process micro:bit for tests and demos

pub mod backend;
#[cfg(feature = "btleplug")]
pub mod btleplug_backend;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod simulated;
#[cfg(windows)]
pub mod winrt;

pub use backend::BleBackend;
pub use session::{MicrobitSession, SessionConfig, SessionError, StartReport, TextTarget};

use std::sync::Arc;

/// The BLE stack of the host
#[cfg(feature = "btleplug")]
pub fn platform_backend() -> anyhow::Result<Arc<dyn BleBackend>> {
    Ok(Arc::new(btleplug_backend::BtleplugBackend::new()))
}

/// The BLE stack of the host
#[cfg(all(windows, not(feature = "btleplug")))]
pub fn platform_backend() -> anyhow::Result<Arc<dyn BleBackend>> {
    Ok(Arc::new(winrt::WinRtBackend::new()))
}

/// The BLE stack of the host
#[cfg(not(any(windows, feature = "btleplug")))]
pub fn platform_backend() -> anyhow::Result<Arc<dyn BleBackend>> {
    anyhow::bail!("no Bluetooth backend for this platform; build with --features btleplug or use --simulate")
}
