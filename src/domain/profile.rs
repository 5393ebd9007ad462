//! Names for the parts of the micro:bit Bluetooth profile.
//!
//! UUIDs and the activation table live with the Bluetooth code; the rest of
//! the crate only talks about services and channels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default advertised name prefix of a micro:bit
pub const DEFAULT_NAME_PREFIX: &str = "BBC micro:bit";

/// Default pause between two service activations in milliseconds
pub const SERVICE_START_DELAY_MS: u64 = 300;

/// The services this crate knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Uart,
    Temperature,
    Accelerometer,
    Buttons,
    Magnetometer,
    Led,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 6] = [
        Self::Uart,
        Self::Temperature,
        Self::Accelerometer,
        Self::Buttons,
        Self::Magnetometer,
        Self::Led,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Uart => "uart",
            Self::Temperature => "temperature",
            Self::Accelerometer => "accelerometer",
            Self::Buttons => "buttons",
            Self::Magnetometer => "magnetometer",
            Self::Led => "led",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| format!("unknown service '{}'", s))
    }
}

/// What a characteristic is used for once its service is open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    UartTx,
    UartRx,
    TemperatureData,
    TemperaturePeriod,
    AccelerometerData,
    AccelerometerPeriod,
    ButtonA,
    ButtonB,
    MagnetometerData,
    MagnetometerPeriod,
    MagnetometerBearing,
    LedText,
}

impl Channel {
    /// Service the channel belongs to
    pub fn service(&self) -> ServiceKind {
        match self {
            Self::UartTx | Self::UartRx => ServiceKind::Uart,
            Self::TemperatureData | Self::TemperaturePeriod => ServiceKind::Temperature,
            Self::AccelerometerData | Self::AccelerometerPeriod => ServiceKind::Accelerometer,
            Self::ButtonA | Self::ButtonB => ServiceKind::Buttons,
            Self::MagnetometerData | Self::MagnetometerPeriod | Self::MagnetometerBearing => {
                ServiceKind::Magnetometer
            }
            Self::LedText => ServiceKind::Led,
        }
    }
}
