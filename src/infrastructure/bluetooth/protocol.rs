//! micro:bit Bluetooth Profile
//!
//! Fixed service and characteristic UUIDs exposed by the micro:bit firmware,
//! and the declarative table the service starter walks through.

pub use crate::domain::profile::{Channel, ServiceKind};
use uuid::Uuid;

pub mod uuids {
    use uuid::Uuid;

    pub const UART_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
    /// Host to device
    pub const UART_RX: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
    /// Device to host
    pub const UART_TX: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

    pub const TEMPERATURE_SERVICE: Uuid = Uuid::from_u128(0xe95d6100_251d_470a_a062_fa1922dfa9a8);
    pub const TEMPERATURE_DATA: Uuid = Uuid::from_u128(0xe95d9250_251d_470a_a062_fa1922dfa9a8);
    pub const TEMPERATURE_PERIOD: Uuid = Uuid::from_u128(0xe95d1b25_251d_470a_a062_fa1922dfa9a8);

    pub const ACCELEROMETER_SERVICE: Uuid =
        Uuid::from_u128(0xe95d0753_251d_470a_a062_fa1922dfa9a8);
    pub const ACCELEROMETER_DATA: Uuid = Uuid::from_u128(0xe95dca4b_251d_470a_a062_fa1922dfa9a8);
    pub const ACCELEROMETER_PERIOD: Uuid =
        Uuid::from_u128(0xe95dfb24_251d_470a_a062_fa1922dfa9a8);

    pub const BUTTON_SERVICE: Uuid = Uuid::from_u128(0xe95d9882_251d_470a_a062_fa1922dfa9a8);
    pub const BUTTON_A: Uuid = Uuid::from_u128(0xe95dda90_251d_470a_a062_fa1922dfa9a8);
    pub const BUTTON_B: Uuid = Uuid::from_u128(0xe95dda91_251d_470a_a062_fa1922dfa9a8);

    pub const MAGNETOMETER_SERVICE: Uuid = Uuid::from_u128(0xe95df2d8_251d_470a_a062_fa1922dfa9a8);
    pub const MAGNETOMETER_DATA: Uuid = Uuid::from_u128(0xe95dfb11_251d_470a_a062_fa1922dfa9a8);
    pub const MAGNETOMETER_PERIOD: Uuid = Uuid::from_u128(0xe95d386c_251d_470a_a062_fa1922dfa9a8);
    pub const MAGNETOMETER_BEARING: Uuid =
        Uuid::from_u128(0xe95d9715_251d_470a_a062_fa1922dfa9a8);

    pub const LED_SERVICE: Uuid = Uuid::from_u128(0xe95dd91d_251d_470a_a062_fa1922dfa9a8);
    pub const LED_TEXT: Uuid = Uuid::from_u128(0xe95d93ee_251d_470a_a062_fa1922dfa9a8);
}

impl ServiceKind {
    /// Row of the activation table describing this service
    pub fn spec(&self) -> &'static ServiceSpec {
        match self {
            Self::Uart => &PROFILE[0],
            Self::Temperature => &PROFILE[1],
            Self::Accelerometer => &PROFILE[2],
            Self::Buttons => &PROFILE[3],
            Self::Led => &PROFILE[4],
            Self::Magnetometer => &PROFILE[5],
        }
    }
}

/// How the host talks to a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Device pushes values, host subscribes
    Notify,
    /// Host writes values
    Write,
}

#[derive(Debug, Clone, Copy)]
pub struct CharacteristicSpec {
    pub channel: Channel,
    pub uuid: Uuid,
    pub access: Access,
    /// Missing optional characteristics are logged and skipped
    pub required: bool,
}

#[derive(Debug)]
pub struct ServiceSpec {
    pub kind: ServiceKind,
    pub uuid: Uuid,
    /// A failed optional service never fails the start sequence
    pub required: bool,
    pub characteristics: &'static [CharacteristicSpec],
}

const fn notify(channel: Channel, uuid: Uuid, required: bool) -> CharacteristicSpec {
    CharacteristicSpec {
        channel,
        uuid,
        access: Access::Notify,
        required,
    }
}

const fn write(channel: Channel, uuid: Uuid, required: bool) -> CharacteristicSpec {
    CharacteristicSpec {
        channel,
        uuid,
        access: Access::Write,
        required,
    }
}

/// Services in activation order. The magnetometer is last because it is the
/// first to fail when the device runs out of attribute table space.
pub const PROFILE: &[ServiceSpec] = &[
    ServiceSpec {
        kind: ServiceKind::Uart,
        uuid: uuids::UART_SERVICE,
        required: true,
        characteristics: &[
            notify(Channel::UartTx, uuids::UART_TX, true),
            write(Channel::UartRx, uuids::UART_RX, true),
        ],
    },
    ServiceSpec {
        kind: ServiceKind::Temperature,
        uuid: uuids::TEMPERATURE_SERVICE,
        required: true,
        characteristics: &[
            notify(Channel::TemperatureData, uuids::TEMPERATURE_DATA, true),
            write(Channel::TemperaturePeriod, uuids::TEMPERATURE_PERIOD, false),
        ],
    },
    ServiceSpec {
        kind: ServiceKind::Accelerometer,
        uuid: uuids::ACCELEROMETER_SERVICE,
        required: true,
        characteristics: &[
            notify(Channel::AccelerometerData, uuids::ACCELEROMETER_DATA, true),
            write(Channel::AccelerometerPeriod, uuids::ACCELEROMETER_PERIOD, false),
        ],
    },
    ServiceSpec {
        kind: ServiceKind::Buttons,
        uuid: uuids::BUTTON_SERVICE,
        required: true,
        characteristics: &[
            notify(Channel::ButtonA, uuids::BUTTON_A, true),
            notify(Channel::ButtonB, uuids::BUTTON_B, true),
        ],
    },
    ServiceSpec {
        kind: ServiceKind::Led,
        uuid: uuids::LED_SERVICE,
        required: true,
        characteristics: &[write(Channel::LedText, uuids::LED_TEXT, true)],
    },
    ServiceSpec {
        kind: ServiceKind::Magnetometer,
        uuid: uuids::MAGNETOMETER_SERVICE,
        required: false,
        characteristics: &[
            notify(Channel::MagnetometerData, uuids::MAGNETOMETER_DATA, false),
            notify(Channel::MagnetometerBearing, uuids::MAGNETOMETER_BEARING, false),
            write(Channel::MagnetometerPeriod, uuids::MAGNETOMETER_PERIOD, false),
        ],
    },
];

/// Look up a characteristic of the profile by UUID
pub fn characteristic_spec(uuid: Uuid) -> Option<(&'static ServiceSpec, &'static CharacteristicSpec)> {
    PROFILE.iter().find_map(|service| {
        service
            .characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .map(|c| (service, c))
    })
}

/// Every service UUID, for the optional-services list of a discovery request
pub fn service_uuids() -> Vec<Uuid> {
    PROFILE.iter().map(|spec| spec.uuid).collect()
}

/// Period characteristic of a sampled sensor service
pub fn period_channel(kind: ServiceKind) -> Option<Channel> {
    match kind {
        ServiceKind::Temperature => Some(Channel::TemperaturePeriod),
        ServiceKind::Accelerometer => Some(Channel::AccelerometerPeriod),
        ServiceKind::Magnetometer => Some(Channel::MagnetometerPeriod),
        _ => None,
    }
}

/// Encode an outgoing period in milliseconds
pub fn encode_period(period_ms: u16) -> [u8; 2] {
    period_ms.to_le_bytes()
}
