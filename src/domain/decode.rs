//! Notification payload decoding
//!
//! Each micro:bit characteristic carries a fixed-width little-endian layout.
//! Decoders are pure: the same bytes always produce the same sample.
//!
//! ```text
//! temperature   [0]      i8   °C
//! accelerometer [0..6]   3x i16 LE, milli-g
//! magnetometer  [0..6]   3x i16 LE, device units
//! bearing       [0..2]   u16 LE, degrees
//! button A/B    [0]      u8   0 released, 1 pressed, 2 long press
//! uart tx       [..]     UTF-8 text
//! ```

use crate::domain::models::{Button, ButtonState, Vector3};
use crate::domain::profile::Channel;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload too short: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("channel {0:?} does not carry notifications")]
    NotNotifying(Channel),
}

/// A decoded notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sample {
    Temperature(i8),
    Accelerometer(Vector3),
    Magnetometer(Vector3),
    Bearing(u16),
    Button { button: Button, state: ButtonState },
    Uart(String),
}

fn require(bytes: &[u8], expected: usize) -> Result<(), DecodeError> {
    if bytes.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

pub fn decode_temperature(bytes: &[u8]) -> Result<i8, DecodeError> {
    require(bytes, 1)?;
    Ok(i8::from_le_bytes([bytes[0]]))
}

pub fn decode_vector(bytes: &[u8]) -> Result<Vector3, DecodeError> {
    require(bytes, 6)?;
    Ok(Vector3 {
        x: i16::from_le_bytes([bytes[0], bytes[1]]),
        y: i16::from_le_bytes([bytes[2], bytes[3]]),
        z: i16::from_le_bytes([bytes[4], bytes[5]]),
    })
}

pub fn decode_bearing(bytes: &[u8]) -> Result<u16, DecodeError> {
    require(bytes, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub fn decode_button(bytes: &[u8]) -> Result<ButtonState, DecodeError> {
    require(bytes, 1)?;
    Ok(ButtonState::from_raw(bytes[0]))
}

/// Invalid sequences are replaced rather than rejected
pub fn decode_uart(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Decode the payload of a notifying channel
pub fn decode(channel: Channel, bytes: &[u8]) -> Result<Sample, DecodeError> {
    let sample = match channel {
        Channel::TemperatureData => Sample::Temperature(decode_temperature(bytes)?),
        Channel::AccelerometerData => Sample::Accelerometer(decode_vector(bytes)?),
        Channel::MagnetometerData => Sample::Magnetometer(decode_vector(bytes)?),
        Channel::MagnetometerBearing => Sample::Bearing(decode_bearing(bytes)?),
        Channel::ButtonA => Sample::Button {
            button: Button::A,
            state: decode_button(bytes)?,
        },
        Channel::ButtonB => Sample::Button {
            button: Button::B,
            state: decode_button(bytes)?,
        },
        Channel::UartTx => Sample::Uart(decode_uart(bytes)),
        other => return Err(DecodeError::NotNotifying(other)),
    };
    Ok(sample)
}
