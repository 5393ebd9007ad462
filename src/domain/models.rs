use serde::{Deserialize, Serialize};
use std::fmt;

/// Three-axis reading from the accelerometer or magnetometer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl fmt::Display for Vector3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x={} y={} z={}", self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Button {
    A,
    B,
}

/// Raw button flag as reported by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonState {
    Released,
    Pressed,
    LongPress,
    Unknown(u8),
}

impl ButtonState {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Released,
            1 => Self::Pressed,
            2 => Self::LongPress,
            other => Self::Unknown(other),
        }
    }

    pub fn raw(&self) -> u8 {
        match self {
            Self::Released => 0,
            Self::Pressed => 1,
            Self::LongPress => 2,
            Self::Unknown(raw) => *raw,
        }
    }

    /// Any nonzero flag counts as pressed
    pub fn is_pressed(&self) -> bool {
        !matches!(self, Self::Released)
    }
}

impl fmt::Display for ButtonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Released => f.write_str("not pressed"),
            Self::Pressed => f.write_str("pressed"),
            Self::LongPress => f.write_str("long press"),
            Self::Unknown(raw) => write!(f, "unknown ({})", raw),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_button_state_from_raw() {
        assert_eq!(ButtonState::from_raw(0), ButtonState::Released);
        assert_eq!(ButtonState::from_raw(2), ButtonState::LongPress);
        assert!(!ButtonState::from_raw(0).is_pressed());
        assert!(ButtonState::from_raw(1).is_pressed());
        assert!(ButtonState::from_raw(0x80).is_pressed());
    }
}
