//! Batched monitor output
//!
//! Notifications arrive much faster than anyone can read them. The reporter
//! keeps only the latest value per channel and prints one block per tick.

use crate::domain::events::{Event, EventKind};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Channels a monitor can select
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorChannel {
    Uart,
    ButtonA,
    ButtonB,
    Accelerometer,
    Temperature,
    Magnetometer,
    Bearing,
}

impl MonitorChannel {
    pub const ALL: [MonitorChannel; 7] = [
        Self::Uart,
        Self::ButtonA,
        Self::ButtonB,
        Self::Accelerometer,
        Self::Temperature,
        Self::Magnetometer,
        Self::Bearing,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Uart => "uart",
            Self::ButtonA => "button_a",
            Self::ButtonB => "button_b",
            Self::Accelerometer => "accelerometer",
            Self::Temperature => "temperature",
            Self::Magnetometer => "magnetometer",
            Self::Bearing => "magnetometer_bearing",
        }
    }

    /// Bus event carrying this channel's readings
    pub fn event_kind(&self) -> EventKind {
        match self {
            Self::Uart => EventKind::UartReceived,
            Self::ButtonA => EventKind::ButtonAChanged,
            Self::ButtonB => EventKind::ButtonBChanged,
            Self::Accelerometer => EventKind::AccelerometerChanged,
            Self::Temperature => EventKind::TemperatureChanged,
            Self::Magnetometer => EventKind::MagnetometerChanged,
            Self::Bearing => EventKind::BearingChanged,
        }
    }

    /// Channel an event reports on, if it is a sensor reading
    pub fn of(event: &Event) -> Option<Self> {
        use crate::domain::models::Button;
        match event {
            Event::UartReceived { .. } => Some(Self::Uart),
            Event::ButtonChanged {
                button: Button::A, ..
            } => Some(Self::ButtonA),
            Event::ButtonChanged {
                button: Button::B, ..
            } => Some(Self::ButtonB),
            Event::AccelerometerChanged { .. } => Some(Self::Accelerometer),
            Event::TemperatureChanged { .. } => Some(Self::Temperature),
            Event::MagnetometerChanged { .. } => Some(Self::Magnetometer),
            Event::BearingChanged { .. } => Some(Self::Bearing),
            _ => None,
        }
    }
}

/// Human readable value of a sensor event
pub fn describe(event: &Event) -> Option<String> {
    let text = match event {
        Event::UartReceived { text } => {
            text.trim_end_matches(|c: char| c == '\r' || c == '\n').to_string()
        }
        Event::ButtonChanged { state, .. } => format!("state={} ({})", state.raw(), state),
        Event::AccelerometerChanged { milli_g } => {
            format!("x={}mg y={}mg z={}mg", milli_g.x, milli_g.y, milli_g.z)
        }
        Event::TemperatureChanged { celsius } => format!("{}°C", celsius),
        Event::MagnetometerChanged { field } => field.to_string(),
        Event::BearingChanged { degrees } => format!("{}°", degrees),
        _ => return None,
    };
    Some(text)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
    pub timestamp: f64,
    pub values: Vec<(MonitorChannel, String)>,
}

impl Batch {
    pub fn render_text(&self) -> String {
        let mut out = format!("[{:.3}]", self.timestamp);
        for (channel, value) in &self.values {
            out.push_str(&format!("\n  {}: {}", channel.label(), value));
        }
        out
    }

    pub fn render_json(&self) -> String {
        let values: serde_json::Map<String, serde_json::Value> = self
            .values
            .iter()
            .map(|(channel, value)| (channel.label().to_string(), value.clone().into()))
            .collect();
        serde_json::json!({ "timestamp": self.timestamp, "values": values }).to_string()
    }
}

/// Latest value per channel, in first-seen order
#[derive(Debug, Default)]
pub struct BatchReporter {
    selected: Vec<MonitorChannel>,
    pending: Vec<(MonitorChannel, String)>,
}

impl BatchReporter {
    pub fn new(selected: &[MonitorChannel]) -> Self {
        Self {
            selected: selected.to_vec(),
            pending: Vec::new(),
        }
    }

    /// Returns false for events outside the selection
    pub fn record(&mut self, event: &Event) -> bool {
        let Some(channel) = MonitorChannel::of(event) else {
            return false;
        };
        if !self.selected.contains(&channel) {
            return false;
        }
        let Some(value) = describe(event) else {
            return false;
        };
        match self.pending.iter_mut().find(|(c, _)| *c == channel) {
            Some(entry) => entry.1 = value,
            None => self.pending.push((channel, value)),
        }
        true
    }

    /// Take the pending batch; nothing to report when no value arrived
    pub fn flush(&mut self) -> Option<Batch> {
        if self.pending.is_empty() {
            return None;
        }
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Some(Batch {
            timestamp,
            values: std::mem::take(&mut self.pending),
        })
    }
}
