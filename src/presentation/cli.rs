//! Command line front end
//!
//! `monitor` prints batched sensor values, `send` writes one line of text and
//! `dashboard` opens the egui window.

use crate::domain::events::{Event, EventKind};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::simulated::{SimulatedBackend, SimulatedMicrobit};
use crate::infrastructure::bluetooth::{self, BleBackend, MicrobitSession, SessionConfig, TextTarget};
use crate::presentation::report::{BatchReporter, MonitorChannel};
use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Name the simulated device advertises
pub const SIMULATED_NAME: &str = "BBC micro:bit [zivog]";
const SIMULATED_FEED_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(name = "microbit-link", version, about = "BLE client for the BBC micro:bit")]
pub struct Cli {
    /// Pick the first micro:bit whose name starts with this prefix
    #[arg(long, global = true)]
    pub name: Option<String>,

    /// Pick the micro:bit with this Bluetooth address (AA:BB:CC:DD:EE:FF);
    /// wins over --name
    #[arg(long, global = true)]
    pub address: Option<String>,

    /// Seconds to scan before giving up on finding a micro:bit
    #[arg(long = "scan-timeout", global = true)]
    pub scan_timeout: Option<f64>,

    /// Talk to an in-process micro:bit instead of the radio
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Pause between two service activations in milliseconds
    #[arg(long = "delay-ms", global = true)]
    pub delay_ms: Option<u64>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the latest sensor values once per report interval
    Monitor {
        /// Seconds to stay connected
        #[arg(long)]
        duration: Option<f64>,
        /// Channel to print, repeatable (default: all)
        #[arg(short, long = "channel", value_enum)]
        channels: Vec<MonitorChannel>,
        /// One JSON object per batch
        #[arg(long)]
        json: bool,
    },
    /// Write one text to the micro:bit
    Send {
        #[arg(value_enum)]
        target: SendTarget,
        text: String,
    },
    /// Open the live dashboard window
    Dashboard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SendTarget {
    Uart,
    Led,
}

impl From<SendTarget> for TextTarget {
    fn from(target: SendTarget) -> Self {
        match target {
            SendTarget::Uart => TextTarget::Uart,
            SendTarget::Led => TextTarget::Led,
        }
    }
}

impl Cli {
    /// Settings with the command line overrides applied
    pub fn session_config(&self, settings: &Settings) -> anyhow::Result<SessionConfig> {
        let mut config = SessionConfig::from_settings(settings);
        if let Some(name) = &self.name {
            config.name_prefix = name.clone();
        }
        if let Some(address) = &self.address {
            config.address = Some(address.clone());
        }
        if let Some(secs) = self.scan_timeout {
            config.scan_timeout = Duration::try_from_secs_f64(secs)
                .with_context(|| format!("invalid scan timeout: {}", secs))?;
        }
        if let Some(delay) = self.delay_ms {
            config.service_start_delay = Duration::from_millis(delay);
        }
        Ok(config)
    }
}

/// Backend to use plus the simulated device when there is one
pub fn select_backend(
    simulate: bool,
) -> anyhow::Result<(Arc<dyn BleBackend>, Option<Arc<SimulatedMicrobit>>)> {
    if simulate {
        info!("Using the simulated micro:bit");
        let device = Arc::new(SimulatedMicrobit::new(SIMULATED_NAME).echoing_uart());
        let backend: Arc<dyn BleBackend> = Arc::new(SimulatedBackend::new(device.clone()));
        return Ok((backend, Some(device)));
    }
    Ok((bluetooth::platform_backend()?, None))
}

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub duration: Duration,
    pub report_interval: Duration,
    pub channels: Vec<MonitorChannel>,
    pub json: bool,
}

impl MonitorOptions {
    pub fn new(
        settings: &Settings,
        duration_secs: Option<f64>,
        channels: Vec<MonitorChannel>,
        json: bool,
    ) -> anyhow::Result<Self> {
        let duration = match duration_secs {
            Some(secs) => Duration::try_from_secs_f64(secs)
                .with_context(|| format!("invalid duration: {}", secs))?,
            None => Duration::from_millis(settings.monitor_duration_ms),
        };
        let channels = if channels.is_empty() {
            MonitorChannel::ALL.to_vec()
        } else {
            channels
        };
        Ok(Self {
            duration,
            report_interval: Duration::from_millis(settings.report_interval_ms.max(1)),
            channels,
            json,
        })
    }
}

const MONITORED_EVENTS: [EventKind; 9] = [
    EventKind::UartReceived,
    EventKind::TemperatureChanged,
    EventKind::AccelerometerChanged,
    EventKind::ButtonAChanged,
    EventKind::ButtonBChanged,
    EventKind::MagnetometerChanged,
    EventKind::BearingChanged,
    EventKind::Disconnection,
    EventKind::ServiceFailed,
];

async fn ensure_services(session: &MicrobitSession) -> anyhow::Result<()> {
    if !session.config().auto_start_services {
        let report = session.start_services().await?;
        info!("Started {} service(s)", report.started.len());
    }
    Ok(())
}

fn print_batch(out: &mut dyn Write, reporter: &mut BatchReporter, json: bool) -> anyhow::Result<()> {
    if let Some(batch) = reporter.flush() {
        let line = if json {
            batch.render_json()
        } else {
            batch.render_text()
        };
        writeln!(out, "{}", line)?;
        out.flush()?;
    }
    Ok(())
}

/// Connect, print batches until the duration elapses, the link drops or
/// `shutdown` resolves, then disconnect.
pub async fn monitor<F>(
    session: &MicrobitSession,
    simulated: Option<&Arc<SimulatedMicrobit>>,
    options: &MonitorOptions,
    out: &mut dyn Write,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let listeners = session.events().forward(&MONITORED_EVENTS, tx);

    let result = async {
        let device_name = session.connect(None).await?;
        ensure_services(session).await?;
        eprintln!("Connected to {}, monitoring for {:?}", device_name, options.duration);

        let feed = simulated.map(|device| device.spawn_sensor_feed(SIMULATED_FEED_INTERVAL));

        let mut reporter = BatchReporter::new(&options.channels);
        let mut ticker = tokio::time::interval(options.report_interval);
        ticker.tick().await;
        let deadline = tokio::time::sleep(options.duration);
        tokio::pin!(deadline);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = &mut shutdown => {
                    info!("Interrupted");
                    break;
                }
                _ = ticker.tick() => print_batch(out, &mut reporter, options.json)?,
                event = rx.recv() => match event {
                    Some(Event::Disconnection { .. }) | None => {
                        warn!("Link lost, stopping monitor");
                        break;
                    }
                    Some(Event::ServiceFailed { service, reason }) => {
                        warn!("{} failed: {}", service, reason);
                    }
                    Some(event) => {
                        reporter.record(&event);
                    }
                },
            }
        }

        print_batch(out, &mut reporter, options.json)?;
        if let Some(feed) = feed {
            feed.abort();
        }
        anyhow::Ok(())
    }
    .await;

    session.disconnect().await;
    for id in listeners {
        session.events().off(id);
    }
    result
}

/// Connect, write `text` once, disconnect
pub async fn send(session: &MicrobitSession, target: TextTarget, text: &str) -> anyhow::Result<()> {
    let result = async {
        let device_name = session.connect(None).await?;
        ensure_services(session).await?;
        session.send_text(target, text).await?;
        info!("Sent {:?} to {} ({:?})", text, device_name, target);
        anyhow::Ok(())
    }
    .await;
    session.disconnect().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::uuids;

    fn simulated_session() -> (MicrobitSession, Arc<SimulatedMicrobit>) {
        let device = Arc::new(SimulatedMicrobit::new(SIMULATED_NAME));
        let backend = Arc::new(SimulatedBackend::new(device.clone()));
        (MicrobitSession::new(backend, SessionConfig::default()), device)
    }

    #[test]
    fn test_cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "microbit-link",
            "monitor",
            "--simulate",
            "--name",
            "BBC",
            "--delay-ms",
            "50",
            "-c",
            "temperature",
            "-c",
            "button-a",
            "-vv",
        ]);
        assert!(cli.simulate);
        assert_eq!(cli.verbose, 2);
        let config = cli.session_config(&Settings::default()).unwrap();
        assert_eq!(config.name_prefix, "BBC");
        assert_eq!(config.address, None);
        assert_eq!(config.service_start_delay, Duration::from_millis(50));
        match cli.command {
            Command::Monitor { channels, .. } => assert_eq!(
                channels,
                vec![MonitorChannel::Temperature, MonitorChannel::ButtonA]
            ),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_scan_timeout_and_address() {
        let cli = Cli::parse_from([
            "microbit-link",
            "send",
            "uart",
            "hello",
            "--scan-timeout",
            "2.5",
            "--address",
            "D4:5C:0F:1A:2B:3C",
        ]);
        let config = cli.session_config(&Settings::default()).unwrap();
        assert_eq!(config.scan_timeout, Duration::from_millis(2500));
        assert_eq!(config.address.as_deref(), Some("D4:5C:0F:1A:2B:3C"));

        let defaults = Cli::parse_from(["microbit-link", "dashboard"])
            .session_config(&Settings::default())
            .unwrap();
        assert_eq!(
            defaults.scan_timeout,
            Duration::from_millis(Settings::default().scan_timeout_ms)
        );

        let negative = Cli::parse_from(["microbit-link", "dashboard", "--scan-timeout=-1"]);
        assert!(negative.session_config(&Settings::default()).is_err());
    }

    #[test]
    fn test_every_channel_is_monitored() {
        for channel in MonitorChannel::ALL {
            assert!(
                MONITORED_EVENTS.contains(&channel.event_kind()),
                "{} is never forwarded",
                channel.label()
            );
        }
    }

    #[test]
    fn test_cli_rejects_unknown_channel() {
        let parsed = Cli::try_parse_from(["microbit-link", "monitor", "-c", "gyroscope"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_monitor_options_default_to_all_channels() {
        let options = MonitorOptions::new(&Settings::default(), Some(2.5), Vec::new(), false).unwrap();
        assert_eq!(options.channels, MonitorChannel::ALL.to_vec());
        assert_eq!(options.duration, Duration::from_millis(2500));
        assert!(MonitorOptions::new(&Settings::default(), Some(-1.0), Vec::new(), false).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_writes_uart_line_and_disconnects() {
        let (session, device) = simulated_session();
        send(&session, TextTarget::Uart, "hi").await.unwrap();

        assert_eq!(device.writes_to(uuids::UART_RX), vec![b"hi\n".to_vec()]);
        assert!(!device.is_connected());
        assert!(!session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_prints_batches_until_duration() {
        let (session, device) = simulated_session();
        let options = MonitorOptions {
            duration: Duration::from_millis(2500),
            report_interval: Duration::from_secs(1),
            channels: vec![MonitorChannel::Accelerometer, MonitorChannel::Temperature],
            json: false,
        };
        let mut out = Vec::new();
        monitor(&session, Some(&device), &options, &mut out, std::future::pending())
            .await
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("accelerometer: x="));
        assert!(text.contains("temperature: "));
        assert!(!text.contains("magnetometer_bearing"));
        assert!(!device.is_connected());
        assert_eq!(session.events().listener_count(EventKind::TemperatureChanged), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_stops_when_link_drops() {
        let (session, device) = simulated_session();
        let options = MonitorOptions {
            duration: Duration::from_secs(3600),
            report_interval: Duration::from_secs(1),
            channels: MonitorChannel::ALL.to_vec(),
            json: true,
        };
        let dropper = device.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            dropper.notify(uuids::TEMPERATURE_DATA, &[21]);
            tokio::time::sleep(Duration::from_millis(10)).await;
            dropper.drop_link();
        });

        let mut out = Vec::new();
        monitor(&session, None, &options, &mut out, std::future::pending())
            .await
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        let line = text.lines().last().unwrap();
        let json: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(json["values"]["temperature"], "21°C");
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_reports_button_b() {
        let (session, device) = simulated_session();
        let options = MonitorOptions {
            duration: Duration::from_secs(3600),
            report_interval: Duration::from_secs(1),
            channels: vec![MonitorChannel::ButtonA, MonitorChannel::ButtonB],
            json: false,
        };
        let presser = device.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            presser.notify(uuids::BUTTON_B, &[1]);
            tokio::time::sleep(Duration::from_millis(10)).await;
            presser.drop_link();
        });

        let mut out = Vec::new();
        monitor(&session, None, &options, &mut out, std::future::pending())
            .await
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("button_b: state=1"), "{}", text);
        assert!(!text.contains("button_a:"));
    }
}
