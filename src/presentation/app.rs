use crate::domain::events::{Event, EventKind};
use crate::domain::models::{
    Button, ButtonState, ConnectionState, MessageSeverity, StatusMessage, Vector3,
};
use crate::infrastructure::bluetooth::protocol::ServiceKind;
use crate::infrastructure::bluetooth::simulated::SimulatedMicrobit;
use crate::infrastructure::bluetooth::{BleBackend, MicrobitSession, SessionConfig, TextTarget};
use crate::presentation::components::Components;
use eframe::egui;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

const UART_LOG_LINES: usize = 200;
const SIMULATED_FEED_INTERVAL: Duration = Duration::from_millis(100);

/// Requests from the window to the session worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Connect,
    Disconnect,
    StartServices,
    SendText(TextTarget, String),
}

/// Everything the window shows, updated from session events
#[derive(Debug, Default)]
pub struct DashboardState {
    pub connection: Option<ConnectionState>,
    pub device_name: Option<String>,
    pub services: Vec<ServiceKind>,
    pub temperature: Option<i8>,
    pub accelerometer: Option<Vector3>,
    pub magnetometer: Option<Vector3>,
    pub bearing: Option<u16>,
    pub button_a: Option<ButtonState>,
    pub button_b: Option<ButtonState>,
    pub uart_log: VecDeque<String>,
    pub status_message: Option<StatusMessage>,
}

impl DashboardState {
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.unwrap_or(ConnectionState::Disconnected)
    }

    pub fn apply(&mut self, event: Event) {
        match event {
            Event::Connection { device_name } => {
                self.connection = Some(ConnectionState::Connected);
                self.status_message = Some(StatusMessage {
                    message: format!("Connected to {}", device_name),
                    severity: MessageSeverity::Success,
                });
                self.device_name = Some(device_name);
                self.services.clear();
            }
            Event::Disconnection { .. } => {
                self.connection = Some(ConnectionState::Disconnected);
                self.services.clear();
                self.status_message = Some(StatusMessage {
                    message: "Disconnected".to_string(),
                    severity: MessageSeverity::Warning,
                });
            }
            Event::UartReceived { text } => {
                for line in text.lines().filter(|l| !l.trim().is_empty()) {
                    if self.uart_log.len() == UART_LOG_LINES {
                        self.uart_log.pop_front();
                    }
                    self.uart_log.push_back(line.to_string());
                }
            }
            Event::TemperatureChanged { celsius } => self.temperature = Some(celsius),
            Event::AccelerometerChanged { milli_g } => self.accelerometer = Some(milli_g),
            Event::MagnetometerChanged { field } => self.magnetometer = Some(field),
            Event::BearingChanged { degrees } => self.bearing = Some(degrees),
            Event::ButtonChanged { button, state, .. } => match button {
                Button::A => self.button_a = Some(state),
                Button::B => self.button_b = Some(state),
            },
            Event::ServiceStarted { service } => {
                if !self.services.contains(&service) {
                    self.services.push(service);
                }
            }
            Event::ServiceFailed { service, reason } => {
                self.status_message = Some(StatusMessage {
                    message: format!("{} unavailable: {}", service, reason),
                    severity: MessageSeverity::Warning,
                });
            }
            Event::Error { message, .. } => {
                // A failed connect only reports an error; no disconnection follows
                if self.connection == Some(ConnectionState::Connecting) {
                    self.connection = Some(ConnectionState::Disconnected);
                }
                self.status_message = Some(StatusMessage {
                    message,
                    severity: MessageSeverity::Error,
                });
            }
        }
    }
}

/// Run the session on its own thread; commands in, events out
fn spawn_session_worker(
    session: MicrobitSession,
    simulated: Option<Arc<SimulatedMicrobit>>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    repaint: egui::Context,
) {
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!("Failed to create tokio runtime for Bluetooth: {}", e);
                return;
            }
        };

        rt.block_on(async move {
            let mut feed = None;
            while let Some(cmd) = commands.recv().await {
                // Failures reach the window as error events
                match cmd {
                    SessionCommand::Connect => {
                        if session.connect(None).await.is_ok() {
                            if let Some(device) = &simulated {
                                feed = Some(device.spawn_sensor_feed(SIMULATED_FEED_INTERVAL));
                            }
                        }
                    }
                    SessionCommand::Disconnect => {
                        session.disconnect().await;
                        if let Some(feed) = feed.take() {
                            feed.abort();
                        }
                    }
                    SessionCommand::StartServices => {
                        let _ = session.start_services().await;
                    }
                    SessionCommand::SendText(target, text) => {
                        let _ = session.send_text(target, &text).await;
                    }
                }
                repaint.request_repaint();
            }
            session.disconnect().await;
            info!("Session worker stopped");
        });
    });
}

pub struct MicrobitApp {
    commands: mpsc::UnboundedSender<SessionCommand>,
    events: mpsc::UnboundedReceiver<Event>,
    state: DashboardState,
    auto_start_services: bool,
    uart_input: String,
    led_input: String,
}

impl MicrobitApp {
    pub fn new(
        cc: &eframe::CreationContext<'_>,
        backend: Arc<dyn BleBackend>,
        config: SessionConfig,
        simulated: Option<Arc<SimulatedMicrobit>>,
    ) -> Self {
        let auto_start_services = config.auto_start_services;
        let session = MicrobitSession::new(backend, config);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        session.events().forward(&EventKind::ALL, event_tx);
        // Events arrive on the worker thread, wake the window for them
        let repaint = cc.egui_ctx.clone();
        session.events().on_each(&EventKind::ALL, move |_| {
            repaint.request_repaint();
            Ok(())
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        spawn_session_worker(session, simulated, cmd_rx, cc.egui_ctx.clone());

        Self {
            commands: cmd_tx,
            events: event_rx,
            state: DashboardState::default(),
            auto_start_services,
            uart_input: String::new(),
            led_input: String::new(),
        }
    }

    fn send(&mut self, command: SessionCommand) {
        if self.commands.send(command).is_err() {
            self.state.status_message = Some(StatusMessage {
                message: "Bluetooth worker is not running".to_string(),
                severity: MessageSeverity::Error,
            });
        }
    }

    fn ui_connection_panel(&mut self, ui: &mut egui::Ui) {
        Components::card(ui, "Connection", |ui| {
            Components::connection_banner(
                ui,
                self.state.connection_state(),
                self.state.device_name.as_deref(),
            );
            ui.add_space(8.0);

            ui.horizontal(|ui| match self.state.connection_state() {
                ConnectionState::Connected => {
                    if ui.button("Disconnect").clicked() {
                        self.send(SessionCommand::Disconnect);
                    }
                    if !self.auto_start_services && ui.button("Start services").clicked() {
                        self.send(SessionCommand::StartServices);
                    }
                }
                ConnectionState::Connecting => {
                    ui.spinner();
                }
                ConnectionState::Disconnected => {
                    if ui.button("Connect").clicked() {
                        self.state.connection = Some(ConnectionState::Connecting);
                        self.send(SessionCommand::Connect);
                    }
                }
            });

            if !self.state.services.is_empty() {
                let names: Vec<&str> = self.state.services.iter().map(|s| s.name()).collect();
                ui.label(format!("Services: {}", names.join(", ")));
            }

            if let Some(msg) = &self.state.status_message {
                ui.colored_label(Components::severity_color(msg.severity), &msg.message);
            }
        });
    }

    fn ui_readings_panel(&self, ui: &mut egui::Ui) {
        Components::card(ui, "Sensors", |ui| {
            egui::Grid::new("readings")
                .num_columns(2)
                .spacing([24.0, 4.0])
                .show(ui, |ui| {
                    let state = &self.state;
                    Components::reading_row(
                        ui,
                        "Temperature",
                        state.temperature.map(|c| format!("{} °C", c)),
                    );
                    Components::reading_row(
                        ui,
                        "Accelerometer (mg)",
                        state.accelerometer.map(|v| v.to_string()),
                    );
                    Components::reading_row(
                        ui,
                        "Magnetometer",
                        state.magnetometer.map(|v| v.to_string()),
                    );
                    Components::reading_row(ui, "Bearing", state.bearing.map(|d| format!("{}°", d)));
                    Components::reading_row(ui, "Button A", state.button_a.map(|s| s.to_string()));
                    Components::reading_row(ui, "Button B", state.button_b.map(|s| s.to_string()));
                });
        });
    }

    fn ui_output_panel(&mut self, ui: &mut egui::Ui) {
        let connected = self.state.connection_state() == ConnectionState::Connected;
        let mut outgoing = Vec::new();

        Components::card(ui, "Output", |ui| {
            ui.add_enabled_ui(connected, |ui| {
                ui.horizontal(|ui| {
                    ui.label("UART:");
                    let edit = ui.text_edit_singleline(&mut self.uart_input);
                    let submitted =
                        edit.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter));
                    if (ui.button("Send").clicked() || submitted) && !self.uart_input.is_empty() {
                        outgoing.push(SessionCommand::SendText(
                            TextTarget::Uart,
                            std::mem::take(&mut self.uart_input),
                        ));
                    }
                });
                ui.horizontal(|ui| {
                    ui.label("LED:");
                    ui.text_edit_singleline(&mut self.led_input);
                    if ui.button("Scroll").clicked() && !self.led_input.is_empty() {
                        outgoing.push(SessionCommand::SendText(
                            TextTarget::Led,
                            std::mem::take(&mut self.led_input),
                        ));
                    }
                });
            });
        });

        for command in outgoing {
            self.send(command);
        }
    }

    fn ui_uart_log(&self, ui: &mut egui::Ui) {
        Components::card(ui, "UART log", |ui| {
            egui::ScrollArea::vertical()
                .max_height(200.0)
                .stick_to_bottom(true)
                .show(ui, |ui| {
                    for line in &self.state.uart_log {
                        ui.monospace(line);
                    }
                });
        });
    }
}

impl eframe::App for MicrobitApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        while let Ok(event) = self.events.try_recv() {
            self.state.apply(event);
        }

        egui::CentralPanel::default().show(ctx, |ui| {
            egui::ScrollArea::vertical().show(ui, |ui| {
                ui.heading("micro:bit");
                ui.add_space(10.0);
                self.ui_connection_panel(ui);
                ui.add_space(10.0);
                self.ui_readings_panel(ui);
                ui.add_space(10.0);
                self.ui_output_panel(ui);
                ui.add_space(10.0);
                self.ui_uart_log(ui);
            });
        });
    }
}

/// Open the dashboard window; blocks until it is closed
pub fn run_dashboard(
    backend: Arc<dyn BleBackend>,
    config: SessionConfig,
    simulated: Option<Arc<SimulatedMicrobit>>,
) -> anyhow::Result<()> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([520.0, 720.0])
            .with_title("micro:bit link"),
        ..Default::default()
    };

    eframe::run_native(
        "micro:bit link",
        options,
        Box::new(move |cc| Ok(Box::new(MicrobitApp::new(cc, backend, config, simulated)))),
    )
    .map_err(|e| anyhow::anyhow!("dashboard failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_tracks_readings() {
        let mut state = DashboardState::default();
        assert_eq!(state.connection_state(), ConnectionState::Disconnected);

        state.apply(Event::Connection {
            device_name: "BBC micro:bit".into(),
        });
        state.apply(Event::ServiceStarted {
            service: ServiceKind::Uart,
        });
        state.apply(Event::TemperatureChanged { celsius: -24 });
        state.apply(Event::ButtonChanged {
            button: Button::B,
            pressed: true,
            state: ButtonState::LongPress,
        });

        assert_eq!(state.connection_state(), ConnectionState::Connected);
        assert_eq!(state.services, vec![ServiceKind::Uart]);
        assert_eq!(state.temperature, Some(-24));
        assert_eq!(state.button_b, Some(ButtonState::LongPress));
        assert_eq!(state.button_a, None);

        state.apply(Event::Disconnection { device_name: None });
        assert_eq!(state.connection_state(), ConnectionState::Disconnected);
        assert!(state.services.is_empty());
        // Last known values stay visible
        assert_eq!(state.temperature, Some(-24));
    }

    #[test]
    fn test_uart_log_splits_lines_and_is_bounded() {
        let mut state = DashboardState::default();
        state.apply(Event::UartReceived {
            text: "one\ntwo\n".into(),
        });
        assert_eq!(state.uart_log, vec!["one".to_string(), "two".to_string()]);

        for i in 0..UART_LOG_LINES {
            state.apply(Event::UartReceived {
                text: format!("line {}\n", i),
            });
        }
        assert_eq!(state.uart_log.len(), UART_LOG_LINES);
        assert_eq!(state.uart_log.back().map(String::as_str), Some("line 199"));
    }

    #[test]
    fn test_errors_become_status_messages() {
        let mut state = DashboardState::default();
        state.apply(Event::Error {
            service: None,
            message: "write failed".into(),
        });
        let msg = state.status_message.unwrap();
        assert_eq!(msg.severity, MessageSeverity::Error);
        assert_eq!(msg.message, "write failed");
    }

    #[test]
    fn test_failed_connect_leaves_connecting() {
        let mut state = DashboardState {
            connection: Some(ConnectionState::Connecting),
            ..DashboardState::default()
        };
        state.apply(Event::Error {
            service: None,
            message: "no micro:bit was selected".into(),
        });
        assert_eq!(state.connection_state(), ConnectionState::Disconnected);

        // Errors on a live link keep it connected
        state.apply(Event::Connection {
            device_name: "BBC micro:bit [vuvot]".into(),
        });
        state.apply(Event::Error {
            service: Some(ServiceKind::Led),
            message: "write failed".into(),
        });
        assert_eq!(state.connection_state(), ConnectionState::Connected);
    }
}
