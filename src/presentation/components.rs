use crate::domain::models::{ConnectionState, MessageSeverity};
use eframe::egui;

pub struct Components;

impl Components {
    pub fn card<R>(
        ui: &mut egui::Ui,
        title: &str,
        add_contents: impl FnOnce(&mut egui::Ui) -> R,
    ) -> R {
        let stroke = ui.style().visuals.widgets.noninteractive.bg_stroke;
        let bg = ui.style().visuals.widgets.noninteractive.bg_fill;

        egui::Frame::none()
            .inner_margin(egui::Margin::same(12.0))
            .stroke(stroke)
            .fill(bg)
            .show(ui, |ui| {
                ui.vertical(|ui| {
                    ui.label(egui::RichText::new(title).strong().size(16.0));
                    ui.add_space(6.0);
                    add_contents(ui)
                })
                .inner
            })
            .inner
    }

    pub fn connection_banner(ui: &mut egui::Ui, state: ConnectionState, device: Option<&str>) {
        let (text, bg_color, text_color) = match state {
            ConnectionState::Connected => (
                format!("CONNECTED  {}", device.unwrap_or_default()),
                egui::Color32::from_rgb(0, 200, 0),
                egui::Color32::BLACK,
            ),
            ConnectionState::Connecting => (
                "CONNECTING...".to_string(),
                egui::Color32::from_rgb(255, 200, 0),
                egui::Color32::BLACK,
            ),
            ConnectionState::Disconnected => (
                "DISCONNECTED".to_string(),
                egui::Color32::from_gray(100),
                egui::Color32::WHITE,
            ),
        };

        ui.add_sized(
            [ui.available_width(), 30.0],
            egui::Label::new(
                egui::RichText::new(text)
                    .color(text_color)
                    .background_color(bg_color)
                    .size(15.0)
                    .strong(),
            )
            .wrap_mode(egui::TextWrapMode::Extend),
        );
    }

    pub fn severity_color(severity: MessageSeverity) -> egui::Color32 {
        match severity {
            MessageSeverity::Info => egui::Color32::LIGHT_BLUE,
            MessageSeverity::Success => egui::Color32::from_rgb(0, 160, 0),
            MessageSeverity::Warning => egui::Color32::from_rgb(230, 160, 0),
            MessageSeverity::Error => egui::Color32::from_rgb(220, 40, 40),
        }
    }

    /// One label/value row inside a `Grid`; a dash until a value arrived
    pub fn reading_row(ui: &mut egui::Ui, label: &str, value: Option<String>) {
        ui.label(label);
        match value {
            Some(value) => ui.monospace(value),
            None => ui.weak("-"),
        };
        ui.end_row();
    }
}
