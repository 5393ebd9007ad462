use anyhow::Context;
use clap::Parser;
use microbit_link::domain::settings::{Settings, SettingsService};
use microbit_link::infrastructure::bluetooth::MicrobitSession;
use microbit_link::infrastructure::logging;
use microbit_link::presentation::app;
use microbit_link::presentation::cli::{self, Cli, Command, MonitorOptions};
use std::path::PathBuf;

fn load_settings() -> (Settings, Option<PathBuf>) {
    match SettingsService::new() {
        Ok(service) => (service.get().clone(), Some(service.path().to_path_buf())),
        Err(e) => {
            eprintln!("Failed to locate settings, using defaults: {}", e);
            (Settings::default(), None)
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (settings, settings_path) = load_settings();

    let _logging_guard = logging::init_logger(
        &settings.log_settings,
        logging::level_for_verbosity(cli.verbose),
    )
    .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
    .ok();

    tracing::info!("Starting micro:bit link");
    if let Some(path) = settings_path {
        tracing::debug!("Settings file: {}", path.display());
    }

    let config = cli.session_config(&settings)?;
    let (backend, simulated) = cli::select_backend(cli.simulate)?;

    if let Command::Dashboard = cli.command {
        return app::run_dashboard(backend, config, simulated);
    }

    let rt = tokio::runtime::Runtime::new().context("failed to start the tokio runtime")?;
    rt.block_on(async move {
        let session = MicrobitSession::new(backend, config);
        match cli.command {
            Command::Monitor {
                duration,
                channels,
                json,
            } => {
                let options = MonitorOptions::new(&settings, duration, channels, json)?;
                let mut stdout = std::io::stdout();
                let shutdown = async {
                    let _ = tokio::signal::ctrl_c().await;
                };
                cli::monitor(&session, simulated.as_ref(), &options, &mut stdout, shutdown).await
            }
            Command::Send { target, text } => cli::send(&session, target.into(), &text).await,
            Command::Dashboard => Ok(()),
        }
    })
}
