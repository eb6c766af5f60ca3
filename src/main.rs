use std::path::PathBuf;

use famicore::app::{self, FamicoreApp};
use famicore::config::{CONFIG_FILE_NAME, EmulatorConfig};

fn main() -> anyhow::Result<()> {
    let config_path = PathBuf::from(CONFIG_FILE_NAME);
    let config = EmulatorConfig::load_or_default(&config_path).unwrap_or_else(|err| {
        eprintln!("ignoring settings: {err:#}");
        EmulatorConfig::default()
    });

    let options = eframe::NativeOptions {
        viewport: eframe::egui::ViewportBuilder::default()
            .with_inner_size(app::window_size(config.scale))
            .with_min_inner_size(app::window_size(1))
            .with_title("Famicore")
            .with_drag_and_drop(true),
        vsync: true,
        ..Default::default()
    };

    eframe::run_native(
        "Famicore",
        options,
        Box::new(move |cc| Ok(Box::new(FamicoreApp::new(cc, config, config_path)))),
    )
    .map_err(|err| anyhow::anyhow!("failed to run app: {err}"))
}
