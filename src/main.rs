//! SetuHub - central message hub daemon for the Setu robotics framework

use setu_hub::app::HubApp;
use setu_hub::{logging, Config, Result};
use std::env;
use std::process::ExitCode;

/// Configuration file used when none is given on the command line.
const DEFAULT_CONFIG_PATH: &str = "/etc/setu-hub.toml";

fn main() -> ExitCode {
    logging::install();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            logging::critical(&format!("Terminating hub due to error condition: {}", e));
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = Config::load(&config_path)?;
    let app = HubApp::new(config)?;
    app.run()
}
