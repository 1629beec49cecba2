use log::info;
use ephemera_models::errors::SendableError;

use crate::logger::{self, print_env};

/// Installs logging and the panic hook for a binary called `name`.
pub fn startup(name: &str, log_file: &str, log_level: &str) -> Result<(), SendableError> {
    let level = logger::parse_level(log_level)?;
    logger::setup_logger(log_file, level)?;
    log_panics::init();

    info!("--- {} ---", name);
    print_env()?;

    Ok(())
}
