use std::path::Path;
use std::str::FromStr;
use std::{env, time::SystemTime};

use ephemera_models::errors::{RuntimeError, SendableError};
use log::{LevelFilter, info};

pub fn parse_level(level: &str) -> Result<LevelFilter, SendableError> {
    LevelFilter::from_str(level).map_err(|_| -> SendableError {
        Box::new(RuntimeError::new(
            "invalid_log_level",
            format!("unknown log level '{}'", level),
        ))
    })
}

fn dispatch(level: LevelFilter) -> fern::Dispatch {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .level_for("sqlx", sqlx_level(level))
}

/// sqlx logs every statement at debug, so it stays at warn unless the run
/// itself asks for debug output.
fn sqlx_level(level: LevelFilter) -> LevelFilter {
    if level >= LevelFilter::Debug {
        level
    } else {
        level.min(LevelFilter::Warn)
    }
}

pub fn setup_logger(log_file: impl AsRef<Path>, level: LevelFilter) -> Result<(), SendableError> {
    dispatch(level)
        .chain(std::io::stdout())
        .chain(fern::log_file(log_file)?)
        .apply()?;
    Ok(())
}

pub fn print_env() -> std::io::Result<()> {
    let path = env::current_dir()?;
    info!("The current directory is {}", path.display());
    Ok(())
}
