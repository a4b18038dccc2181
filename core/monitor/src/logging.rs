use std::env;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "CIVIEWER_DEBUG_LOG";

/// Diagnostics go to stderr so stdout stays the event stream. With a log file,
/// records are also appended there through a non-blocking writer whose guard
/// must live until exit.
pub fn init(log_file: Option<&Path>) -> Result<Option<WorkerGuard>, String> {
    let filter = filter_from_env();

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|err| format!("Failed to initialize logging: {}", err))?;
        return Ok(None);
    };

    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| format!("Log file path has no file name: {}", path.display()))?;
    fs_err::create_dir_all(directory)
        .map_err(|err| format!("Failed to create log directory: {}", err))?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr.and(file_writer))
        .with_ansi(false)
        .try_init()
        .map_err(|err| format!("Failed to initialize logging: {}", err))?;
    Ok(Some(guard))
}

fn filter_from_env() -> EnvFilter {
    let debug_enabled = env::var(DEBUG_ENV)
        .map(|value| is_truthy(&value))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES")
}
