use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Installs the global subscriber. With `log_file`, events go to stderr and the file.
pub fn init(log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_level(true);

    let mut open_error = None;
    let file = log_file.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(err) => {
                open_error = Some((path.to_path_buf(), err));
                None
            }
        }
    });

    match file {
        Some(file) => {
            let _ = builder
                .with_ansi(false)
                .with_writer(io::stderr.and(Mutex::new(file)))
                .try_init();
        }
        None => {
            let _ = builder.with_writer(io::stderr).try_init();
        }
    }

    if let Some((path, err)) = open_error {
        tracing::warn!(path = %path.display(), error = %err, "cannot open log file, logging to stderr only");
    }
}
