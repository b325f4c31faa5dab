use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const LOG_FILE_PREFIX: &str = "pulse-hub";

/// Keeps the shared log file alive for the lifetime of the process.
pub struct LogGuard {
    file: Option<Arc<Mutex<File>>>,
}

impl LogGuard {
    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }
}

/// `--debug` forces debug level; otherwise `RUST_LOG`, then `PULSE_LOG_LEVEL`,
/// then info. The log file is named after `listen_addr`, so hubs on different
/// ports can share one log directory.
pub fn init_logging(debug: bool, log_dir: &str, listen_addr: &str) -> Option<LogGuard> {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("PULSE_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = if debug {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    let guard = match open_log_file(log_dir, listen_addr) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

/// `127.0.0.1:3503` becomes `pulse-hub-127.0.0.1-3503.log`.
pub fn log_file_name(listen_addr: &str) -> String {
    let mut name = String::from(LOG_FILE_PREFIX);
    let mut pending_dash = true;
    for ch in listen_addr.trim().chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' {
            if pending_dash {
                name.push('-');
                pending_dash = false;
            }
            name.push(ch);
        } else {
            pending_dash = true;
        }
    }
    name.push_str(".log");
    name
}

pub fn log_file_path(log_dir: &str, listen_addr: &str) -> Option<PathBuf> {
    let trimmed = log_dir.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(Path::new(trimmed).join(log_file_name(listen_addr)))
}

fn open_log_file(log_dir: &str, listen_addr: &str) -> io::Result<LogGuard> {
    let Some(path) = log_file_path(log_dir, listen_addr) else {
        return Ok(LogGuard { file: None });
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

/// Tees every formatted line to stdout and the optional log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}
