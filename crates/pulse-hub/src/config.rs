use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3503;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 2;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_LOG_DIR: &str = ".pulse/logs";
const DEFAULT_SESSIONS_SUBDIR: &str = ".openclaw/agents";

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub sessions_dir: PathBuf,
    pub log_dir: String,
    pub debug: bool,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
}

impl Config {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            sessions_dir: default_sessions_dir(dirs::home_dir()),
            log_dir: DEFAULT_LOG_DIR.to_string(),
            debug: false,
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Parser, Debug, Default)]
#[command(name = "pulse-hub", about = "Streams agent session activity over WebSocket")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub port: String,
    #[arg(long, default_value = "")]
    pub host: String,
    #[arg(long, default_value = "")]
    pub poll_interval_ms: String,
    #[arg(long, default_value = "")]
    pub heartbeat_secs: String,
    #[arg(long, default_value = "")]
    pub sessions_dir: String,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value = "")]
    pub write_timeout_secs: String,
    #[arg(long, default_value = "")]
    pub queue_capacity: String,
}

/// Parses the command line and resolves every setting. Values that fail to
/// parse fall back to their default; the returned warnings describe each
/// fallback so they can be logged once logging is up.
pub fn load_config() -> (Config, Vec<String>) {
    resolve_config(Args::parse(), |key| std::env::var(key).ok())
}

pub fn resolve_config(args: Args, env: impl Fn(&str) -> Option<String>) -> (Config, Vec<String>) {
    let mut warnings = Vec::new();

    let port = resolve_number(
        "port",
        &args.port,
        env("PORT"),
        DEFAULT_PORT,
        &mut warnings,
    );
    let host = resolve_string(&args.host, env("PULSE_HOST"), DEFAULT_HOST);
    let poll_interval_ms = resolve_number(
        "poll-interval-ms",
        &args.poll_interval_ms,
        env("POLL_INTERVAL_MS"),
        DEFAULT_POLL_INTERVAL_MS,
        &mut warnings,
    );
    let heartbeat_secs = resolve_number(
        "heartbeat-secs",
        &args.heartbeat_secs,
        env("PULSE_HEARTBEAT_SECS"),
        DEFAULT_HEARTBEAT_SECS,
        &mut warnings,
    );
    let write_timeout_secs = resolve_number(
        "write-timeout-secs",
        &args.write_timeout_secs,
        None,
        DEFAULT_WRITE_TIMEOUT_SECS,
        &mut warnings,
    );
    let queue_capacity = resolve_number(
        "queue-capacity",
        &args.queue_capacity,
        None,
        DEFAULT_QUEUE_CAPACITY,
        &mut warnings,
    );

    let sessions_dir = match pick(&args.sessions_dir, env("PULSE_SESSIONS_DIR")) {
        Some(value) => PathBuf::from(value),
        None => default_sessions_dir(
            env("HOME")
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
                .or_else(dirs::home_dir),
        ),
    };
    let log_dir = resolve_string(&args.log_dir, env("PULSE_LOG_DIR"), DEFAULT_LOG_DIR);
    let debug = args.debug || env("PULSE_HUB_DEBUG").is_some_and(|value| is_truthy(&value));

    let config = Config {
        host,
        port,
        poll_interval: Duration::from_millis(poll_interval_ms),
        heartbeat_interval: Duration::from_secs(heartbeat_secs),
        sessions_dir,
        log_dir,
        debug,
        write_timeout: Duration::from_secs(write_timeout_secs),
        queue_capacity,
    };
    (config, warnings)
}

fn pick(flag: &str, env_value: Option<String>) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    env_value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_string(flag: &str, env_value: Option<String>, default: &str) -> String {
    pick(flag, env_value).unwrap_or_else(|| default.to_string())
}

/// Zero is rejected along with unparsable input: every numeric setting is an
/// interval, a port or a queue size.
fn resolve_number<T>(
    name: &str,
    flag: &str,
    env_value: Option<String>,
    default: T,
    warnings: &mut Vec<String>,
) -> T
where
    T: FromStr + PartialEq + Default + Copy + std::fmt::Display,
{
    let Some(raw) = pick(flag, env_value) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) if value != T::default() => value,
        _ => {
            warnings.push(format!("invalid {name} value {raw:?}, using {default}"));
            default
        }
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_sessions_dir(home: Option<PathBuf>) -> PathBuf {
    match home {
        Some(home) => home.join(DEFAULT_SESSIONS_SUBDIR),
        None => PathBuf::from(DEFAULT_SESSIONS_SUBDIR),
    }
}
