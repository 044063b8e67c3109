//! Server configuration loaded from environment variables.
//!
//! Every setting has a default so the relay starts with zero
//! configuration for local development.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::transfer::DEFAULT_MAX_FILE_SIZE;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the TCP listener binds to.
    /// Env: `BIND_ADDR`
    /// Default: `127.0.0.1:8080`
    pub bind_addr: String,

    /// Outbound mailbox depth per session. A full mailbox drops messages.
    /// Env: `MAILBOX_CAPACITY`
    /// Default: `100`
    pub mailbox_capacity: usize,

    /// Request queue depth per room actor.
    /// Env: `ROOM_QUEUE_CAPACITY`
    /// Default: `100`
    pub room_queue_capacity: usize,

    /// Request queue depth of the dispatch hub.
    /// Env: `HUB_QUEUE_CAPACITY`
    /// Default: `256`
    pub hub_queue_capacity: usize,

    /// Root of the received-file area.
    /// Env: `DOWNLOAD_DIR`
    /// Default: `./downloads`
    pub download_dir: PathBuf,

    /// Keep-alive period; `None` disables pings.
    /// Env: `PING_INTERVAL_SECS` (0 disables)
    /// Default: 60 seconds
    pub ping_interval: Option<Duration>,

    /// Longest inbound line accepted, in bytes.
    /// Env: `MAX_LINE_LENGTH`
    /// Default: 1 MiB
    pub max_line_length: usize,

    /// Largest declared file size accepted for a transfer, in bytes.
    /// Env: `MAX_FILE_SIZE`
    /// Default: 1 GiB
    pub max_file_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            mailbox_capacity: 100,
            room_queue_capacity: 100,
            hub_queue_capacity: 256,
            download_dir: PathBuf::from("downloads"),
            ping_interval: Some(Duration::from_secs(60)),
            max_line_length: 1024 * 1024,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("BIND_ADDR") {
            config.bind_addr = addr;
        }

        if let Some(n) = parse_positive(&lookup, "MAILBOX_CAPACITY") {
            config.mailbox_capacity = n;
        }
        if let Some(n) = parse_positive(&lookup, "ROOM_QUEUE_CAPACITY") {
            config.room_queue_capacity = n;
        }
        if let Some(n) = parse_positive(&lookup, "HUB_QUEUE_CAPACITY") {
            config.hub_queue_capacity = n;
        }
        if let Some(n) = parse_positive(&lookup, "MAX_LINE_LENGTH") {
            config.max_line_length = n;
        }

        if let Some(n) = parse::<u64>(&lookup, "MAX_FILE_SIZE") {
            config.max_file_size = n;
        }

        if let Some(dir) = lookup("DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }

        if let Some(secs) = parse::<u64>(&lookup, "PING_INTERVAL_SECS") {
            config.ping_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = lookup(key)?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %value, "Invalid setting, using default");
            None
        }
    }
}

/// Channel capacities must be non-zero
fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    match parse::<usize>(lookup, key)? {
        0 => {
            tracing::warn!(key, "Setting must be positive, using default");
            None
        }
        n => Some(n),
    }
}
