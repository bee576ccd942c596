//! # Configuration
//!
//! Configuration used throughout the application
//!
//! The function [`get_config`] tries to read and parse the optional "config.json" file.
//!
//! If it succeeds, it returns the configuration from the JSON file.
//!
//! If it fails to find the file, it uses default values from [`crate::constants`].
//!
//! If the file is missing a field, the field will be assigned its default value from [`crate::constants`].
//!
//! If the file isn't formatted properly, or a value is out of range, an error is returned.
//!
//! ```json
//! {
//!     "max_workers": 8,
//!     "max_pipelined_requests": 5,
//!     "max_retries": 20,
//!     "retry_backoff_ms": 250
//! }
//! ```

use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::constants::{
    BLOCK_SIZE, CONFIG_FILE_PATH, EVENT_QUEUE_SIZE, MAX_PIPELINED_REQUESTS, MAX_WORKERS, PORT,
};
use crate::errors::ConfigError;

/// The application configuration
///
/// It can be stored in the optional [`CONFIG_FILE_PATH`] file, or if the file is not present,
/// default values will be read from [`crate::constants`].
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// How many pieces may be downloaded at the same time
    pub max_workers: usize,

    /// How many block requests may be in the middle of being sent on one connection
    pub max_pipelined_requests: usize,

    /// Maximum length of a requested block
    pub block_size: usize,

    /// Capacity of the per-connection event queue
    pub event_queue_size: usize,

    /// Port reported to the tracker
    pub port: u16,

    /// Attempts per piece before the download gives up; unlimited if absent.
    pub max_retries: Option<usize>,

    /// Delay before a failed piece goes back to the queue
    pub retry_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: MAX_WORKERS,
            max_pipelined_requests: MAX_PIPELINED_REQUESTS,
            block_size: BLOCK_SIZE,
            event_queue_size: EVENT_QUEUE_SIZE,
            port: PORT,
            max_retries: None,
            retry_backoff_ms: 0,
        }
    }
}

impl Config {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    fn validate(self) -> Result<Self, ConfigError> {
        let sizes = [
            ("max_workers", self.max_workers),
            ("max_pipelined_requests", self.max_pipelined_requests),
            ("block_size", self.block_size),
            ("event_queue_size", self.event_queue_size),
        ];
        if let Some((name, _)) = sizes.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroValue(name));
        }
        if self.max_retries == Some(0) {
            return Err(ConfigError::ZeroValue("max_retries"));
        }

        Ok(self)
    }
}

/// Tries to read and parse the optional "config.json" file from the working directory.
///
/// See [`read_config`].
pub fn get_config() -> Result<Config, ConfigError> {
    read_config(Path::new(CONFIG_FILE_PATH))
}

/// Tries to read and parse a JSON configuration file.
///
/// If the file doesn't exist, the default configuration is returned.
///
/// If the file is missing a field, the field will be assigned its default value from [`crate::constants`].
///
/// # Errors
/// - [`ConfigError::IoError`] if the file exists but can't be read,
/// - [`ConfigError::JsonError`] if it isn't formatted properly,
/// - [`ConfigError::ZeroValue`] if a size or count is zero.
pub fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Config::default()),
        Err(err) => return Err(err.into()),
    };

    let config: Config = serde_json::from_reader(BufReader::new(file))
        .map_err(|err| ConfigError::JsonError(path.display().to_string(), err))?;

    config.validate()
}
