//! Logging utilities for gothook
//!
//! The hook engine only emits `tracing` events; a subscriber is installed here when the
//! host asks for diagnostics (`set_debug`) or configures logging explicitly.
//! Supports both console and file logging with configurable options.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Global file logger handle
static FILE_LOGGER: Mutex<Option<File>> = Mutex::new(None);

/// Set once any subscriber has been installed from this module
static SUBSCRIBER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Logging configuration matching the `[logging]` table of the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable console (stderr) logging
    #[serde(default = "default_true")]
    pub console_enabled: bool,

    /// Enable file logging
    #[serde(default)]
    pub file_enabled: bool,

    /// Log file path
    #[serde(default = "default_log_path")]
    pub file_path: String,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include file/line info
    #[serde(default)]
    pub file_info: bool,

    /// Include module target
    #[serde(default = "default_true")]
    pub show_target: bool,

    /// Use ANSI colors
    #[serde(default)]
    pub ansi_colors: bool,

    /// Log level as string
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_log_path() -> String {
    "gothook.log".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enabled: true,
            file_enabled: false,
            file_path: default_log_path(),
            timestamps: true,
            file_info: false,
            show_target: true,
            ansi_colors: false,
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// Verbose configuration used by `set_debug(true)`
    pub fn debug() -> Self {
        Self {
            level: "debug".to_string(),
            file_info: true,
            ..Default::default()
        }
    }

    /// Create config with file logging enabled
    pub fn with_file(mut self, path: &str) -> Self {
        self.file_enabled = true;
        self.file_path = path.to_string();
        self
    }

    /// Set log level
    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    /// Parse level string to tracing Level
    pub fn get_level(&self) -> Level {
        match self.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

fn file_writer() -> Box<dyn Write + Send> {
    if let Ok(guard) = FILE_LOGGER.lock() {
        if let Some(ref file) = *guard {
            if let Ok(f) = file.try_clone() {
                return Box::new(f);
            }
        }
    }
    Box::new(std::io::sink())
}

/// Initialize logging with the given configuration
///
/// Only the first successful installation takes effect; if the host process already
/// installed a global subscriber this is a no-op.
pub fn init_logging(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.file_enabled && !config.file_path.is_empty() {
        if let Ok(file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.file_path)
        {
            if let Ok(mut guard) = FILE_LOGGER.lock() {
                *guard = Some(file);
            }
        }
    }

    let installed = if config.console_enabled && config.file_enabled {
        let console_layer = fmt::layer()
            .with_ansi(config.ansi_colors)
            .with_target(config.show_target)
            .with_file(config.file_info)
            .with_line_number(config.file_info)
            .with_writer(std::io::stderr);

        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_target(config.show_target)
            .with_file(config.file_info)
            .with_line_number(config.file_info)
            .with_writer(file_writer);

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer);

        tracing::subscriber::set_global_default(subscriber).is_ok()
    } else if config.file_enabled {
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_target(config.show_target)
            .with_file(config.file_info)
            .with_line_number(config.file_info)
            .with_writer(file_writer);

        let subscriber = tracing_subscriber::registry().with(filter).with(file_layer);

        tracing::subscriber::set_global_default(subscriber).is_ok()
    } else {
        let builder = fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_ansi(config.ansi_colors)
            .with_target(config.show_target)
            .with_file(config.file_info)
            .with_line_number(config.file_info)
            .with_writer(std::io::stderr);

        let result = if config.timestamps {
            builder.try_init()
        } else {
            builder.without_time().try_init()
        };
        result.is_ok()
    };

    if installed {
        SUBSCRIBER_INSTALLED.store(true, Ordering::SeqCst);
    }
}

/// Initialize debug logging
pub fn init_debug_logging() {
    init_logging(&LogConfig::debug());
}

/// Route diagnostics to stderr at debug level unless a subscriber is already active
pub fn enable_debug_output() {
    if SUBSCRIBER_INSTALLED.load(Ordering::SeqCst) {
        return;
    }
    init_debug_logging();
}

/// Whether this module installed the global subscriber
pub fn subscriber_installed() -> bool {
    SUBSCRIBER_INSTALLED.load(Ordering::SeqCst)
}
