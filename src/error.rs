//! Error taxonomy.
//!
//! Device and configuration failures have their own enums and convert into
//! the crate-level [`Error`].
//! None of these ever terminate the daemon: the loop logs and moves on.

use std::io;

use thiserror::Error as ThisError;

/// Device transport and lookup failures
#[derive(Debug, Clone, PartialEq, ThisError)]
pub enum DeviceError {
    #[error("device {0} not found")]
    NotFound(String),
    #[error("device {name} unreachable: {reason}")]
    Unreachable { name: String, reason: String },
    #[error("read of {name} failed: {reason}")]
    Read { name: String, reason: String },
    #[error("write to {name} failed: {reason}")]
    Write { name: String, reason: String },
    #[error("device {name} reported {value}, outside [0, 1]")]
    OutOfRange { name: String, value: f64 },
    #[error("system variable {0} not available")]
    Sysvar(String),
    #[error("backend unavailable: {0}")]
    Backend(String),
}

/// Parameter and definition problems
#[derive(Debug, Clone, PartialEq, ThisError)]
pub enum ConfigError {
    #[error("key {key}: {reason}")]
    InvalidKey { key: String, reason: String },
    #[error("window {window}: {reason}")]
    InvalidWindow { window: String, reason: String },
    #[error("activity {activity}: {reason}")]
    InvalidActivity { activity: String, reason: String },
    #[error("parameter file is not a JSON object")]
    NotAnObject,
}

/// Crate-level error
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("device: {0}")]
    Device(#[from] DeviceError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
