//! Error types and handling for systemcalc
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting.

use thiserror::Error;

/// Result type alias for systemcalc operations
pub type Result<T> = std::result::Result<T, SystemCalcError>;

/// Main error type for systemcalc
#[derive(Debug, Error)]
pub enum SystemCalcError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// D-Bus communication errors
    #[error("D-Bus error: {message}")]
    DBus { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Relay GPIO errors
    #[error("Relay error: {message}")]
    Relay { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl SystemCalcError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        SystemCalcError::Config {
            message: message.into(),
        }
    }

    /// Create a new D-Bus error
    pub fn dbus<S: Into<String>>(message: S) -> Self {
        SystemCalcError::DBus {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        SystemCalcError::Io {
            message: message.into(),
        }
    }

    /// Create a new relay error
    pub fn relay<S: Into<String>>(message: S) -> Self {
        SystemCalcError::Relay {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        SystemCalcError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        SystemCalcError::Generic {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for SystemCalcError {
    fn from(err: std::io::Error) -> Self {
        SystemCalcError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for SystemCalcError {
    fn from(err: serde_yaml::Error) -> Self {
        SystemCalcError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SystemCalcError {
    fn from(err: serde_json::Error) -> Self {
        SystemCalcError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<zbus::Error> for SystemCalcError {
    fn from(err: zbus::Error) -> Self {
        SystemCalcError::dbus(err.to_string())
    }
}
