//! Error types for the DogBot host API.

use thiserror::Error;

/// Errors surfaced by the transport, protocol, device and homing layers.
#[derive(Error, Debug)]
pub enum DogBotError {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown device id: {0}")]
    UnknownDevice(u8),

    #[error("device {0} has not completed homing")]
    NotHomed(u8),

    #[error("device {0} position is not absolute")]
    NotAbsolute(u8),

    #[error("homing timed out for device {0}")]
    HomingTimeout(u8),

    #[error("homing aborted after too many cycles for device {0}")]
    HomingTooManyCycles(u8),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lost contact with device {0}")]
    LostContact(u8),

    #[error("no transport attached")]
    NoTransport,
}

pub type Result<T> = std::result::Result<T, DogBotError>;
