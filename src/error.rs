//! Error types shared by every part of the gateway data plane.
//!
//! Most failures inside the gateway are isolated per tick, per topic, or per
//! register node and only ever reach the log. The [`Error`] enum is what those
//! log lines carry, and what configuration-level callers receive directly.
use std::time::Duration;

/// Represents all possible errors of the gateway core.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Opening a serial line or connecting to a broker failed.
    #[error("Cannot connect to {target}: {reason}")]
    Connection { target: String, reason: String },

    /// A field-bus function code that this gateway does not implement.
    #[error("Unsupported function code: {0}")]
    UnsupportedOperation(u8),

    /// A frame, command, or value that does not follow the expected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An operation needed a broker connection but none is active.
    #[error("Broker connection is not established")]
    NotConnected,

    /// A field device did not answer within its configured timeout.
    #[error("Device {address} did not respond within {timeout:?}")]
    Timeout { address: u8, timeout: Duration },

    /// A payload was expected to be JSON but is not.
    #[error("Cannot decode payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Unknown field device address {0}")]
    UnknownDevice(u8),

    #[error("No field-bus client for line {0}")]
    NoClient(String),

    #[error("Unknown digital output {0}")]
    UnknownOutput(String),

    #[error("No channel configuration for line {0}")]
    UnknownChannel(String),

    /// Wraps `tokio_modbus::Error`.
    #[error(transparent)]
    TokioError(#[from] tokio_modbus::Error),

    /// Wraps `tokio_modbus::ExceptionCode`.
    #[error(transparent)]
    TokioExceptionError(#[from] tokio_modbus::ExceptionCode),

    /// Wraps `paho_mqtt::Error`.
    #[error(transparent)]
    MqttError(#[from] paho_mqtt::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    ConfigError(#[from] serde_yaml::Error),
}

/// The result type of the gateway core.
pub type Result<T> = std::result::Result<T, Error>;
