use std::{io, result};

use thiserror::Error;

/// Failures reported by the device for a single transfer.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Error)]
pub enum DeviceError {
    #[error("endpoint stalled")]
    Stall,

    #[error("device disconnected")]
    Disconnected,

    #[error("bus error")]
    Bus,
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum UsbError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,
}

/// Coarse classification of a [`UsbError`], handy for matching without caring about the payload.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    InvalidArgument,
    ResourceExhausted,
    Device,
    Timeout,
    Cancelled,
}

impl UsbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Device(_) => ErrorKind::Device,
            Self::Timeout => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// A disconnected device never comes back on the same handle, so streams stop resubmitting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Device(DeviceError::Disconnected))
    }
}

pub type Result<T, E = UsbError> = result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("i/o error: {0}")]
    IoError(#[from] io::Error),

    #[error("parse error: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(#[from] UsbError),
}
