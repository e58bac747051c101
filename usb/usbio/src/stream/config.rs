use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::Deserialize;

use crate::error::{ConfigError, Result, UsbError};

bitflags::bitflags! {
    #[derive(Default)]
    pub struct StreamFlags: u32 {
        /// Only submit full `max_transfer_size` chunks on write streams.
        const NO_PARTIAL_XFERS = 0x0010_0000;
        /// Bound blocking reads and writes by the milliseconds in `TIMEOUT_MASK`.
        const USE_TIMEOUT = 0x8000_0000;
        const TIMEOUT_MASK = 0x0001_FFFF;
    }
}

impl StreamFlags {
    /// Builds `USE_TIMEOUT` flags carrying `millis`, which must fit in `TIMEOUT_MASK`.
    pub fn with_timeout(millis: u32) -> Result<Self> {
        if millis > Self::TIMEOUT_MASK.bits() {
            return Err(UsbError::InvalidArgument("stream timeout out of range"));
        }
        Ok(Self::USE_TIMEOUT | Self::from_bits_truncate(millis))
    }

    pub fn timeout(self) -> Option<Duration> {
        if self.contains(Self::USE_TIMEOUT) {
            let millis = (self & Self::TIMEOUT_MASK).bits();
            Some(Duration::from_millis(u64::from(millis)))
        } else {
            None
        }
    }

    pub fn no_partial_xfers(self) -> bool {
        self.contains(Self::NO_PARTIAL_XFERS)
    }
}

const FLAG_NAMES: &[&str] = &["NO_PARTIAL_XFERS"];

fn deserialize_flags<'de, D>(deserializer: D) -> Result<StreamFlags, D::Error>
where
    D: Deserializer<'de>,
{
    let names = Vec::<String>::deserialize(deserializer)?;
    names
        .iter()
        .try_fold(StreamFlags::empty(), |flags, name| match name.as_str() {
            "NO_PARTIAL_XFERS" => Ok(flags | StreamFlags::NO_PARTIAL_XFERS),
            other => Err(de::Error::unknown_variant(other, FLAG_NAMES)),
        })
}

/// Sizing of a [`PipeStream`](super::PipeStream).
///
/// ```toml
/// max_transfer_size = 4096
/// max_pending_transfers = 16
/// max_pending_io = 4
/// flags = ["NO_PARTIAL_XFERS"]
/// timeout_ms = 1000
/// ```
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct StreamConfig {
    pub max_transfer_size: usize,
    pub max_pending_transfers: usize,
    pub max_pending_io: usize,
    #[serde(default, deserialize_with = "deserialize_flags")]
    pub flags: StreamFlags,
    #[serde(default)]
    pub timeout_ms: Option<u32>,
}

impl StreamConfig {
    pub fn new(max_transfer_size: usize, max_pending_transfers: usize, max_pending_io: usize) -> Self {
        Self {
            max_transfer_size,
            max_pending_transfers,
            max_pending_io,
            flags: StreamFlags::empty(),
            timeout_ms: None,
        }
    }

    pub fn with_flags(mut self, flags: StreamFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Checks the sizing. A `max_pending_io` above `max_pending_transfers` is not an error, the
    /// stream simply never has more transfers in flight than it has contexts.
    pub fn validate(&self) -> Result<()> {
        if self.max_transfer_size == 0 {
            return Err(UsbError::InvalidArgument("max_transfer_size must be non-zero"));
        }
        if self.max_pending_transfers == 0 {
            return Err(UsbError::InvalidArgument("max_pending_transfers must be non-zero"));
        }
        if self.max_pending_io == 0 {
            return Err(UsbError::InvalidArgument("max_pending_io must be non-zero"));
        }
        self.effective_flags().map(|_| ())
    }

    /// The flags with the configured timeout folded in.
    pub fn effective_flags(&self) -> Result<StreamFlags> {
        match self.timeout_ms {
            Some(millis) => Ok(self.flags | StreamFlags::with_timeout(millis)?),
            None => Ok(self.flags),
        }
    }
}
