//! Configuration for the replication engine.
//!
//! Settings are grouped the way they are consumed: the resync pacing knobs
//! live on the device, the descriptor-ring and timeout knobs on the
//! transport, and the queue knobs on the worker. Everything deserializes
//! from TOML and carries defaults matching long-standing production
//! behavior.

use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumAlgorithm;
use crate::error::{Error, Result};

/// Behavior on lower-device I/O errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OnIoError {
    /// Keep going; the peer copy masks the error
    PassOn,
    /// Detach the local disk and continue diskless
    #[default]
    Detach,
}

/// Resync pacing and dependency settings, per device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Fixed resync rate in KiB/s, used when the dynamic controller is off
    pub resync_rate: u64,

    /// Controller plan-ahead in tenths of a second; 0 disables the
    /// dynamic controller (and with it the fifo)
    pub c_plan_ahead: u32,

    /// Fill target in sectors; when non-zero, overrides the delay target
    pub c_fill_target: u64,

    /// Delay target in tenths of a second
    pub c_delay_target: u64,

    /// Hard ceiling for the dynamic controller, in KiB/s
    pub c_max_rate: u64,

    /// Largest request the scheduler may coalesce, in bytes
    pub max_bio_size: u32,

    /// Minor number of the device this one resyncs after, if any
    pub resync_after: Option<u32>,

    /// Checksum transform for resync deduplication; `None` sends full
    /// blocks unconditionally
    pub csums_alg: Option<ChecksumAlgorithm>,

    /// Checksum transform for online verify
    pub verify_alg: Option<ChecksumAlgorithm>,

    /// What to do when the lower device reports an error
    pub on_io_error: OnIoError,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resync_rate: 250,
            c_plan_ahead: 20,
            c_fill_target: 0,
            c_delay_target: 10,
            c_max_rate: 102_400,
            max_bio_size: 1 << 20,
            resync_after: None,
            csums_alg: None,
            verify_alg: None,
            on_io_error: OnIoError::default(),
        }
    }
}

/// Which side of the connection this node takes during stream setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectRole {
    /// Actively resolve and connect to the peer
    #[default]
    Initiator,
    /// Bind, listen and accept the peer's connection
    Listener,
}

/// Transport tuning: descriptor rings, timeouts, buffers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Receive descriptors kept posted per stream
    pub max_rx: usize,

    /// Send work requests allowed in flight per stream
    pub max_tx: usize,

    /// Size of one DMA landing buffer in bytes
    pub page_size: usize,

    /// Receive timeout per stream in milliseconds
    pub recv_timeout_ms: u64,

    /// Address-resolution and route-resolution timeout in milliseconds
    pub resolve_timeout_ms: u64,

    /// Connection role for stream establishment
    pub role: ConnectRole,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_rx: 20,
            max_tx: 20,
            page_size: 4096,
            recv_timeout_ms: 10_000,
            resolve_timeout_ms: 2000,
            role: ConnectRole::default(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-device resync settings (applied to devices at creation)
    pub sync: SyncConfig,

    /// Transport settings
    pub transport: TransportConfig,
}

impl Config {
    /// Parse a configuration from a TOML string.
    pub fn from_toml(input: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(input).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.sync.max_bio_size < crate::bitmap::BM_BLOCK_SIZE {
            return Err(Error::config(format!(
                "max_bio_size {} below bitmap block size",
                self.sync.max_bio_size
            )));
        }
        if !self.sync.max_bio_size.is_power_of_two() {
            return Err(Error::config("max_bio_size must be a power of two"));
        }
        if self.sync.c_max_rate == 0 {
            return Err(Error::config("c_max_rate must be non-zero"));
        }
        if self.transport.max_rx == 0 || self.transport.max_tx == 0 {
            return Err(Error::config("descriptor ring sizes must be non-zero"));
        }
        if !self.transport.page_size.is_power_of_two() {
            return Err(Error::config("transport page_size must be a power of two"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.resync_rate, 250);
        assert_eq!(config.transport.max_rx, 20);
    }

    #[test]
    fn test_from_toml() {
        let config = Config::from_toml(
            r#"
            [sync]
            resync_rate = 1000
            c_plan_ahead = 0
            csums_alg = "crc32"

            [transport]
            max_rx = 64
            role = "listener"
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.resync_rate, 1000);
        assert_eq!(config.sync.c_plan_ahead, 0);
        assert_eq!(config.sync.csums_alg, Some(ChecksumAlgorithm::Crc32));
        assert_eq!(config.transport.max_rx, 64);
        assert_eq!(config.transport.role, ConnectRole::Listener);
    }

    #[test]
    fn test_rejects_bad_max_bio_size() {
        let mut config = Config::default();
        config.sync.max_bio_size = 1000;
        assert!(config.validate().is_err());
    }
}
