//! Agent configuration.
//!
//! Built once at startup from a JSON file, validated, then passed by
//! reference to each component. Secrets may be supplied through the process
//! environment (`API_KEY`, `DB_CONNECTION_STRING`) instead of the file; they
//! are resolved at load time only.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Wakeup marker the link layer applies to the first byte of each message.
pub const WAKEUP_BIT: u8 = 0x80;

fn default_baudrate() -> u32 {
    19_200
}

fn default_wakeup_bit() -> u8 {
    WAKEUP_BIT
}

fn default_max_retries() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_aft_poll_interval_ms() -> u64 {
    500
}

fn default_inter_byte_timeout_ms() -> u64 {
    20
}

fn default_response_timeout_ms() -> u64 {
    200
}

fn default_max_journal_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_freshness_window_s() -> u64 {
    30
}

fn default_denomination_cents() -> u64 {
    1
}

fn default_table_name() -> String {
    "gaming_transactions".into()
}

/// One meter the agent watches via the 2F meter poll.
#[derive(Clone, Debug, Deserialize)]
pub struct MeterDescriptor {
    /// SAS meter code.
    pub code: u8,
    /// BCD bytes the machine reports for this meter. Required: the per-meter
    /// width is not discoverable on the wire.
    pub length_bytes: usize,
    /// Whether a decrease on this meter is a reportable violation.
    #[serde(default)]
    pub monotonic: bool,
}

/// A long poll issued once when the link first reaches the polling state.
#[derive(Clone, Debug, Deserialize)]
pub struct StartupPoll {
    pub command: u8,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    // Serial link
    pub com_port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// EGM address on the link, 1..=127.
    pub address: u8,
    #[serde(default = "default_wakeup_bit")]
    pub wakeup_bit: u8,
    #[serde(default = "default_inter_byte_timeout_ms")]
    pub inter_byte_timeout_ms: u64,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    // Remote store (opaque to the core; handed to the store adapter)
    #[serde(default)]
    pub db_connection_string: String,
    #[serde(default)]
    pub db_driver: String,
    #[serde(default = "default_table_name")]
    pub table_name: String,

    // Backend command channel
    pub ws_server_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_freshness_window_s")]
    pub freshness_window_s: u64,

    // Polling
    pub listeners: Vec<MeterDescriptor>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_aft_poll_interval_ms")]
    pub aft_poll_interval_ms: u64,
    #[serde(default)]
    pub startup_polls: Vec<StartupPoll>,

    // Durable sink
    pub journal_path: PathBuf,
    #[serde(default = "default_max_journal_bytes")]
    pub max_journal_bytes: u64,

    // Machine identity
    pub asset_number: u32,
    /// Cents per EGM credit; jackpot amounts are converted before encoding.
    #[serde(default = "default_denomination_cents")]
    pub denomination_cents: u64,
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("reading {}: {err}", path.display())))?;

        let mut config: Config = serde_json::from_str(&raw)
            .map_err(|err| Error::Config(format!("parsing {}: {err}", path.display())))?;

        if let Ok(key) = std::env::var("API_KEY") {
            config.api_key = key;
        }
        if let Ok(conn) = std::env::var("DB_CONNECTION_STRING") {
            config.db_connection_string = conn;
        }

        config.validate()?;

        Ok(config)
    }

    /// Checks semantic constraints that survive parsing.
    pub fn validate(&self) -> Result<()> {
        if !(1..=127).contains(&self.address) {
            return Err(Error::Config(format!(
                "address {} outside 1..=127",
                self.address
            )));
        }

        if self.wakeup_bit != WAKEUP_BIT {
            return Err(Error::Config(format!(
                "wakeup_bit must be {WAKEUP_BIT}, got {}",
                self.wakeup_bit
            )));
        }

        if self.listeners.is_empty() {
            return Err(Error::Config("no meter listeners configured".into()));
        }

        for meter in &self.listeners {
            if meter.length_bytes == 0 || meter.length_bytes > 8 {
                return Err(Error::Config(format!(
                    "meter {:#04x}: length_bytes {} outside 1..=8",
                    meter.code, meter.length_bytes
                )));
            }
        }

        if self.denomination_cents == 0 {
            return Err(Error::Config("denomination_cents must be non-zero".into()));
        }

        if self.api_key.is_empty() {
            return Err(Error::Config(
                "api_key missing from file and environment".into(),
            ));
        }

        if self.max_journal_bytes == 0 {
            return Err(Error::Config("max_journal_bytes must be non-zero".into()));
        }

        Ok(())
    }
}
