//! Scenario configuration
//!
//! All timing knobs for a scenario run live here, expressed in
//! milliseconds and loadable from a TOML file. Two presets matter:
//! [`ScenarioConfig::leaking`] carries the constants that demonstrate the
//! leak, and [`ScenarioConfig::prompt`] is the control configuration in
//! which every registry entry is released.
//!
//! # Example
//!
//! ```toml
//! # Reaper scan cadence
//! scan_interval_ms = 10
//!
//! # How long the reaper waits after cancelling a transaction before
//! # driving its completion callbacks. 300000 postpones them past any
//! # reasonable process lifetime.
//! cancel_wait_ms = 300000
//!
//! # Transaction deadline
//! txn_timeout_ms = 5000
//!
//! # Shutdown drain for the reaper thread
//! drain_timeout_ms = 1000
//!
//! # Register the before-completion listener that blocks until rollback
//! wait_for_rollback = true
//! poll_interval_ms = 10
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use txreap_core::{Error, Result};

fn default_scan_interval_ms() -> u64 {
    10
}

fn default_cancel_wait_ms() -> u64 {
    300_000
}

fn default_txn_timeout_ms() -> u64 {
    5_000
}

fn default_drain_timeout_ms() -> u64 {
    1_000
}

fn default_wait_for_rollback() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    10
}

/// Timing and behavior knobs for one scenario run
///
/// Defaults are the leaking configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Reaper scan cadence in milliseconds
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Delay between the reaper cancelling a transaction and driving its
    /// completion callbacks, in milliseconds
    #[serde(default = "default_cancel_wait_ms")]
    pub cancel_wait_ms: u64,
    /// Transaction deadline in milliseconds
    #[serde(default = "default_txn_timeout_ms")]
    pub txn_timeout_ms: u64,
    /// How long to wait for the reaper to quiesce at shutdown, in
    /// milliseconds
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Whether the worker registers the before-completion listener that
    /// blocks until the transaction is rolled back
    #[serde(default = "default_wait_for_rollback")]
    pub wait_for_rollback: bool,
    /// Poll cadence of the blocking listener, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self::leaking()
    }
}

impl ScenarioConfig {
    /// The configuration that demonstrates the leak: 10 ms scans, 300 s
    /// cancel-wait, 5 s transaction timeout, blocking before-completion
    /// listener registered
    pub fn leaking() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
            cancel_wait_ms: default_cancel_wait_ms(),
            txn_timeout_ms: default_txn_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            wait_for_rollback: default_wait_for_rollback(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    /// Control configuration: short deadline, prompt completion, no
    /// blocking listener — every registry entry is released
    pub fn prompt() -> Self {
        Self {
            scan_interval_ms: 10,
            cancel_wait_ms: 20,
            txn_timeout_ms: 50,
            drain_timeout_ms: 1_000,
            wait_for_rollback: false,
            poll_interval_ms: 10,
        }
    }

    /// Validate that no cadence is zero
    ///
    /// # Errors
    /// `Error::Config` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.scan_interval_ms == 0 {
            return Err(Error::Config("scan_interval_ms must be nonzero".to_string()));
        }
        if self.txn_timeout_ms == 0 {
            return Err(Error::Config("txn_timeout_ms must be nonzero".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be nonzero".to_string()));
        }
        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "cannot read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Reaper scan cadence
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// Reaper cancel-wait period
    pub fn cancel_wait(&self) -> Duration {
        Duration::from_millis(self.cancel_wait_ms)
    }

    /// Transaction deadline
    pub fn txn_timeout(&self) -> Duration {
        Duration::from_millis(self.txn_timeout_ms)
    }

    /// Reaper shutdown drain
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Blocking-listener poll cadence
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
