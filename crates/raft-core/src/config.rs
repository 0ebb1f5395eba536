//! # config
//!
//! why: keep the timing knobs of a node in one validated place
//! relations: held by node.rs, read by raft-runtime's driver loop
//! what: RaftConfig with serde defaults, validation, randomized election timeout

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};

/// Configuration for raft timing (all values in milliseconds)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound of the randomized election timeout
    pub election_timeout_max: u64,
    /// Interval between leader heartbeats
    pub heartbeat_interval: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 550,
            election_timeout_max: 883,
            heartbeat_interval: 100,
        }
    }
}

impl RaftConfig {
    /// Parse a JSON config, filling missing fields with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// The timeout range must be ordered and heartbeats must fire strictly
    /// faster than the shortest election timeout.
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::Config(format!(
                "election_timeout_min ({}) exceeds election_timeout_max ({})",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::Config(format!(
                "heartbeat_interval ({}) must be non-zero and below election_timeout_min ({})",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        Ok(())
    }

    /// Draw a fresh election timeout uniformly from `[min, max]`
    pub fn random_election_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.election_timeout_min..=self.election_timeout_max);
        Duration::from_millis(ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }
}
