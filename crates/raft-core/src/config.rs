//! # config
//!
//! why: keep every tunable of the engine in one serializable place
//! relations: consumed by node.rs (timers, rng seed) and progress.rs (window)
//! what: RaftConfig with defaults, builder methods, JSON loading, validation

use crate::error::{RaftError, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the Raft engine. All durations are in logical ticks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound (inclusive) of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound (exclusive) of the randomized election timeout
    pub election_timeout_max: u64,
    /// Ticks between leader heartbeats
    pub heartbeat_interval: u64,
    /// Outstanding append requests allowed per peer in Replicate state
    pub max_inflight: usize,
    /// Maximum number of entries carried by one append
    pub max_entries_per_msg: usize,
    /// Run a PreVote round before bumping the term
    pub pre_vote: bool,
    /// Leader steps down when it has not heard from a quorum for an election
    /// timeout; followers ignore vote requests while a leader is live
    pub check_quorum: bool,
    /// Seed for election timeout randomization
    pub seed: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 10,
            election_timeout_max: 20,
            heartbeat_interval: 1,
            max_inflight: 2,
            max_entries_per_msg: 64,
            pre_vote: true,
            check_quorum: false,
            seed: 0,
        }
    }
}

impl RaftConfig {
    /// Load a config from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| RaftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_election_timeout(mut self, min: u64, max: u64) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: u64) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_inflight(mut self, max_inflight: usize) -> Self {
        self.max_inflight = max_inflight;
        self
    }

    pub fn with_max_entries_per_msg(mut self, max: usize) -> Self {
        self.max_entries_per_msg = max;
        self
    }

    pub fn with_pre_vote(mut self, pre_vote: bool) -> Self {
        self.pre_vote = pre_vote;
        self
    }

    pub fn with_check_quorum(mut self, check_quorum: bool) -> Self {
        self.check_quorum = check_quorum;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval == 0 {
            return Err(RaftError::Config(
                "heartbeat interval must be positive".into(),
            ));
        }
        if self.election_timeout_min <= self.heartbeat_interval {
            return Err(RaftError::Config(format!(
                "election timeout {} must exceed heartbeat interval {}",
                self.election_timeout_min, self.heartbeat_interval
            )));
        }
        if self.election_timeout_max <= self.election_timeout_min {
            return Err(RaftError::Config(format!(
                "election timeout range {}..{} is empty",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.max_inflight == 0 {
            return Err(RaftError::Config("max inflight must be positive".into()));
        }
        if self.max_entries_per_msg == 0 {
            return Err(RaftError::Config(
                "max entries per message must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RaftConfig::default().validate().is_ok());
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = RaftConfig::from_json(r#"{"max_inflight": 8, "seed": 42}"#).unwrap();
        assert_eq!(config.max_inflight, 8);
        assert_eq!(config.seed, 42);
        assert_eq!(config.election_timeout_min, 10);
        assert!(config.pre_vote);
    }

    #[test]
    fn json_with_bad_range_is_rejected() {
        let err = RaftConfig::from_json(r#"{"election_timeout_min": 5, "election_timeout_max": 5}"#)
            .unwrap_err();
        assert!(matches!(err, RaftError::Config(_)));
    }

    #[test]
    fn election_timeout_must_exceed_heartbeat() {
        let config = RaftConfig::default()
            .with_heartbeat_interval(10)
            .with_election_timeout(10, 20);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_window_is_rejected() {
        let config = RaftConfig::default().with_max_inflight(0);
        assert!(config.validate().is_err());
    }
}
