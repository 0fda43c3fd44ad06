//! Raft timing configuration

use std::time::Duration;

/// Timing parameters for elections and replication.
///
/// The heartbeat interval must stay well below the minimum election timeout,
/// otherwise followers suspect a live leader and start spurious elections.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between AppendEntries rounds sent by a leader (default: 150ms)
    pub heartbeat_interval: Duration,
    /// Minimum election timeout (default: 300ms)
    pub election_timeout_min: Duration,
    /// Maximum election timeout (default: 500ms)
    pub election_timeout_max: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(500),
        }
    }
}

impl RaftConfig {
    /// Create a new config with a custom heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Create a new config with a custom election timeout range
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    /// Check the liveness requirements: a non-empty timeout range and a
    /// heartbeat interval shorter than half the minimum election timeout.
    pub fn validate(&self) -> Result<(), String> {
        if self.election_timeout_min > self.election_timeout_max {
            return Err(format!(
                "election timeout range is empty: {:?} > {:?}",
                self.election_timeout_min, self.election_timeout_max
            ));
        }
        if self.heartbeat_interval * 2 > self.election_timeout_min {
            return Err(format!(
                "heartbeat interval {:?} too close to election timeout minimum {:?}",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }
        Ok(())
    }

    /// Draw a fresh random election timeout from the configured range.
    ///
    /// Re-drawing on every wait is what breaks repeated split votes.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(timeout_ms)
    }
}
