/// Session and engine configuration
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::{CollaborationError, Result};

/// Which submissions a session accepts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollaborationMode {
    /// Text operations only
    Ot,
    /// CRDT updates only
    Crdt,
    /// Text operations from the edit lock holder only
    Lock,
    /// Both text operations and CRDT updates
    #[default]
    Hybrid,
}

impl CollaborationMode {
    pub fn accepts_operations(&self) -> bool {
        !matches!(self, CollaborationMode::Crdt)
    }

    pub fn accepts_crdt(&self) -> bool {
        matches!(self, CollaborationMode::Crdt | CollaborationMode::Hybrid)
    }
}

impl fmt::Display for CollaborationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollaborationMode::Ot => "ot",
            CollaborationMode::Crdt => "crdt",
            CollaborationMode::Lock => "lock",
            CollaborationMode::Hybrid => "hybrid",
        };
        f.write_str(name)
    }
}

/// Policy for concurrent attribute changes on the same range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    #[default]
    LastWriteWins,
    FirstWriteWins,
}

/// Per-session settings, fixed for the session's lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub mode: CollaborationMode,
    pub max_users: usize,

    /// Inactivity after which an idle session ends
    pub idle_timeout_ms: u64,

    /// Inactivity after which an active session becomes idle
    pub idle_after_ms: u64,

    pub presence_idle_after_ms: u64,
    pub presence_disconnect_after_ms: u64,
    pub conflict_resolution: ConflictResolution,

    /// Commits between broadcast snapshots; 0 disables them
    pub snapshot_interval: u64,

    pub max_retained_operations: usize,
    pub sequencer_wait_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: CollaborationMode::default(),
            max_users: 50,
            idle_timeout_ms: 300_000,
            idle_after_ms: 60_000,
            presence_idle_after_ms: 60_000,
            presence_disconnect_after_ms: 300_000,
            conflict_resolution: ConflictResolution::default(),
            snapshot_interval: 100,
            max_retained_operations: 1000,
            sequencer_wait_ms: 5000,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_users == 0 {
            return Err(invalid("max_users must be at least 1"));
        }
        if self.max_retained_operations == 0 {
            return Err(invalid("max_retained_operations must be at least 1"));
        }
        if self.idle_timeout_ms == 0 || self.idle_after_ms == 0 {
            return Err(invalid("idle timeouts must be non-zero"));
        }
        if self.presence_idle_after_ms == 0
            || self.presence_disconnect_after_ms < self.presence_idle_after_ms
        {
            return Err(invalid(
                "presence_disconnect_after_ms must be at least presence_idle_after_ms",
            ));
        }
        let durations = [
            self.idle_timeout_ms,
            self.idle_after_ms,
            self.presence_idle_after_ms,
            self.presence_disconnect_after_ms,
            self.sequencer_wait_ms,
        ];
        if durations.iter().any(|&ms| ms > MAX_DURATION_MS) {
            return Err(invalid("durations must not exceed i64::MAX milliseconds"));
        }
        Ok(())
    }

    /// Session inactivity thresholds as wall-clock deltas
    pub(crate) fn idle_timeout_delta(&self) -> chrono::Duration {
        clock_delta(self.idle_timeout_ms)
    }

    pub(crate) fn idle_after_delta(&self) -> chrono::Duration {
        clock_delta(self.idle_after_ms)
    }

    pub(crate) fn presence_idle_delta(&self) -> chrono::Duration {
        clock_delta(self.presence_idle_after_ms)
    }

    pub(crate) fn presence_disconnect_delta(&self) -> chrono::Duration {
        clock_delta(self.presence_disconnect_after_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn idle_after(&self) -> Duration {
        Duration::from_millis(self.idle_after_ms)
    }

    pub fn presence_idle_after(&self) -> Duration {
        Duration::from_millis(self.presence_idle_after_ms)
    }

    pub fn presence_disconnect_after(&self) -> Duration {
        Duration::from_millis(self.presence_disconnect_after_ms)
    }

    pub fn sequencer_wait(&self) -> Duration {
        Duration::from_millis(self.sequencer_wait_ms)
    }
}

/// Top-level configuration for a process hosting sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaborationConfig {
    /// Defaults for every session created by the manager
    pub session: SessionConfig,

    pub sweep_interval_ms: u64,
}

impl Default for CollaborationConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            sweep_interval_ms: 1000,
        }
    }
}

impl CollaborationConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CollaborationError::Serialization(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_ms == 0 {
            return Err(invalid("sweep_interval_ms must be non-zero"));
        }
        self.session.validate()
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

const MAX_DURATION_MS: u64 = i64::MAX as u64;

/// Saturates instead of wrapping to a negative delta
fn clock_delta(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

fn invalid(message: &str) -> CollaborationError {
    CollaborationError::InvalidOperation(format!("invalid config: {}", message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.mode, CollaborationMode::Hybrid);
        assert_eq!(config.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.conflict_resolution, ConflictResolution::LastWriteWins);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = CollaborationConfig::from_json_str(
            r#"{"session": {"mode": "lock", "max_users": 2}, "sweep_interval_ms": 250}"#,
        )
        .unwrap();

        assert_eq!(config.session.mode, CollaborationMode::Lock);
        assert_eq!(config.session.max_users, 2);
        assert_eq!(config.session.snapshot_interval, 100);
        assert_eq!(config.sweep_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_rejects_zero_sizes() {
        let result = CollaborationConfig::from_json_str(r#"{"session": {"max_users": 0}}"#);
        assert!(matches!(
            result,
            Err(CollaborationError::InvalidOperation(_))
        ));

        let result = CollaborationConfig::from_json_str(r#"{"session": {"mode": "paxos"}}"#);
        assert!(matches!(result, Err(CollaborationError::Serialization(_))));
    }

    #[test]
    fn test_rejects_durations_beyond_i64() {
        let json = format!(r#"{{"session": {{"idle_timeout_ms": {}}}}}"#, u64::MAX);
        let result = CollaborationConfig::from_json_str(&json);
        assert!(matches!(
            result,
            Err(CollaborationError::InvalidOperation(_))
        ));

        let config = SessionConfig {
            idle_timeout_ms: u64::MAX,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(config.idle_timeout_delta() > chrono::Duration::days(365));
    }

    #[test]
    fn test_mode_acceptance() {
        assert!(CollaborationMode::Ot.accepts_operations());
        assert!(!CollaborationMode::Ot.accepts_crdt());
        assert!(!CollaborationMode::Crdt.accepts_operations());
        assert!(CollaborationMode::Lock.accepts_operations());
        assert!(!CollaborationMode::Lock.accepts_crdt());
        assert_eq!(CollaborationMode::Hybrid.to_string(), "hybrid");
    }
}
