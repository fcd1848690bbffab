use std::str::FromStr;

use anyhow::Context;
use tokio::time::Duration;

/// Bounded wait used to confirm a workload deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionPoll {
    pub attempts: u32,
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Field manager used for patches
    pub field_manager: String,
    pub deletion_poll: DeletionPoll,
    /// Requeue after a converged pass
    pub resync_interval: Duration,
    /// Requeue after a failed pass
    pub error_requeue: Duration,
    /// Requeue while draining or waiting for a recreate
    pub drain_requeue: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            field_manager: "controlplane-operator".into(),
            deletion_poll: DeletionPoll {
                attempts: 10,
                interval: Duration::from_secs(3),
            },
            resync_interval: Duration::from_secs(300),
            error_requeue: Duration::from_secs(30),
            drain_requeue: Duration::from_secs(5),
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| -> anyhow::Result<Duration> {
            parse_or(&lookup, key, default.as_secs()).map(Duration::from_secs)
        };
        Ok(Self {
            field_manager: lookup("CONTROLPLANE_FIELD_MANAGER").unwrap_or(defaults.field_manager),
            deletion_poll: DeletionPoll {
                attempts: parse_or(
                    &lookup,
                    "CONTROLPLANE_DELETE_POLL_ATTEMPTS",
                    defaults.deletion_poll.attempts,
                )?,
                interval: secs(
                    "CONTROLPLANE_DELETE_POLL_INTERVAL_SECS",
                    defaults.deletion_poll.interval,
                )?,
            },
            resync_interval: secs("CONTROLPLANE_RESYNC_SECS", defaults.resync_interval)?,
            error_requeue: secs("CONTROLPLANE_ERROR_REQUEUE_SECS", defaults.error_requeue)?,
            drain_requeue: secs("CONTROLPLANE_DRAIN_REQUEUE_SECS", defaults.drain_requeue)?,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value {raw:?} for {key}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_without_env() {
        let cfg = OperatorConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg, OperatorConfig::default());
        assert_eq!(cfg.deletion_poll.attempts, 10);
    }

    #[test]
    fn env_overrides_defaults() {
        let env = HashMap::from([
            ("CONTROLPLANE_DELETE_POLL_ATTEMPTS", "4"),
            ("CONTROLPLANE_DELETE_POLL_INTERVAL_SECS", "1"),
            ("CONTROLPLANE_FIELD_MANAGER", "tenant-operator"),
        ]);
        let cfg = OperatorConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.deletion_poll.attempts, 4);
        assert_eq!(cfg.deletion_poll.interval, Duration::from_secs(1));
        assert_eq!(cfg.field_manager, "tenant-operator");
        assert_eq!(cfg.resync_interval, Duration::from_secs(300));
    }

    #[test]
    fn malformed_number_is_an_error() {
        let err = OperatorConfig::from_lookup(|k| {
            (k == "CONTROLPLANE_DELETE_POLL_ATTEMPTS").then(|| "ten".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("CONTROLPLANE_DELETE_POLL_ATTEMPTS"));
    }
}
