use crate::error::RowLogError;
use crate::types::{RowLogId, ShardId};
use std::time::Duration;

/// Configuration for a row log and its processor.
#[derive(Debug, Clone)]
pub struct RowLogConfig {
    /// Row log this instance serves. Default: "rowlog".
    pub row_log_id: RowLogId,
    /// Shard scanned by the processor. Default: "shard1".
    pub shard_id: ShardId,
    /// Maximum number of non-problematic messages returned by one scan. Default: 100.
    pub scan_batch_size: usize,
    /// How long an idle worker waits before scanning again when no wake-up arrives. Default: 5s.
    pub idle_poll_timeout: Duration,
    /// Open a wake-up listener while leader, and send wake-ups after each put. Default: true.
    pub wakeup_enabled: bool,
    /// Interface the wake-up listener binds to (port is chosen by the OS). Default: "127.0.0.1".
    pub wakeup_listen_host: String,
    /// Host name published for the wake-up listener. Defaults to `wakeup_listen_host`.
    pub wakeup_advertise_host: Option<String>,
    /// Connect timeout when a producer signals the processor. Default: 1s.
    pub notify_connect_timeout: Duration,
    /// Connect timeout for remote listener delivery. Default: 5s.
    pub remote_connect_timeout: Duration,
    /// How long a remote listener may take to acknowledge a message. Default: 30s.
    pub remote_ack_timeout: Duration,
    /// Bounded wait for each worker to finish when leadership ends. Default: 10s.
    pub worker_join_timeout: Duration,
    /// Pause after a retryable store error before the worker scans again. Default: 1s.
    pub store_retry_backoff: Duration,
}

impl RowLogConfig {
    /// Host published for the wake-up listener.
    pub fn wakeup_advertise_host(&self) -> &str {
        self.wakeup_advertise_host
            .as_deref()
            .unwrap_or(&self.wakeup_listen_host)
    }

    /// Election path shared by every processor of this row log shard.
    pub fn election_path(&self) -> String {
        format!("{}/{}", self.row_log_id, self.shard_id)
    }

    /// Validate configuration values.
    ///
    /// Checks:
    /// - ids are non-empty
    /// - `scan_batch_size >= 1` (an empty batch can never make progress)
    /// - every timeout is non-zero
    pub fn validate(&self) -> Result<(), RowLogError> {
        if self.row_log_id.0.is_empty() {
            return Err(RowLogError::InvalidConfig {
                reason: "row_log_id must not be empty".to_string(),
            });
        }
        if self.shard_id.0.is_empty() {
            return Err(RowLogError::InvalidConfig {
                reason: "shard_id must not be empty".to_string(),
            });
        }
        if self.scan_batch_size == 0 {
            return Err(RowLogError::InvalidConfig {
                reason: "scan_batch_size must be >= 1".to_string(),
            });
        }
        if self.wakeup_listen_host.is_empty() {
            return Err(RowLogError::InvalidConfig {
                reason: "wakeup_listen_host must not be empty".to_string(),
            });
        }
        for (name, value) in [
            ("idle_poll_timeout", self.idle_poll_timeout),
            ("notify_connect_timeout", self.notify_connect_timeout),
            ("remote_connect_timeout", self.remote_connect_timeout),
            ("remote_ack_timeout", self.remote_ack_timeout),
            ("worker_join_timeout", self.worker_join_timeout),
            ("store_retry_backoff", self.store_retry_backoff),
        ] {
            if value.is_zero() {
                return Err(RowLogError::InvalidConfig {
                    reason: format!("{name} must be > 0"),
                });
            }
        }
        Ok(())
    }
}

impl Default for RowLogConfig {
    fn default() -> Self {
        Self {
            row_log_id: RowLogId::new("rowlog"),
            shard_id: ShardId::new("shard1"),
            scan_batch_size: 100,
            idle_poll_timeout: Duration::from_secs(5),
            wakeup_enabled: true,
            wakeup_listen_host: "127.0.0.1".to_string(),
            wakeup_advertise_host: None,
            notify_connect_timeout: Duration::from_secs(1),
            remote_connect_timeout: Duration::from_secs(5),
            remote_ack_timeout: Duration::from_secs(30),
            worker_join_timeout: Duration::from_secs(10),
            store_retry_backoff: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = RowLogConfig::default();
        assert_eq!(config.scan_batch_size, 100);
        assert_eq!(config.idle_poll_timeout, Duration::from_secs(5));
        assert!(config.wakeup_enabled);
        assert_eq!(config.wakeup_advertise_host(), "127.0.0.1");
        assert_eq!(config.election_path(), "rowlog/shard1");
    }

    #[test]
    fn default_config_is_valid() {
        assert!(RowLogConfig::default().validate().is_ok());
    }

    #[test]
    fn advertise_host_overrides_listen_host() {
        let config = RowLogConfig {
            wakeup_listen_host: "0.0.0.0".into(),
            wakeup_advertise_host: Some("node-3.internal".into()),
            ..Default::default()
        };
        assert_eq!(config.wakeup_advertise_host(), "node-3.internal");
    }

    #[test]
    fn validate_zero_batch_size() {
        let config = RowLogConfig {
            scan_batch_size: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("scan_batch_size"));
    }

    #[test]
    fn validate_zero_duration() {
        let config = RowLogConfig {
            remote_ack_timeout: Duration::ZERO,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("remote_ack_timeout"));
    }

    #[test]
    fn validate_empty_row_log_id() {
        let config = RowLogConfig {
            row_log_id: RowLogId::new(""),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
