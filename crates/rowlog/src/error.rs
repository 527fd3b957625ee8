use crate::types::{HostAddress, SubscriptionId};

/// Errors that can occur in the row log.
#[derive(Debug, thiserror::Error)]
pub enum RowLogError {
    /// A store call failed but the backend is expected to recover; the caller retries.
    #[error("persistence error: {reason}")]
    PersistenceError {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The store can no longer be reached. Workers stop on this error.
    #[error("storage backend unavailable: {reason}")]
    BackendUnavailable {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("coordination error: {reason}")]
    CoordinationError {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("subscription not registered: {subscription_id}")]
    SubscriptionNotFound { subscription_id: SubscriptionId },

    /// A message listener reported an error while processing a message.
    #[error("listener for {subscription_id} failed: {reason}")]
    ListenerError {
        subscription_id: SubscriptionId,
        reason: String,
    },

    #[error("transport error talking to {address}: {reason}")]
    TransportError {
        address: HostAddress,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("malformed message: {reason}")]
    MalformedMessage {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("row log is shutting down")]
    ShuttingDown,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl RowLogError {
    /// Whether the failed operation may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RowLogError::PersistenceError { .. }
                | RowLogError::CoordinationError { .. }
                | RowLogError::TransportError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = RowLogError::SubscriptionNotFound {
            subscription_id: SubscriptionId::new("indexer"),
        };
        assert_eq!(err.to_string(), "subscription not registered: indexer");

        let err = RowLogError::TransportError {
            address: HostAddress::new("10.0.0.2", 7000),
            reason: "connection refused".into(),
            source: None,
        };
        assert_eq!(
            err.to_string(),
            "transport error talking to 10.0.0.2:7000: connection refused"
        );
    }

    #[test]
    fn store_errors_are_retryable_but_unavailability_is_not() {
        let transient = RowLogError::PersistenceError {
            reason: "timeout".into(),
            source: None,
        };
        assert!(transient.is_retryable());

        let fatal = RowLogError::BackendUnavailable {
            reason: "pool closed".into(),
            source: None,
        };
        assert!(!fatal.is_retryable());
        assert!(!RowLogError::ShuttingDown.is_retryable());
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RowLogError>();
    }
}
