use crate::types::{Bucket, ShardNumber};

/// Errors that can occur while producing, consuming or maintaining queues.
///
/// Losing a race against another consumer (the row is already gone, the lock
/// is held elsewhere) is not an error; those outcomes surface as reduced
/// counts or empty results instead.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("sequence value {sequence} does not fit into {bits} bits (bucket {bucket})")]
    IdentifierOverflow {
        bucket: Bucket,
        sequence: i64,
        bits: u32,
    },

    #[error(
        "invalid shard state for shard {shard}: producer={producer}, consumer={consumer:?}, next_consumer={next_consumer:?}"
    )]
    InvalidShardState {
        shard: ShardNumber,
        producer: String,
        consumer: Option<String>,
        next_consumer: Option<String>,
    },

    #[error("node info not found, the cluster tables were never bootstrapped")]
    NodeNotBootstrapped,

    #[error("malformed message id: {input:?}")]
    MalformedId { input: String },

    #[error("persistence error: {reason}")]
    PersistenceError {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl QueueError {
    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    #[cfg(feature = "sql")]
    pub(crate) fn persistence(context: &str, source: sqlx::Error) -> Self {
        Self::PersistenceError {
            reason: format!("{context}: {source}"),
            source: Some(Box::new(source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = QueueError::invalid_config("max_rows must be in [100, 100000], got 7");
        assert_eq!(
            err.to_string(),
            "invalid configuration: max_rows must be in [100, 100000], got 7"
        );

        let err = QueueError::MalformedId {
            input: "12x".into(),
        };
        assert_eq!(err.to_string(), "malformed message id: \"12x\"");
    }

    #[test]
    fn shard_state_error_mentions_all_owners() {
        let err = QueueError::InvalidShardState {
            shard: ShardNumber::new_unchecked(3),
            producer: "a".into(),
            consumer: Some("b".into()),
            next_consumer: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("shard 3"), "got: {msg}");
        assert!(msg.contains("producer=a"), "got: {msg}");
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<QueueError>();
    }
}
