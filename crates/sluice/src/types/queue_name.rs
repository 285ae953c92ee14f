use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::QueueError;

/// PostgreSQL default identifier length.
const PG_MAX_IDENTIFIER_LENGTH: usize = 63;

/// Prefix of every queue table, and of the internal tables (`q__node`, ...).
pub const QUEUE_TABLE_PREFIX: &str = "q_";

/// Longest queue name that still produces a valid table identifier.
pub const QUEUE_NAME_MAX_LENGTH: usize = PG_MAX_IDENTIFIER_LENGTH - QUEUE_TABLE_PREFIX.len();

/// Prefix of every meta column.
pub const META_COLUMN_PREFIX: &str = "meta_";

/// Longest meta field name that still produces a valid column identifier.
pub const META_FIELD_MAX_LENGTH: usize = PG_MAX_IDENTIFIER_LENGTH - META_COLUMN_PREFIX.len();

fn allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Validated name of a queue. Each queue lives in table `q_<name>`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> Result<Self, QueueError> {
        let name = name.into();
        if name.is_empty() {
            return Err(QueueError::invalid_config("queue name is empty"));
        }
        if name.starts_with(QUEUE_TABLE_PREFIX) {
            return Err(QueueError::invalid_config(format!(
                "queue name must not begin with '{QUEUE_TABLE_PREFIX}' (got {name})"
            )));
        }
        if name.starts_with('_') {
            // `q__*` is reserved for internal tables.
            return Err(QueueError::invalid_config(format!(
                "queue name must not begin with '_' (got {name})"
            )));
        }
        if name.len() > QUEUE_NAME_MAX_LENGTH {
            return Err(QueueError::invalid_config(format!(
                "queue name must be at most {QUEUE_NAME_MAX_LENGTH} chars (got {name}, length {})",
                name.len()
            )));
        }
        if !name.chars().all(allowed) {
            return Err(QueueError::invalid_config(format!(
                "queue name contains illegal symbols, allowed: [0-9a-zA-Z_] (got {name})"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn table_name(&self) -> String {
        format!("{QUEUE_TABLE_PREFIX}{}", self.0)
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Checks a meta field name and returns its column name.
pub(crate) fn meta_column_name(field: &str) -> Result<String, QueueError> {
    if field.is_empty() {
        return Err(QueueError::invalid_config("meta field name is empty"));
    }
    if field.len() > META_FIELD_MAX_LENGTH {
        return Err(QueueError::invalid_config(format!(
            "meta field name must be at most {META_FIELD_MAX_LENGTH} chars (got {field})"
        )));
    }
    if !field.chars().all(allowed) {
        return Err(QueueError::invalid_config(format!(
            "meta field name contains illegal symbols, allowed: [0-9a-zA-Z_] (got {field})"
        )));
    }
    Ok(format!("{META_COLUMN_PREFIX}{field}"))
}
