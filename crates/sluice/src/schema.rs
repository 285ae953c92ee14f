//! Table and column names shared by the SQL generators, plus the DDL of the
//! internal cluster tables.
//!
//! Queue tables themselves are created by the application's migrations; the
//! generated SQL only relies on the columns listed here and on `meta_*`
//! columns.

/// Queue table columns.
pub const ID_COLUMN: &str = "id";
pub const SHARD_COLUMN: &str = "shard";
pub const CREATED_AT_COLUMN: &str = "created_at";
pub const SCHEDULED_AT_COLUMN: &str = "scheduled_at";
pub const PROCESSING_AT_COLUMN: &str = "processing_at";
pub const REMAINING_ATTEMPTS_COLUMN: &str = "remaining_attempts";
pub const DATA_COLUMN: &str = "data";

/// Node singleton table, `q__node`.
pub const NODE_TABLE: &str = "q__node";
/// Shard ownership table, `q__shard`.
pub const SHARD_TABLE: &str = "q__shard";

/// Width of server id columns.
pub const SERVER_ID_COLUMN_LENGTH: usize = crate::config::SERVER_ID_MAX_LENGTH;

pub const CREATE_NODE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS q__node (
        status             VARCHAR(100) NOT NULL PRIMARY KEY,
        server_id          VARCHAR(100) NOT NULL,
        created_at         TIMESTAMPTZ  NOT NULL DEFAULT current_timestamp,
        identifiers_bucket INT
    )
"#;

/// Each shard is either stable (`producer = consumer`, no next consumer) or
/// mid-handoff (`producer = next_consumer`, no consumer). The `IS NOT NULL`
/// guards keep a row with neither consumer from passing as unknown.
pub const CREATE_SHARD_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS q__shard (
        shard              INT          NOT NULL PRIMARY KEY,
        producer_node      VARCHAR(100) NOT NULL,
        consumer_node      VARCHAR(100),
        next_consumer_node VARCHAR(100),
        CHECK (
            (consumer_node IS NOT NULL AND producer_node = consumer_node
                AND next_consumer_node IS NULL) OR
            (next_consumer_node IS NOT NULL AND producer_node = next_consumer_node
                AND consumer_node IS NULL)
        )
    )
"#;
