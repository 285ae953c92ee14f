//! SQL-backed queue storage using PostgreSQL via sqlx.
//!
//! Every queue lives in its own table, `q_<name>`, created by the
//! application's migrations with at least these columns:
//!
//! ```sql
//! id                 BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
//! shard              INT NOT NULL,
//! created_at         TIMESTAMPTZ NOT NULL DEFAULT current_timestamp,
//! scheduled_at       TIMESTAMPTZ NOT NULL,
//! processing_at      TIMESTAMPTZ,
//! remaining_attempts INT NOT NULL,
//! data               BYTEA NOT NULL
//! ```
//!
//! plus one nullable `meta_<field>` column per declared meta field. The id
//! sequence of a clustered node is bounded by its
//! [`IdentifierRange`](crate::identifier::IdentifierRange).
//!
//! This module is only available when the `sql` feature is enabled.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::{Connection, Postgres};

use crate::condition::bind::{bind_params, bind_value};
use crate::condition::{ColumnIndex, Condition, MetaType, MetaValue, SqlParam};
use crate::config::{PartialInsert, SendOptions};
use crate::error::QueueError;
use crate::inspect::{
    age_from_seconds, declared_column, sample_percent_for_pages, scale_count, DistinctValue,
    DistinctValuesOptions, MessageAge, Sample,
};
use crate::lifecycle::{
    MessageCounts, DEAD_PREDICATE, IN_FLIGHT_PREDICATE, READY_PREDICATE, RETRY_PREDICATE,
    SCHEDULED_PREDICATE, SWEEP_PREDICATE,
};
use crate::queue::{
    Message, MessageResult, MutateResult, Mutation, Queue, ReceiveOptions, SendMessage, SendResult,
};
use crate::lock::AdvisoryLockSession;
use crate::queue_storage::QueueStorage;
use crate::schema::{
    CREATED_AT_COLUMN, DATA_COLUMN, ID_COLUMN, PROCESSING_AT_COLUMN, REMAINING_ATTEMPTS_COLUMN,
    SCHEDULED_AT_COLUMN, SHARD_COLUMN,
};
use crate::storage::sql_cluster::try_get_column;
use crate::sweep::{SweepEngine, SweepOutcome, SweepTarget};
use crate::types::{MessageId, QueueName, ShardNumber};

/// PostgreSQL-backed queue storage.
pub struct SqlQueueStorage {
    pool: PgPool,
    sweep: SweepEngine,
}

impl SqlQueueStorage {
    /// Create a storage with the default sweep configuration.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            sweep: SweepEngine::with_defaults(),
        }
    }

    /// Share a sweep engine (and its lock manager) with other components of
    /// the process.
    pub fn with_sweep(mut self, sweep: SweepEngine) -> Self {
        self.sweep = sweep;
        self
    }

    pub fn sweep_engine(&self) -> &SweepEngine {
        &self.sweep
    }
}

fn millis(duration: Duration) -> Result<i64, QueueError> {
    i64::try_from(duration.as_millis())
        .map_err(|_| QueueError::invalid_config(format!("duration {duration:?} is too long")))
}

/// Columns read back for a leased message.
fn message_columns(queue: &Queue) -> String {
    let mut columns = vec![
        ID_COLUMN,
        SHARD_COLUMN,
        CREATED_AT_COLUMN,
        PROCESSING_AT_COLUMN,
        SCHEDULED_AT_COLUMN,
        REMAINING_ATTEMPTS_COLUMN,
        DATA_COLUMN,
    ];
    columns.extend(queue.meta_columns().iter().map(|m| m.column.as_str()));
    columns.join(", ")
}

fn read_meta(row: &PgRow, name: &str, meta_type: MetaType) -> Result<Option<MetaValue>, QueueError> {
    Ok(match meta_type {
        MetaType::SmallInt => try_get_column::<Option<i16>>(row, name)?.map(MetaValue::SmallInt),
        MetaType::Int => try_get_column::<Option<i32>>(row, name)?.map(MetaValue::Int),
        MetaType::BigInt => try_get_column::<Option<i64>>(row, name)?.map(MetaValue::BigInt),
        MetaType::Boolean => try_get_column::<Option<bool>>(row, name)?.map(MetaValue::Boolean),
        MetaType::Real => try_get_column::<Option<f32>>(row, name)?.map(MetaValue::Real),
        MetaType::Double => try_get_column::<Option<f64>>(row, name)?.map(MetaValue::Double),
        MetaType::Text => try_get_column::<Option<String>>(row, name)?.map(MetaValue::Text),
    })
}

fn message_from_row(queue: &Queue, row: &PgRow) -> Result<Message, QueueError> {
    let id: i64 = try_get_column(row, ID_COLUMN)?;
    let shard: i32 = try_get_column(row, SHARD_COLUMN)?;

    let mut meta = BTreeMap::new();
    for column in queue.meta_columns() {
        if let Some(value) = read_meta(row, &column.column, column.meta_type)? {
            meta.insert(column.column.clone(), value);
        }
    }

    Ok(Message {
        id: MessageId::new(id, ShardNumber::new_unchecked(shard)),
        created_at: try_get_column(row, CREATED_AT_COLUMN)?,
        // Only leased rows are read back, so the lease timestamp is set.
        processing_at: try_get_column(row, PROCESSING_AT_COLUMN)?,
        scheduled_at: try_get_column(row, SCHEDULED_AT_COLUMN)?,
        remaining_attempts: try_get_column(row, REMAINING_ATTEMPTS_COLUMN)?,
        payload: try_get_column(row, DATA_COLUMN)?,
        meta,
    })
}

/// Value bound for one mutation; typed like the column it changes.
enum MutationParam {
    Attempts(i32),
    Millis(i64),
}

fn split_ids(ids: &[MessageId]) -> (Vec<i64>, Vec<i32>) {
    ids.iter().map(|id| (id.local_id, id.shard.value())).unzip()
}

/// `order by` terms for a receive: caller orders first, then the default
/// `scheduled_at, created_at` ordering.
fn order_clause(options: &ReceiveOptions, scheduled_at: &str) -> String {
    options
        .order
        .iter()
        .map(|order| order.sql())
        .chain([
            format!("{scheduled_at} asc"),
            format!("{CREATED_AT_COLUMN} asc"),
        ])
        .collect::<Vec<_>>()
        .join(", ")
}

/// Insert one chunk, one statement per message. Validation failures are
/// reported before anything is written.
async fn insert_chunk(
    conn: &mut PgConnection,
    queue: &Queue,
    shard: ShardNumber,
    chunk: &[SendMessage],
) -> Result<Vec<MessageId>, QueueError> {
    for message in chunk {
        queue.check_message(message)?;
    }
    let table = queue.table_name();
    let mut ids = Vec::with_capacity(chunk.len());
    for message in chunk {
        let mut columns = format!(
            "{SHARD_COLUMN}, {SCHEDULED_AT_COLUMN}, {REMAINING_ATTEMPTS_COLUMN}, {DATA_COLUMN}"
        );
        let mut values = String::from(
            "$1, clock_timestamp() + $2 * interval '1 millisecond', $3, $4",
        );
        let mut index = ColumnIndex::starting_at(5);
        for column in message.meta.keys() {
            columns.push_str(", ");
            columns.push_str(column);
            values.push_str(&format!(", ${}", index.next_index()));
        }
        let sql = format!("insert into {table} ({columns}) values ({values}) returning {ID_COLUMN}");

        let mut query = sqlx::query(&sql)
            .bind(shard.value())
            .bind(millis(queue.delay_for(message))?)
            .bind(queue.attempts_for(message))
            .bind(message.payload.clone());
        for value in message.meta.values() {
            query = bind_value(query, value);
        }
        let row = query
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| QueueError::persistence("insert message failed", e))?;
        let id: i64 = try_get_column(&row, ID_COLUMN)?;
        ids.push(MessageId::new(id, shard));
    }
    Ok(ids)
}

/// [`insert_chunk`] in a savepoint, so a failing chunk leaves the rest of
/// the send transaction intact.
async fn insert_chunk_in_savepoint(
    conn: &mut PgConnection,
    queue: &Queue,
    shard: ShardNumber,
    chunk: &[SendMessage],
) -> Result<Vec<MessageId>, QueueError> {
    let mut savepoint = conn
        .begin()
        .await
        .map_err(|e| QueueError::persistence("begin send chunk failed", e))?;
    match insert_chunk(&mut savepoint, queue, shard, chunk).await {
        Ok(ids) => {
            savepoint
                .commit()
                .await
                .map_err(|e| QueueError::persistence("commit send chunk failed", e))?;
            Ok(ids)
        }
        Err(e) => {
            if let Err(rollback) = savepoint.rollback().await {
                tracing::warn!(queue = %queue.name(), error = %rollback, "send chunk rollback failed");
            }
            Err(e)
        }
    }
}

#[async_trait]
impl QueueStorage for SqlQueueStorage {
    async fn send_batched(
        &self,
        queue: &Queue,
        shard: ShardNumber,
        messages: &[SendMessage],
        options: &SendOptions,
    ) -> Result<SendResult, QueueError> {
        options.validate()?;
        let mut result = SendResult::with_len(messages.len());
        if messages.is_empty() {
            return Ok(result);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QueueError::persistence("begin send failed", e))?;
        for (chunk_index, chunk) in messages.chunks(options.batch_size).enumerate() {
            let start = chunk_index * options.batch_size;
            let inserted = match options.partial_insert {
                PartialInsert::Prohibited => insert_chunk(&mut tx, queue, shard, chunk).await,
                _ => insert_chunk_in_savepoint(&mut tx, queue, shard, chunk).await,
            };
            match inserted {
                Ok(ids) => result.record_sent(start, ids),
                Err(error) => match options.partial_insert {
                    PartialInsert::Prohibited => {
                        if let Err(rollback) = tx.rollback().await {
                            tracing::warn!(queue = %queue.name(), error = %rollback, "send rollback failed");
                        }
                        return Ok(SendResult::all_failed(messages.len(), error));
                    }
                    PartialInsert::UntilFirstFailure => {
                        result.record_failed(start..messages.len(), error);
                        break;
                    }
                    PartialInsert::InsertAsManyAsPossible => {
                        result.record_failed(start..start + chunk.len(), error);
                    }
                },
            }
        }
        tx.commit()
            .await
            .map_err(|e| QueueError::persistence("commit send failed", e))?;
        Ok(result)
    }

    async fn receive(
        &self,
        queue: &Queue,
        options: &ReceiveOptions,
    ) -> Result<Vec<Message>, QueueError> {
        if options.limit == 0 {
            return Err(QueueError::invalid_config("receive limit must be >= 1"));
        }
        let visibility = millis(queue.visibility_for(options))?;
        let table = queue.table_name();

        // $1 limit, $2 visibility, [$3 shards], then filter parameters.
        let mut params = Vec::new();
        let mut filters = format!(
            "{SCHEDULED_AT_COLUMN} <= clock_timestamp() and {REMAINING_ATTEMPTS_COLUMN} > 0"
        );
        let mut index = ColumnIndex::starting_at(3);
        if options.shards.is_some() {
            filters.push_str(&format!(" and {SHARD_COLUMN} = ANY (${})", index.next_index()));
        }
        if let Some(filter) = &options.filter {
            let compiled = filter.compile(&mut index);
            filters.push_str(&format!(" and ({})", compiled.sql));
            params = compiled.params;
        }

        let sql = format!(
            r#"
            with id_to_update as (
                select {ID_COLUMN} as lease_id, {SCHEDULED_AT_COLUMN} as lease_scheduled_at
                from {table}
                where {filters}
                order by {inner_order}
                limit $1
                for update skip locked
            ),
            updated as (
                update {table}
                set {PROCESSING_AT_COLUMN} = clock_timestamp(),
                    {SCHEDULED_AT_COLUMN} = clock_timestamp() + $2 * interval '1 millisecond',
                    {REMAINING_ATTEMPTS_COLUMN} = {REMAINING_ATTEMPTS_COLUMN} - 1
                where {ID_COLUMN} in (select lease_id from id_to_update)
                returning {columns}
            )
            select updated.* from updated
            join id_to_update on updated.{ID_COLUMN} = id_to_update.lease_id
            order by {outer_order}
            "#,
            inner_order = order_clause(options, SCHEDULED_AT_COLUMN),
            outer_order = order_clause(options, "lease_scheduled_at"),
            columns = message_columns(queue),
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QueueError::persistence("begin receive failed", e))?;

        let mut inline = InlineSweep { conn: &mut *tx };
        self.sweep
            .maybe_sweep(&mut inline, queue.name(), options.limit)
            .await;

        let mut query = sqlx::query(&sql)
            .bind(i64::from(options.limit))
            .bind(visibility);
        if let Some(shards) = &options.shards {
            query = query.bind(shards.iter().map(|s| s.value()).collect::<Vec<i32>>());
        }
        let rows = bind_params(query, &params)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| QueueError::persistence("receive messages failed", e))?;
        let messages = rows
            .iter()
            .map(|row| message_from_row(queue, row))
            .collect::<Result<Vec<_>, _>>()?;

        tx.commit()
            .await
            .map_err(|e| QueueError::persistence("commit receive failed", e))?;
        Ok(messages)
    }

    async fn delete(&self, queue: &Queue, ids: &[MessageId]) -> Result<u64, QueueError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let (local_ids, shards) = split_ids(ids);
        let sql = format!(
            "delete from {} where ({ID_COLUMN}, {SHARD_COLUMN}) in (select * from unnest($1::bigint[], $2::int[]))",
            queue.table_name()
        );
        let result = sqlx::query(&sql)
            .bind(&local_ids)
            .bind(&shards)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::persistence("delete messages failed", e))?;
        Ok(result.rows_affected())
    }

    async fn mutate(
        &self,
        queue: &Queue,
        mutations: &[Mutation],
        ids: &[MessageId],
    ) -> Result<MutateResult, QueueError> {
        Mutation::validate_all(mutations)?;
        if ids.is_empty() {
            return Ok(MutateResult::default());
        }

        // $1 ids, $2 shards, then one parameter per mutation.
        let mut index = ColumnIndex::starting_at(3);
        let mut assignments = Vec::with_capacity(mutations.len());
        let mut values = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            let n = index.next_index();
            let (assignment, value) = match *mutation {
                Mutation::AddRemainingAttempts(delta) => (
                    format!("{REMAINING_ATTEMPTS_COLUMN} = {REMAINING_ATTEMPTS_COLUMN} + ${n}"),
                    MutationParam::Attempts(delta),
                ),
                Mutation::SetRemainingAttempts(value) => (
                    format!("{REMAINING_ATTEMPTS_COLUMN} = ${n}"),
                    MutationParam::Attempts(value),
                ),
                Mutation::AddScheduledAt(delta) => (
                    format!(
                        "{SCHEDULED_AT_COLUMN} = {SCHEDULED_AT_COLUMN} + ${n} * interval '1 millisecond'"
                    ),
                    MutationParam::Millis(millis(delta)?),
                ),
                Mutation::SetScheduledAt(delay) => (
                    format!(
                        "{SCHEDULED_AT_COLUMN} = clock_timestamp() + ${n} * interval '1 millisecond'"
                    ),
                    MutationParam::Millis(millis(delay)?),
                ),
            };
            assignments.push(assignment);
            values.push(value);
        }

        let sql = format!(
            r#"
            update {table} set {assignments}
            where ({ID_COLUMN}, {SHARD_COLUMN}) in (select * from unnest($1::bigint[], $2::int[]))
            returning {ID_COLUMN}, {SHARD_COLUMN}, {SCHEDULED_AT_COLUMN}, {REMAINING_ATTEMPTS_COLUMN}
            "#,
            table = queue.table_name(),
            assignments = assignments.join(", "),
        );

        let (local_ids, shards) = split_ids(ids);
        let mut query = sqlx::query(&sql).bind(&local_ids).bind(&shards);
        for value in values {
            query = match value {
                MutationParam::Attempts(v) => query.bind(v),
                MutationParam::Millis(v) => query.bind(v),
            };
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QueueError::persistence("begin mutate failed", e))?;
        let rows = query
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| QueueError::persistence("mutate messages failed", e))?;
        tx.commit()
            .await
            .map_err(|e| QueueError::persistence("commit mutate failed", e))?;

        let mut mutated = HashMap::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = try_get_column(row, ID_COLUMN)?;
            let shard: i32 = try_get_column(row, SHARD_COLUMN)?;
            let scheduled_at: DateTime<Utc> = try_get_column(row, SCHEDULED_AT_COLUMN)?;
            let remaining_attempts: i32 = try_get_column(row, REMAINING_ATTEMPTS_COLUMN)?;
            mutated.insert(
                MessageId::new(id, ShardNumber::new_unchecked(shard)),
                (scheduled_at, remaining_attempts),
            );
        }
        let messages = ids
            .iter()
            .map(|id| match mutated.get(id) {
                Some((scheduled_at, remaining_attempts)) => MessageResult::Mutated {
                    id: *id,
                    scheduled_at: *scheduled_at,
                    remaining_attempts: *remaining_attempts,
                },
                None => MessageResult::NotFound { id: *id },
            })
            .collect();
        Ok(MutateResult { messages })
    }

    async fn count(
        &self,
        queue: &Queue,
        filter: Option<&Condition>,
    ) -> Result<MessageCounts, QueueError> {
        let mut sql = format!(
            r#"
            select
                count(*) filter (where {SCHEDULED_PREDICATE}) as scheduled,
                count(*) filter (where {READY_PREDICATE}) as ready,
                count(*) filter (where {IN_FLIGHT_PREDICATE}) as in_flight,
                count(*) filter (where {RETRY_PREDICATE}) as retry,
                count(*) filter (where {DEAD_PREDICATE}) as dead
            from {}
            "#,
            queue.table_name()
        );
        let mut params: Vec<SqlParam> = Vec::new();
        if let Some(filter) = filter {
            let compiled = filter.compile(&mut ColumnIndex::new());
            sql.push_str(&format!(" where {}", compiled.sql));
            params = compiled.params;
        }

        let row = bind_params(sqlx::query(&sql), &params)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::persistence("count messages failed", e))?;
        Ok(MessageCounts {
            scheduled: try_get_column(&row, "scheduled")?,
            ready: try_get_column(&row, "ready")?,
            in_flight: try_get_column(&row, "in_flight")?,
            retry: try_get_column(&row, "retry")?,
            dead: try_get_column(&row, "dead")?,
        })
    }

    async fn is_empty(&self, queue: &Queue) -> Result<bool, QueueError> {
        let sql = format!(
            "select not exists (select 1 from {} limit 1)",
            queue.table_name()
        );
        sqlx::query_scalar::<_, bool>(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::persistence("is_empty failed", e))
    }

    async fn is_dead_or_empty(&self, queue: &Queue) -> Result<bool, QueueError> {
        let sql = format!(
            "select not exists (select 1 from {} where not ({DEAD_PREDICATE}) limit 1)",
            queue.table_name()
        );
        sqlx::query_scalar::<_, bool>(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::persistence("is_dead_or_empty failed", e))
    }

    async fn message_age(&self, queue: &Queue) -> Result<MessageAge, QueueError> {
        let table = queue.table_name();
        let age = |column: &str| {
            format!("extract(epoch from (current_timestamp - {column}))::float8")
        };
        let sql = format!(
            r#"
            select
                (select {created} from {table} order by {ID_COLUMN} asc limit 1) as oldest,
                (select {created} from {table} order by {ID_COLUMN} desc limit 1) as newest,
                (select {scheduled} from {table}
                 where {SCHEDULED_AT_COLUMN} <= current_timestamp and {REMAINING_ATTEMPTS_COLUMN} > 0
                 order by {SCHEDULED_AT_COLUMN} asc
                 limit 1) as oldest_ready
            "#,
            created = age(CREATED_AT_COLUMN),
            scheduled = age(SCHEDULED_AT_COLUMN),
        );
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::persistence("message age failed", e))?;
        let seconds = |column: &str| -> Result<Option<Duration>, QueueError> {
            Ok(try_get_column::<Option<f64>>(&row, column)?.map(age_from_seconds))
        };
        Ok(MessageAge {
            oldest: seconds("oldest")?,
            newest: seconds("newest")?,
            oldest_ready: seconds("oldest_ready")?,
        })
    }

    async fn distinct_values(
        &self,
        queue: &Queue,
        column: &str,
        limit: u32,
        options: &DistinctValuesOptions,
    ) -> Result<Vec<DistinctValue>, QueueError> {
        let meta = declared_column(queue, column)?;
        options.validate()?;
        if limit == 0 {
            return Err(QueueError::invalid_config("distinct values limit must be >= 1"));
        }
        let table = queue.table_name();
        let percent = match options.sample {
            Sample::Percent(percent) => percent,
            Sample::Auto => {
                let pages = sqlx::query_scalar::<_, i64>(
                    "select (pg_relation_size($1::regclass) / current_setting('block_size')::int)::bigint",
                )
                .bind(&table)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| QueueError::persistence("read table size failed", e))?;
                sample_percent_for_pages(pages)
            }
        };

        // $1 sample percent, $2 limit, then filter parameters.
        let mut sql = format!(
            "select {column} as value, count(*) as total from {table} tablesample system ($1)"
        );
        let mut params: Vec<SqlParam> = Vec::new();
        if let Some(filter) = &options.filter {
            let compiled = filter.compile(&mut ColumnIndex::starting_at(3));
            sql.push_str(&format!(" where {}", compiled.sql));
            params = compiled.params;
        }
        sql.push_str(&format!(" group by {column}"));
        if let Some(order) = options.order {
            let direction = if order.descending() { "desc" } else { "asc" };
            sql.push_str(&format!(" order by total {direction}"));
        }
        sql.push_str(" limit $2");

        let query = sqlx::query(&sql).bind(percent).bind(i64::from(limit));
        let rows = bind_params(query, &params)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueueError::persistence("distinct values failed", e))?;
        rows.iter()
            .map(|row| {
                Ok(DistinctValue {
                    value: read_meta(row, "value", meta.meta_type)?,
                    count: scale_count(try_get_column(row, "total")?, percent),
                })
            })
            .collect()
    }

    async fn sweep(&self, queue: &Queue, limit_hint: u32) -> Result<SweepOutcome, QueueError> {
        // The advisory lock is released before the connection goes back to
        // the pool; if this call is dropped first, the connection is closed.
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| QueueError::persistence("acquire sweep connection failed", e))?;
        self.sweep.sweep(&mut conn, queue.name(), limit_hint).await
    }
}

/// Delete one batch of dead rows in its own savepoint (or transaction,
/// outside one), so a failed delete leaves an enclosing transaction usable.
async fn delete_dead_batch(
    conn: &mut PgConnection,
    queue: &QueueName,
    max_rows: u32,
) -> Result<u64, QueueError> {
    let table = queue.table_name();
    let sql = format!(
        "delete from {table} where {ID_COLUMN} in (select {ID_COLUMN} from {table} where {SWEEP_PREDICATE} limit $1)"
    );

    let mut savepoint = conn
        .begin()
        .await
        .map_err(|e| QueueError::persistence("begin sweep batch failed", e))?;
    match sqlx::query(&sql)
        .bind(i64::from(max_rows))
        .execute(&mut *savepoint)
        .await
    {
        Ok(done) => {
            savepoint
                .commit()
                .await
                .map_err(|e| QueueError::persistence("commit sweep batch failed", e))?;
            Ok(done.rows_affected())
        }
        Err(e) => {
            if let Err(rollback) = savepoint.rollback().await {
                tracing::warn!(queue = %queue, error = %rollback, "sweep batch rollback failed");
            }
            Err(QueueError::persistence("sweep delete failed", e))
        }
    }
}

/// Standalone sweeps run on a pooled connection holding a session lock.
#[async_trait]
impl SweepTarget for PoolConnection<Postgres> {
    async fn delete_dead_messages(
        &mut self,
        queue: &QueueName,
        max_rows: u32,
    ) -> Result<u64, QueueError> {
        delete_dead_batch(self, queue, max_rows).await
    }
}

/// Sweep session inside a receive transaction.
///
/// Takes a transaction-scoped advisory lock, so the lock goes away with the
/// transaction however the receive ends. Every statement runs in a savepoint:
/// a failing sweep never aborts the receive.
struct InlineSweep<'t> {
    conn: &'t mut PgConnection,
}

#[async_trait]
impl AdvisoryLockSession for InlineSweep<'_> {
    async fn try_advisory_lock(&mut self, lock_id: i64) -> Result<bool, QueueError> {
        let mut savepoint = self
            .conn
            .begin()
            .await
            .map_err(|e| QueueError::persistence("begin sweep lock failed", e))?;
        match sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_xact_lock($1)")
            .bind(lock_id)
            .fetch_one(&mut *savepoint)
            .await
        {
            Ok(acquired) => {
                savepoint
                    .commit()
                    .await
                    .map_err(|e| QueueError::persistence("commit sweep lock failed", e))?;
                Ok(acquired)
            }
            Err(e) => {
                if let Err(rollback) = savepoint.rollback().await {
                    tracing::warn!(lock_id, error = %rollback, "sweep lock rollback failed");
                }
                Err(QueueError::persistence("try advisory lock failed", e))
            }
        }
    }

    /// Released when the receive transaction ends.
    async fn advisory_unlock(&mut self, _lock_id: i64) -> Result<bool, QueueError> {
        Ok(true)
    }

    /// Dropping the receive transaction rolls it back, which frees the lock.
    fn abandon_advisory_lock(&mut self, _lock_id: i64) {}
}

#[async_trait]
impl SweepTarget for InlineSweep<'_> {
    async fn delete_dead_messages(
        &mut self,
        queue: &QueueName,
        max_rows: u32,
    ) -> Result<u64, QueueError> {
        delete_dead_batch(&mut *self.conn, queue, max_rows).await
    }
}
