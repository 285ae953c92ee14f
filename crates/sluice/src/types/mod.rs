mod bucket;
mod message_id;
mod queue_name;
mod server_id;
mod shard_number;

pub use bucket::{Bucket, BucketError, DEFAULT_MAX_BUCKET};
pub use message_id::MessageId;
pub(crate) use queue_name::meta_column_name;
pub use queue_name::{
    QueueName, META_COLUMN_PREFIX, META_FIELD_MAX_LENGTH, QUEUE_NAME_MAX_LENGTH,
    QUEUE_TABLE_PREFIX,
};
pub use server_id::ServerId;
pub use shard_number::{ShardNumber, DEFAULT_SHARD_COUNT, MIN_SHARD};
