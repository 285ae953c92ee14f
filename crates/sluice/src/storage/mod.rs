pub mod memory_cluster;
pub mod memory_lock;
pub mod memory_queue;

#[cfg(feature = "sql")]
pub mod sql_cluster;

#[cfg(feature = "sql")]
pub mod sql_queue;
