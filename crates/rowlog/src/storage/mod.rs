pub mod memory_coordination;
pub mod memory_shard;
pub mod memory_store;

#[cfg(feature = "sql")]
pub mod sql;

#[cfg(feature = "etcd")]
pub mod etcd_coordination;
