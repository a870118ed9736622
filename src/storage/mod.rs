pub mod database;
pub mod hasher;
pub mod local_store;

pub use database::{
    CacheRecord, ConflictRecord, Database, DatabaseStats, DeadLetter, MutationQueueItem,
    MutationType, NewMutation,
};
pub use local_store::{CachedEntity, Entity, LocalStore};
