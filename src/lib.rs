//! Offline-first data layer for the church management client: an encrypted
//! local cache, a durable mutation queue and a request interceptor that
//! routes between the remote API and local state.

pub mod config;
pub mod context;
pub mod error;
pub mod storage;
pub mod sync;

pub use config::{Environment, OfflineConfig};
pub use context::OfflineContext;
pub use error::{OfflineError, Result};
