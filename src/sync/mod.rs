pub mod api;
pub mod auth;
pub mod backoff;
pub mod conflict_resolution;
pub mod connectivity;
pub mod encryption;
pub mod event_handler;
pub mod interceptor;
pub mod queue;
pub mod service;

pub use api::{ApiResponse, RemoteApi, ResourcePath};
pub use auth::{AuthState, Role, SessionManager};
pub use backoff::RetryPolicy;
pub use conflict_resolution::ConflictStore;
pub use connectivity::ConnectivityMonitor;
pub use encryption::{CryptoProvider, DeviceFingerprint, DeviceKey, KeyManager};
pub use event_handler::{EventHub, OfflineEvent};
pub use interceptor::{InterceptedResponse, RequestInterceptor, RequestOptions};
pub use queue::MutationQueue;
pub use service::{DrainMode, DrainReport, ItemOutcome, SyncEvent, SyncManager, SyncStatus};
