#![allow(dead_code)]

use anyhow::Result;
use flocksync::config::Environment;
use flocksync::storage::Database;
use flocksync::sync::{CryptoProvider, DeviceFingerprint, KeyManager, OfflineEvent};
use flocksync::{OfflineConfig, OfflineContext};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Request timeout used by test contexts
pub const TEST_TIMEOUT_MS: u64 = 500;

/// Temporary database plus a mock remote authority
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub db_path: PathBuf,
    pub server: MockServer,
}

impl TestEnvironment {
    pub async fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let db_path = temp_dir.path().join("test.db");
        let server = MockServer::start().await;

        Ok(Self {
            temp_dir,
            db_path,
            server,
        })
    }

    pub fn config(&self) -> OfflineConfig {
        OfflineConfig {
            api_base_url: self.server.uri(),
            request_timeout_ms: TEST_TIMEOUT_MS,
            reconnect_settle_ms: 50,
            environment: Environment::Production,
            ..Default::default()
        }
    }

    pub async fn context(&self) -> Result<OfflineContext> {
        self.context_with(self.config()).await
    }

    pub async fn context_with(&self, config: OfflineConfig) -> Result<OfflineContext> {
        let db = Arc::new(Database::new(Some(self.db_path.clone())).await?);
        let keys = Arc::new(KeyManager::with_provider(
            db.clone(),
            Environment::Production,
            CryptoProvider::System,
            test_fingerprint(),
        ));
        Ok(OfflineContext::with_parts(config, db, keys).await?)
    }

    /// Make `verb path` hang past the request timeout
    pub async fn make_unreachable(&self, verb: &str, route: &str) {
        Mock::given(method(verb))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&self.server)
            .await;
    }
}

pub fn test_fingerprint() -> DeviceFingerprint {
    DeviceFingerprint {
        platform: "linux-x86_64".to_string(),
        locale: "en_US.UTF-8".to_string(),
        host: "test-host".to_string(),
    }
}

/// Wait for the first event matching `predicate`
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<OfflineEvent>,
    predicate: F,
    timeout_ms: u64,
) -> Option<OfflineEvent>
where
    F: Fn(&OfflineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_millis(timeout_ms), async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Poll an async condition until it holds or the timeout passes
pub async fn wait_for_condition<F, Fut>(condition: F, timeout_ms: u64) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    false
}
