use crate::error::{OfflineError, Result};
use crate::storage::{hasher, Entity, LocalStore, NewMutation};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use super::api::{ApiResponse, RemoteApi};
use super::auth::SessionManager;
use super::connectivity::ConnectivityMonitor;
use super::event_handler::{EventHub, OfflineEvent};
use super::queue::{mutation_type_for, MutationQueue};

/// Marks a response served from the local cache
pub const OFFLINE_CACHE_HEADER: &str = "x-offline-cache";
/// Marks a write accepted into the mutation queue
pub const OFFLINE_QUEUED_HEADER: &str = "x-offline-queued";

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Method,
    pub body: Option<Value>,
    pub headers: HeaderMap,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post(body: Value) -> Self {
        Self::with_body(Method::POST, body)
    }

    pub fn put(body: Value) -> Self {
        Self::with_body(Method::PUT, body)
    }

    pub fn patch(body: Value) -> Self {
        Self::with_body(Method::PATCH, body)
    }

    pub fn delete() -> Self {
        Self {
            method: Method::DELETE,
            ..Default::default()
        }
    }

    fn with_body(method: Method, body: Value) -> Self {
        Self {
            method,
            body: Some(body),
            ..Default::default()
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn header(mut self, name: &'static str, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    fn is_read(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }
}

/// Response handed back to callers, real or synthesized
#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl InterceptedResponse {
    fn synthesized(status: StatusCode, body: &Value, marker: &'static str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(marker, HeaderValue::from_static("true"));
        Ok(Self {
            status,
            headers,
            body: serde_json::to_vec(body)?,
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_offline_cache(&self) -> bool {
        self.has_marker(OFFLINE_CACHE_HEADER)
    }

    pub fn is_offline_queued(&self) -> bool {
        self.has_marker(OFFLINE_QUEUED_HEADER)
    }

    fn has_marker(&self, name: &str) -> bool {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "true")
    }

    /// Turn a non-2xx status into the matching `OfflineError`
    pub fn error_for_status(self, endpoint: &str) -> Result<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(OfflineError::from_status(self.status, endpoint, &self.body))
        }
    }
}

impl From<ApiResponse> for InterceptedResponse {
    fn from(response: ApiResponse) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
        }
    }
}

/// Front door for API calls: passes requests through while online, serves
/// reads from the encrypted cache and queues writes while offline
pub struct RequestInterceptor {
    api: Arc<RemoteApi>,
    store: Arc<LocalStore>,
    queue: Arc<MutationQueue>,
    connectivity: Arc<ConnectivityMonitor>,
    session: Arc<SessionManager>,
    events: EventHub,
    enabled: AtomicBool,
}

impl RequestInterceptor {
    pub fn new(
        api: Arc<RemoteApi>,
        store: Arc<LocalStore>,
        queue: Arc<MutationQueue>,
        connectivity: Arc<ConnectivityMonitor>,
        session: Arc<SessionManager>,
        events: EventHub,
    ) -> Self {
        Self {
            api,
            store,
            queue,
            connectivity,
            session,
            events,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Requests go straight to the network with no caching or queueing
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub async fn request(&self, url: &str, options: RequestOptions) -> Result<InterceptedResponse> {
        let target = self.api.resolve(url)?;
        let user_id = self.session.user_id().await;
        let body = options.body.as_ref().map(serde_json::to_string).transpose()?;

        let result = self
            .api
            .send(
                options.method.clone(),
                &target,
                body.as_deref(),
                options.headers.clone(),
                user_id,
                options.timeout,
            )
            .await;

        if !self.is_enabled() {
            return result.map(Into::into);
        }

        match result {
            Ok(response) => {
                self.connectivity.set_online(true);
                if response.status.is_success() {
                    if options.is_read() {
                        self.populate_cache(&target, &response).await;
                    } else {
                        self.invalidate(&target).await;
                    }
                }
                Ok(response.into())
            }
            Err(e) if e.is_connectivity() => {
                self.connectivity.set_online(false);
                if options.is_read() {
                    self.serve_from_cache(&target, e).await
                } else {
                    self.queue_write(&target, &options.method, body, e).await
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Store a successful read in the background
    async fn populate_cache(&self, target: &Url, response: &ApiResponse) {
        let Some(entity) = self.entity_for(target) else {
            return;
        };
        let Some(role) = self.session.role().await else {
            return;
        };
        if !self.store.can_cache(role) {
            return;
        }

        let records = match serde_json::from_slice::<Value>(&response.body) {
            Ok(Value::Array(items)) => items,
            Ok(Value::Object(mut map)) => match map.remove("data") {
                Some(Value::Array(items)) => items,
                Some(other) => {
                    map.insert("data".to_string(), other);
                    vec![Value::Object(map)]
                }
                None => vec![Value::Object(map)],
            },
            _ => return,
        };

        let store = self.store.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            match store.save(entity, &records, role).await {
                Ok(count) => {
                    events.publish(OfflineEvent::CachePopulated {
                        entity: entity.to_string(),
                        count,
                    });
                }
                Err(e) => {
                    warn!("Failed to cache {}: {}", entity, e);
                    events.publish(OfflineEvent::CachePopulationFailed {
                        entity: entity.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        });
    }

    async fn invalidate(&self, target: &Url) {
        if let Some(entity) = self.entity_for(target) {
            if let Err(e) = self.store.invalidate(entity).await {
                warn!("Failed to invalidate {} cache: {}", entity, e);
            }
        }
    }

    async fn serve_from_cache(
        &self,
        target: &Url,
        error: OfflineError,
    ) -> Result<InterceptedResponse> {
        let allowed = match self.session.role().await {
            Some(role) => self.store.can_cache(role),
            None => false,
        };
        if !allowed {
            return Err(error);
        }

        let Some(resource) = self.api.resource_for(target) else {
            return Err(error);
        };
        let Some(entity) = Entity::from_collection(&resource.collection) else {
            return Err(error);
        };

        let cached = match &resource.id {
            Some(id) => self
                .store
                .get(entity, id)
                .await
                .map(|entry| entry.map(|e| e.value)),
            None => self.store.get_all(entity).await.map(|records| {
                if records.is_empty() {
                    None
                } else {
                    Some(Value::Array(records))
                }
            }),
        };

        match cached {
            Ok(Some(body)) => {
                info!("Serving {} from offline cache", target.path());
                InterceptedResponse::synthesized(StatusCode::OK, &body, OFFLINE_CACHE_HEADER)
            }
            Ok(None) => Err(error),
            Err(e) => {
                warn!("Offline cache lookup failed for {}: {}", target.path(), e);
                Err(error)
            }
        }
    }

    async fn queue_write(
        &self,
        target: &Url,
        method: &Method,
        body: Option<String>,
        error: OfflineError,
    ) -> Result<InterceptedResponse> {
        let Some(mutation_type) = mutation_type_for(method) else {
            return Err(error);
        };

        let resource = self.api.resource_for(target);
        let entity_id = resource.as_ref().and_then(|r| r.id.clone());
        let entity = resource
            .map(|r| r.collection)
            .unwrap_or_else(|| target.path().to_string());

        // Checksum of the copy the client last saw, if it has one
        let original_checksum = match (Entity::from_collection(&entity), &entity_id) {
            (Some(cached), Some(id)) => self
                .store
                .get(cached, id)
                .await
                .ok()
                .flatten()
                .map(|entry| entry.checksum),
            _ => None,
        };

        let endpoint = self.api.endpoint_for(target);
        let id = self
            .queue
            .enqueue(NewMutation {
                mutation_type,
                entity: entity.clone(),
                entity_id: entity_id.clone(),
                data: body.clone(),
                original_checksum,
                endpoint: endpoint.clone(),
                method: method.to_string(),
            })
            .await?;

        info!("Offline: queued {} {} as #{}", method, endpoint, id);
        self.events.publish(OfflineEvent::MutationQueued {
            id,
            entity: entity.clone(),
        });

        let body_checksum = body.as_deref().map(hasher::checksum_body);
        InterceptedResponse::synthesized(
            StatusCode::ACCEPTED,
            &json!({
                "queued": true,
                "queueId": id,
                "entity": entity,
                "entityId": entity_id,
                "checksum": body_checksum,
            }),
            OFFLINE_QUEUED_HEADER,
        )
    }

    fn entity_for(&self, target: &Url) -> Option<Entity> {
        self.api
            .resource_for(target)
            .and_then(|r| Entity::from_collection(&r.collection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesized_markers() {
        let cached =
            InterceptedResponse::synthesized(StatusCode::OK, &json!([]), OFFLINE_CACHE_HEADER)
                .unwrap();
        assert!(cached.is_offline_cache());
        assert!(!cached.is_offline_queued());

        let queued = InterceptedResponse::synthesized(
            StatusCode::ACCEPTED,
            &json!({"queued": true}),
            OFFLINE_QUEUED_HEADER,
        )
        .unwrap();
        assert!(queued.is_offline_queued());
        assert_eq!(queued.json::<Value>().unwrap()["queued"], json!(true));
    }

    #[test]
    fn test_error_for_status() {
        let response = InterceptedResponse {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            headers: HeaderMap::new(),
            body: br#"{"error":"title required"}"#.to_vec(),
        };
        let err = response.error_for_status("/api/events").unwrap_err();
        assert!(matches!(err, OfflineError::Validation { status: 422, .. }));
    }

    #[test]
    fn test_read_methods() {
        assert!(RequestOptions::get().is_read());
        assert!(!RequestOptions::delete().is_read());
        assert!(!RequestOptions::post(json!({})).is_read());
    }
}
