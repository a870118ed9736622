use crate::config::OfflineConfig;
use crate::error::{OfflineError, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Header carrying the acting user, as the church API expects
pub const USER_ID_HEADER: &str = "x-user-id";

/// `collection[/id]` under the API base path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath {
    pub collection: String,
    pub id: Option<String>,
}

/// Raw answer from the remote authority
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Body as JSON, or as a JSON string when it is not JSON
    pub fn json_or_text(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&self.body).into_owned())
        })
    }
}

/// Thin HTTP client for the remote authority
pub struct RemoteApi {
    client: Client,
    pub base_url: Url,
    base_path: String,
}

impl RemoteApi {
    pub fn new(config: &OfflineConfig) -> Result<Self> {
        let base_url = Url::parse(&config.api_base_url)
            .map_err(|e| OfflineError::Config(format!("invalid api_base_url: {}", e)))?;

        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| OfflineError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            base_path: config.api_base_path.trim_end_matches('/').to_string(),
        })
    }

    /// Absolute URLs pass through; paths are joined onto the base URL
    pub fn resolve(&self, url: &str) -> Result<Url> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => self
                .base_url
                .join(url)
                .map_err(|e| OfflineError::InvalidRequest(format!("{}: {}", url, e))),
            Err(e) => Err(OfflineError::InvalidRequest(format!("{}: {}", url, e))),
        }
    }

    /// Form to persist in the queue: path and query for our own origin
    pub fn endpoint_for(&self, url: &Url) -> String {
        if url.origin() == self.base_url.origin() {
            match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            }
        } else {
            url.to_string()
        }
    }

    /// Identify the collection and record a URL addresses
    pub fn resource_for(&self, url: &Url) -> Option<ResourcePath> {
        if url.origin() != self.base_url.origin() {
            return None;
        }

        let relative = url.path().strip_prefix(self.base_path.as_str())?;
        let mut segments = relative.split('/').filter(|s| !s.is_empty());
        let collection = segments.next()?.to_string();
        let id = segments.next().map(str::to_string);

        // Nested routes such as /elections/7/vote are not plain records
        if segments.next().is_some() {
            return None;
        }

        Some(ResourcePath { collection, id })
    }

    /// Send one request. Transport failures and timeouts surface as
    /// `OfflineError::Connectivity`; every HTTP status is returned as a response.
    pub async fn send(
        &self,
        method: Method,
        url: &Url,
        body: Option<&str>,
        mut headers: HeaderMap,
        user_id: Option<i64>,
        timeout: Option<Duration>,
    ) -> Result<ApiResponse> {
        if let Some(user_id) = user_id {
            headers.insert(USER_ID_HEADER, HeaderValue::from(user_id));
        }

        let mut request = self.client.request(method.clone(), url.clone()).headers(headers);
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_string());
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        debug!("{} {}", method, url.path());
        let response = request.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map(|b| b.to_vec())?;

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> RemoteApi {
        RemoteApi::new(&OfflineConfig {
            api_base_url: "http://localhost:3065".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let api = api();
        assert_eq!(
            api.resolve("/api/tasks/42").unwrap().as_str(),
            "http://localhost:3065/api/tasks/42"
        );
        assert_eq!(
            api.resolve("https://cdn.example.org/a.png").unwrap().host_str(),
            Some("cdn.example.org")
        );
    }

    #[test]
    fn test_resource_for() {
        let api = api();
        let url = api.resolve("/api/tasks/42").unwrap();
        assert_eq!(
            api.resource_for(&url),
            Some(ResourcePath {
                collection: "tasks".into(),
                id: Some("42".into())
            })
        );

        let list = api.resolve("/api/users?role=pastor").unwrap();
        assert_eq!(api.resource_for(&list).unwrap().id, None);

        let nested = api.resolve("/api/elections/7/vote").unwrap();
        assert_eq!(api.resource_for(&nested), None);

        let foreign = api.resolve("https://other.example.org/api/users").unwrap();
        assert_eq!(api.resource_for(&foreign), None);
    }

    #[test]
    fn test_endpoint_for_keeps_query() {
        let api = api();
        let url = api.resolve("/api/events?page=2").unwrap();
        assert_eq!(api.endpoint_for(&url), "/api/events?page=2");
    }
}
