use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
    Patch,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployResponse {
    pub status: u16,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// Write side of a service API.
#[async_trait::async_trait]
pub trait DeployClient: Send + Sync {
    async fn send(&self, request: DeployRequest) -> Result<DeployResponse>;
}

/// Client that records requests and answers them locally.
///
/// POST bodies without an `id` get a generated one, the way services assign
/// ids to created records.
#[derive(Debug, Default, Clone)]
pub struct RecordingDeployClient {
    failing_urls: HashSet<String>,
    requests: Arc<Mutex<Vec<DeployRequest>>>,
}

impl RecordingDeployClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure(mut self, url: impl Into<String>) -> Self {
        self.failing_urls.insert(url.into());
        self
    }

    pub fn requests(&self) -> Vec<DeployRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait::async_trait]
impl DeployClient for RecordingDeployClient {
    async fn send(&self, request: DeployRequest) -> Result<DeployResponse> {
        self.requests.lock().push(request.clone());

        if self.failing_urls.contains(&request.url) {
            return Err(anyhow!("{:?} {} failed with status 400", request.method, request.url));
        }

        let mut body = request.body.unwrap_or(serde_json::Value::Null);
        if request.method == HttpMethod::Post {
            if let Some(map) = body.as_object_mut() {
                map.entry("id")
                    .or_insert_with(|| serde_json::Value::String(Uuid::new_v4().to_string()));
            }
        }
        let status = if request.method == HttpMethod::Delete { 204 } else { 200 };
        Ok(DeployResponse { status, body })
    }
}
