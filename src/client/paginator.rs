use anyhow::{anyhow, Result};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// One page of records returned by the service.
pub type ResponsePage = Vec<serde_json::Value>;

/// Description of a paginated GET request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query_params: BTreeMap<String, String>,
    /// Response field holding the next-page cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination_field: Option<String>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_pagination_field(mut self, field: impl Into<String>) -> Self {
        self.pagination_field = Some(field.into());
        self
    }
}

/// Produces the pages of a request lazily. Each call starts from the first page.
///
/// Retries and backoff belong to the transport behind the implementation.
pub trait Paginator: Send + Sync {
    fn paginate(&self, request: &FetchRequest) -> BoxStream<'static, Result<ResponsePage>>;
}

/// Drain a paginated request into a flat list of records.
pub async fn collect_all(paginator: &dyn Paginator, request: &FetchRequest) -> Result<Vec<serde_json::Value>> {
    let pages: Vec<ResponsePage> = paginator.paginate(request).try_collect().await?;
    Ok(pages.into_iter().flatten().collect())
}

type Responder = dyn Fn(&FetchRequest) -> Option<Vec<ResponsePage>> + Send + Sync;

/// Paginator serving canned pages, keyed by URL. Records every request it sees.
#[derive(Default, Clone)]
pub struct InMemoryPaginator {
    pages: HashMap<String, Vec<ResponsePage>>,
    failing: HashSet<String>,
    responder: Option<Arc<Responder>>,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
}

impl InMemoryPaginator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pages(mut self, url: impl Into<String>, pages: Vec<ResponsePage>) -> Self {
        self.pages.insert(url.into(), pages);
        self
    }

    /// Requests for `url` fail with an error on the first page.
    pub fn with_failure(mut self, url: impl Into<String>) -> Self {
        self.failing.insert(url.into());
        self
    }

    /// Dynamic responses, consulted before the canned pages.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&FetchRequest) -> Option<Vec<ResponsePage>> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }
}

impl Paginator for InMemoryPaginator {
    fn paginate(&self, request: &FetchRequest) -> BoxStream<'static, Result<ResponsePage>> {
        self.requests.lock().push(request.clone());

        if self.failing.contains(&request.url) {
            let url = request.url.clone();
            return stream::once(async move { Err::<ResponsePage, _>(anyhow!("Request to {} failed", url)) }).boxed();
        }

        let pages = self
            .responder
            .as_ref()
            .and_then(|responder| responder(request))
            .or_else(|| self.pages.get(&request.url).cloned())
            .unwrap_or_default();
        stream::iter(pages.into_iter().map(Ok)).boxed()
    }
}
