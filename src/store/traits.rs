use crate::model::{ElemId, Element};
use anyhow::Result;

/// Read-only lookup into a previously fetched element graph.
///
/// Used for reference resolution on partial fetch, alias fallback, and by
/// change validators that need to see elements outside the deployed batch.
#[async_trait::async_trait]
pub trait ElementsSource: Send + Sync {
    /// Get a top level element (or a field of a type) by id
    async fn get(&self, id: &ElemId) -> Result<Option<Element>>;
    /// All top level elements
    async fn get_all(&self) -> Result<Vec<Element>>;
    /// Ids of all top level elements
    async fn list(&self) -> Result<Vec<ElemId>>;

    async fn has(&self, id: &ElemId) -> Result<bool> {
        Ok(self.get(id).await?.is_some())
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.list().await?.is_empty())
    }
}

#[async_trait::async_trait]
impl<T: ElementsSource + ?Sized> ElementsSource for std::sync::Arc<T> {
    async fn get(&self, id: &ElemId) -> Result<Option<Element>> {
        (**self).get(id).await
    }

    async fn get_all(&self) -> Result<Vec<Element>> {
        (**self).get_all().await
    }

    async fn list(&self) -> Result<Vec<ElemId>> {
        (**self).list().await
    }
}
