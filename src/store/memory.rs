use anyhow::Result;
use std::collections::BTreeMap;

use crate::model::{ElemId, Element, IdType};
use crate::store::traits::ElementsSource;

/// Elements source backed by an owned map, ordered by id.
#[derive(Debug, Clone, Default)]
pub struct InMemoryElementsSource {
    elements: BTreeMap<ElemId, Element>,
}

impl InMemoryElementsSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_elements(elements: impl IntoIterator<Item = Element>) -> Self {
        let mut source = Self::new();
        for element in elements {
            source.insert(element);
        }
        source
    }

    pub fn insert(&mut self, element: Element) {
        self.elements.insert(element.elem_id().clone(), element);
    }

    pub fn remove(&mut self, id: &ElemId) -> Option<Element> {
        self.elements.remove(id)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

#[async_trait::async_trait]
impl ElementsSource for InMemoryElementsSource {
    async fn get(&self, id: &ElemId) -> Result<Option<Element>> {
        if id.id_type() == IdType::Field {
            let field = self
                .elements
                .get(&id.type_elem_id())
                .and_then(Element::as_type)
                .and_then(|t| t.fields.get(id.name_parts().first()?))
                .cloned()
                .map(Element::Field);
            return Ok(field);
        }
        Ok(self.elements.get(id).cloned())
    }

    async fn get_all(&self) -> Result<Vec<Element>> {
        Ok(self.elements.values().cloned().collect())
    }

    async fn list(&self) -> Result<Vec<ElemId>> {
        Ok(self.elements.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ObjectType, PrimitiveKind, TypeRef};

    #[tokio::test]
    async fn test_get_field_through_type() {
        let type_id = ElemId::type_id("jira", "Project");
        let project = ObjectType::new(type_id.clone()).with_field("key", TypeRef::Primitive(PrimitiveKind::String));
        let source = InMemoryElementsSource::from_elements(vec![Element::Type(project)]);

        let field = source.get(&ElemId::field_id("jira", "Project", "key")).await.unwrap();
        assert!(matches!(field, Some(Element::Field(_))));
        assert!(source.has(&type_id).await.unwrap());
        assert!(!source.has(&ElemId::type_id("jira", "Board")).await.unwrap());
        assert_eq!(source.list().await.unwrap(), vec![type_id]);
    }
}
