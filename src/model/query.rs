use anyhow::{anyhow, Result};
use regex::Regex;

/// Which types a fetch covers.
///
/// A partial fetch only refreshes the matching types; everything else is read
/// from the previously fetched elements.
#[derive(Debug, Clone)]
pub struct ElementQuery {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    is_partial: bool,
}

impl ElementQuery {
    /// Build a query from type-name patterns. Patterns are anchored.
    pub fn new(include: &[String], exclude: &[String], is_partial: bool) -> Result<Self> {
        Ok(Self {
            include: compile_all(include)?,
            exclude: compile_all(exclude)?,
            is_partial,
        })
    }

    /// Query matching every type.
    pub fn all() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            is_partial: false,
        }
    }

    pub fn is_type_match(&self, type_name: &str) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|r| r.is_match(type_name));
        included && !self.exclude.iter().any(|r| r.is_match(type_name))
    }

    pub fn is_partial(&self) -> bool {
        self.is_partial
    }
}

impl Default for ElementQuery {
    fn default() -> Self {
        Self::all()
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("^(?:{})$", p)).map_err(|e| anyhow!("Invalid type pattern '{}': {}", p, e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_include_exclude() {
        let query = ElementQuery::new(
            &["group.*".to_string(), "brand".to_string()],
            &["group_rule".to_string()],
            true,
        )
        .unwrap();

        assert!(query.is_type_match("group"));
        assert!(query.is_type_match("group_membership"));
        assert!(!query.is_type_match("group_rule"));
        assert!(query.is_type_match("brand"));
        assert!(!query.is_type_match("brand_theme"));
        assert!(query.is_partial());
        assert!(ElementQuery::all().is_type_match("anything"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(ElementQuery::new(&["(".to_string()], &[], false).is_err());
    }
}
