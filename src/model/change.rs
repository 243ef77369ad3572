use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EngineError;
use crate::model::elem_id::ElemId;
use crate::model::element::{Element, InstanceElement};

/// Index of a change inside its deploy batch.
pub type ChangeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionName {
    Add,
    Modify,
    Remove,
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionName::Add => "add",
            ActionName::Modify => "modify",
            ActionName::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// Before/after delta for one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Change {
    Addition { after: Element },
    Removal { before: Element },
    Modification { before: Element, after: Element },
}

impl Change {
    pub fn addition(after: impl Into<Element>) -> Self {
        Change::Addition { after: after.into() }
    }

    pub fn removal(before: impl Into<Element>) -> Self {
        Change::Removal { before: before.into() }
    }

    pub fn modification(before: impl Into<Element>, after: impl Into<Element>) -> Self {
        Change::Modification {
            before: before.into(),
            after: after.into(),
        }
    }

    pub fn action(&self) -> ActionName {
        match self {
            Change::Addition { .. } => ActionName::Add,
            Change::Removal { .. } => ActionName::Remove,
            Change::Modification { .. } => ActionName::Modify,
        }
    }

    /// The element the change is about: `after` when present, `before` for removals.
    pub fn data(&self) -> &Element {
        match self {
            Change::Addition { after } | Change::Modification { after, .. } => after,
            Change::Removal { before } => before,
        }
    }

    pub fn data_mut(&mut self) -> &mut Element {
        match self {
            Change::Addition { after } | Change::Modification { after, .. } => after,
            Change::Removal { before } => before,
        }
    }

    pub fn before(&self) -> Option<&Element> {
        match self {
            Change::Removal { before } | Change::Modification { before, .. } => Some(before),
            Change::Addition { .. } => None,
        }
    }

    pub fn after(&self) -> Option<&Element> {
        match self {
            Change::Addition { after } | Change::Modification { after, .. } => Some(after),
            Change::Removal { .. } => None,
        }
    }

    pub fn elem_id(&self) -> &ElemId {
        self.data().elem_id()
    }

    pub fn type_name(&self) -> &str {
        self.elem_id().type_name()
    }

    pub fn is_instance_change(&self) -> bool {
        self.data().is_instance()
    }

    pub fn instance(&self) -> Option<&InstanceElement> {
        self.data().as_instance()
    }

    pub fn instance_mut(&mut self) -> Option<&mut InstanceElement> {
        self.data_mut().as_instance_mut()
    }

    pub fn is_removal(&self) -> bool {
        matches!(self, Change::Removal { .. })
    }

    pub fn is_addition(&self) -> bool {
        matches!(self, Change::Addition { .. })
    }

    pub fn is_modification(&self) -> bool {
        matches!(self, Change::Modification { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A problem with one change, reported by a validator or a deploy step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeError {
    pub elem_id: ElemId,
    pub severity: Severity,
    pub message: String,
    pub detailed_message: String,
}

impl ChangeError {
    pub fn new(
        elem_id: &ElemId,
        severity: Severity,
        message: impl Into<String>,
        detailed_message: impl Into<String>,
    ) -> Self {
        Self {
            elem_id: elem_id.clone(),
            severity,
            message: message.into(),
            detailed_message: detailed_message.into(),
        }
    }

    pub fn error(elem_id: &ElemId, message: impl Into<String>, detailed_message: impl Into<String>) -> Self {
        Self::new(elem_id, Severity::Error, message, detailed_message)
    }

    pub fn warning(elem_id: &ElemId, message: impl Into<String>, detailed_message: impl Into<String>) -> Self {
        Self::new(elem_id, Severity::Warning, message, detailed_message)
    }
}

/// Per-change outcome of a deploy call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployError {
    pub elem_id: ElemId,
    pub message: String,
}

impl DeployError {
    pub fn new(elem_id: &ElemId, message: impl Into<String>) -> Self {
        Self {
            elem_id: elem_id.clone(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployResult {
    pub applied_changes: Vec<Change>,
    pub errors: Vec<DeployError>,
}

impl DeployResult {
    pub fn extend(&mut self, other: DeployResult) {
        self.applied_changes.extend(other.applied_changes);
        self.errors.extend(other.errors);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyAction {
    Add,
    Remove,
}

/// Edge between two changes of a batch: `source` is deployed only after `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyChange {
    pub action: DependencyAction,
    pub source: ChangeId,
    pub target: ChangeId,
}

impl DependencyChange {
    pub fn add(source: ChangeId, target: ChangeId) -> Self {
        Self {
            action: DependencyAction::Add,
            source,
            target,
        }
    }

    pub fn remove(source: ChangeId, target: ChangeId) -> Self {
        Self {
            action: DependencyAction::Remove,
            source,
            target,
        }
    }
}

/// Lifecycle of a single change through the deploy pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    Pending,
    Validated,
    Rejected,
    Ordered,
    Deploying,
    Applied,
    Failed,
}

impl ChangeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChangeState::Rejected | ChangeState::Applied | ChangeState::Failed)
    }

    pub fn can_transition_to(&self, next: ChangeState) -> bool {
        use ChangeState::*;
        matches!(
            (self, next),
            (Pending, Validated)
                | (Pending, Rejected)
                | (Validated, Ordered)
                | (Ordered, Deploying)
                | (Deploying, Applied)
                | (Deploying, Failed)
        )
    }

    pub fn transition(self, next: ChangeState) -> Result<ChangeState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(EngineError::InvalidTransition {
                from: format!("{:?}", self),
                to: format!("{:?}", next),
            }
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::value::Values;

    #[test]
    fn test_change_accessors() {
        let type_id = ElemId::type_id("okta", "Group");
        let before = InstanceElement::new("admins", &type_id, Values::new());
        let mut after = before.clone();
        after.value.insert("name".to_string(), "Admins".into());

        let change = Change::modification(before, after);
        assert_eq!(change.action(), ActionName::Modify);
        assert_eq!(change.elem_id().full_name(), "okta.Group.instance.admins");
        assert!(change.instance().unwrap().value.contains_key("name"));
        assert!(change.before().unwrap().as_instance().unwrap().value.is_empty());
    }

    #[test]
    fn test_change_state_machine() {
        let state = ChangeState::Pending
            .transition(ChangeState::Validated)
            .and_then(|s| s.transition(ChangeState::Ordered))
            .and_then(|s| s.transition(ChangeState::Deploying))
            .and_then(|s| s.transition(ChangeState::Applied))
            .unwrap();
        assert!(state.is_terminal());

        assert!(ChangeState::Rejected.transition(ChangeState::Ordered).is_err());
        assert!(ChangeState::Validated.transition(ChangeState::Failed).is_err());
        assert!(ChangeState::Pending.transition(ChangeState::Rejected).unwrap().is_terminal());
        println!("✓ Change lifecycle only allows forward transitions");
    }
}
