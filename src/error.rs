use thiserror::Error;

/// Fatal engine failures.
///
/// Recoverable, per-element problems are reported as values (`ChangeError`,
/// `FetchWarning`) and never through this type.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid element id '{0}': {1}")]
    InvalidElemId(String, String),

    #[error("Invalid path '{path}' for element '{root}'")]
    InvalidPath { root: String, path: String },

    #[error("Unknown field '{field}' in type '{type_name}'")]
    UnknownField { type_name: String, field: String },

    #[error("Cyclic dependency between changes {change_ids:?}")]
    CyclicDependency { change_ids: Vec<usize> },

    #[error("Filter '{filter}' failed during {stage}: {message}")]
    FilterFailed {
        filter: String,
        stage: String,
        message: String,
    },

    #[error("Invalid change state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("XML error: {0}")]
    Xml(String),
}
