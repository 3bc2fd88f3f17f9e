use std::time::Duration;

use thiserror::Error;

/// Failures that can occur while resolving a question into data.
///
/// None of these escape `Controller::process_query`; they are turned into
/// validation verdicts or a degraded answer at the state-machine boundary.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueryError {
    /// A business term could not be resolved to a column.
    #[error("could not map `{0}` to a column")]
    Mapping(String),

    /// The query specification is internally inconsistent.
    #[error("invalid query specification: {0}")]
    Spec(String),

    /// The table store rejected the statement.
    #[error("execution failed: {0}")]
    Execution(String),

    /// An external call exceeded its time bound.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    /// The text-completion capability failed outside narration.
    #[error("text completion failed: {0}")]
    Completion(String),

    /// The text-completion capability failed while writing the answer.
    #[error("narration failed: {0}")]
    Narration(String),
}

impl QueryError {
    pub(crate) fn timeout(operation: &str, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.to_string(),
            elapsed,
        }
    }

    pub(crate) fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
