use std::time::Duration;

use serde_json::Value;

use crate::{error::QueryError, table_store::Row};

/// Outcome of running one statement.
///
/// Either rows or an error, never both; the constructors are the only way
/// to build one.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    rows: Vec<Row>,
    sql_text: String,
    error: Option<QueryError>,
    elapsed: Duration,
}

impl ExecutionResult {
    pub fn success(sql_text: String, rows: Vec<Row>, elapsed: Duration) -> Self {
        Self {
            rows,
            sql_text,
            error: None,
            elapsed,
        }
    }

    pub fn failure(sql_text: String, error: QueryError, elapsed: Duration) -> Self {
        Self {
            rows: Vec::new(),
            sql_text,
            error: Some(error),
            elapsed,
        }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// True when there are no rows or every value is NULL, as a scalar
    /// aggregate over no matching rows returns.
    pub fn has_no_data(&self) -> bool {
        self.rows.iter().all(|row| row.values().all(Value::is_null))
    }

    pub fn sql_text(&self) -> &str {
        &self.sql_text
    }

    pub fn error(&self) -> Option<&QueryError> {
        self.error.as_ref()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Accept,
    Refine,
    Fallback,
}

/// What the controller should do with an execution result.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationVerdict {
    decision: Decision,
    reason: String,
    confidence: f64,
}

impl ValidationVerdict {
    pub fn accept(reason: impl Into<String>, confidence: f64) -> Self {
        Self::new(Decision::Accept, reason, confidence)
    }

    pub fn refine(reason: impl Into<String>, confidence: f64) -> Self {
        Self::new(Decision::Refine, reason, confidence)
    }

    pub fn fallback(reason: impl Into<String>, confidence: f64) -> Self {
        Self::new(Decision::Fallback, reason, confidence)
    }

    fn new(decision: Decision, reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            decision,
            reason: reason.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn accepted(&self) -> bool {
        self.decision == Decision::Accept
    }

    pub fn needs_refine(&self) -> bool {
        self.decision == Decision::Refine
    }

    pub fn needs_fallback(&self) -> bool {
        self.decision == Decision::Fallback
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_has_no_rows() {
        let result = ExecutionResult::failure(
            "SELECT 1".to_string(),
            QueryError::Execution("boom".to_string()),
            Duration::from_millis(3),
        );
        assert_eq!(result.row_count(), 0);
        assert!(result.rows().is_empty());
        assert!(result.error().is_some());
        assert!(result.has_no_data());
    }

    #[test]
    fn null_only_rows_carry_no_data() {
        let mut row = Row::new();
        row.insert("total".to_string(), Value::Null);
        let result = ExecutionResult::success("SELECT".to_string(), vec![row.clone()], Duration::ZERO);
        assert!(result.has_no_data());

        row.insert("count".to_string(), Value::from(0));
        let result = ExecutionResult::success("SELECT".to_string(), vec![row], Duration::ZERO);
        assert!(!result.has_no_data());
    }

    #[test]
    fn verdict_flags_are_exclusive() {
        for verdict in [
            ValidationVerdict::accept("ok", 0.9),
            ValidationVerdict::refine("retry", 0.5),
            ValidationVerdict::fallback("give up", 0.1),
        ] {
            let set = [
                verdict.accepted(),
                verdict.needs_refine(),
                verdict.needs_fallback(),
            ]
            .iter()
            .filter(|f| **f)
            .count();
            assert_eq!(set, 1);
        }
        assert_eq!(ValidationVerdict::accept("ok", 1.7).confidence(), 1.0);
    }
}
