use tracing::debug;

use crate::query_graph::types::{
    execution::{ExecutionResult, ValidationVerdict},
    query::QuerySpec,
};

/// Decides whether an execution is accepted, refined or abandoned.
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    max_retries: u32,
    min_rows: usize,
}

impl Validator {
    pub fn new(max_retries: u32, min_rows: usize) -> Self {
        Self {
            max_retries,
            min_rows,
        }
    }

    /// `attempt` counts executions so far (first run is 1) and
    /// `empty_refines` how often an empty result was already relaxed.
    pub fn validate(
        &self,
        result: &ExecutionResult,
        spec: &QuerySpec,
        attempt: u32,
        empty_refines: u32,
    ) -> ValidationVerdict {
        let verdict = if let Some(error) = result.error() {
            if attempt < self.max_retries {
                ValidationVerdict::refine(error.to_string(), spec.confidence * 0.5)
            } else {
                ValidationVerdict::fallback(
                    format!("giving up after {attempt} attempt(s): {error}"),
                    spec.confidence.min(0.2),
                )
            }
        } else if result.has_no_data() && !spec.filters.is_empty() {
            if empty_refines == 0 && attempt < self.max_retries {
                ValidationVerdict::refine(
                    "no rows matched; relaxing the most selective filter",
                    spec.confidence * 0.5,
                )
            } else {
                ValidationVerdict::fallback(
                    "no rows matched the filters",
                    spec.confidence.min(0.2),
                )
            }
        } else {
            let sufficiency = self.sufficiency(result, spec);
            ValidationVerdict::accept(
                format!("{} row(s) returned", result.row_count()),
                spec.confidence * (0.5 + 0.5 * sufficiency),
            )
        };

        debug!(
            attempt,
            accepted = verdict.accepted(),
            refine = verdict.needs_refine(),
            fallback = verdict.needs_fallback(),
            reason = verdict.reason(),
            "Validated result"
        );
        verdict
    }

    /// 1.0 when the data can support the answer, lower when thin.
    fn sufficiency(&self, result: &ExecutionResult, spec: &QuerySpec) -> f64 {
        if result.has_no_data() {
            return 0.0;
        }
        let rows = result.row_count();
        let grouped = spec.query_type.expects_aggregation() && !spec.group_by.is_empty();
        if grouped && rows < self.min_rows {
            #[allow(clippy::cast_precision_loss)]
            return rows as f64 / self.min_rows as f64;
        }
        1.0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        error::QueryError,
        query_graph::types::query::{AggFunc, Aggregation, Filter, Operator, QueryType},
        table_store::Row,
    };

    fn row(value: i64) -> Row {
        let mut row = Row::new();
        row.insert("total".to_string(), json!(value));
        row
    }

    fn ok(rows: Vec<Row>) -> ExecutionResult {
        ExecutionResult::success("SELECT".to_string(), rows, Duration::ZERO)
    }

    fn failed() -> ExecutionResult {
        ExecutionResult::failure(
            "SELECT".to_string(),
            QueryError::Execution("no such column".to_string()),
            Duration::ZERO,
        )
    }

    fn filtered_spec() -> QuerySpec {
        QuerySpec {
            filters: vec![Filter {
                column: "Region".to_string(),
                operator: Operator::Eq,
                value: json!("north"),
            }],
            ..QuerySpec::row_count("sales", 0.8)
        }
    }

    #[test]
    fn errors_refine_until_bound() {
        let validator = Validator::new(2, 2);
        let spec = QuerySpec::row_count("sales", 0.8);
        let first = validator.validate(&failed(), &spec, 1, 0);
        assert!(first.needs_refine());
        assert_eq!(first.reason(), "execution failed: no such column");

        let second = validator.validate(&failed(), &spec, 2, 0);
        assert!(second.needs_fallback());
    }

    #[test]
    fn linear_never_refines() {
        let validator = Validator::new(0, 2);
        assert!(validator
            .validate(&failed(), &QuerySpec::row_count("sales", 0.8), 1, 0)
            .needs_fallback());
        assert!(validator
            .validate(&ok(Vec::new()), &filtered_spec(), 1, 0)
            .needs_fallback());
    }

    #[test]
    fn empty_filtered_result_refines_once() {
        let validator = Validator::new(5, 2);
        assert!(validator
            .validate(&ok(Vec::new()), &filtered_spec(), 1, 0)
            .needs_refine());
        assert!(validator
            .validate(&ok(Vec::new()), &filtered_spec(), 2, 1)
            .needs_fallback());
    }

    #[test]
    fn null_aggregate_counts_as_empty() {
        let validator = Validator::new(2, 2);
        let mut null_row = Row::new();
        null_row.insert("total".to_string(), serde_json::Value::Null);
        assert!(validator
            .validate(&ok(vec![null_row]), &filtered_spec(), 1, 0)
            .needs_refine());
    }

    #[test]
    fn rows_are_accepted_without_refine() {
        let validator = Validator::new(2, 2);
        let verdict = validator.validate(&ok(vec![row(1250)]), &filtered_spec(), 2, 1);
        assert!(verdict.accepted());
        assert!((verdict.confidence() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn thin_grouped_result_lowers_confidence() {
        let validator = Validator::new(2, 4);
        let spec = QuerySpec {
            query_type: QueryType::Analytical,
            aggregations: vec![Aggregation::new(AggFunc::Sum, "Amount")],
            group_by: vec!["Region".to_string()],
            ..QuerySpec::row_count("sales", 1.0)
        };
        let thin = validator.validate(&ok(vec![row(1)]), &spec, 1, 0);
        let full = validator.validate(&ok(vec![row(1); 4]), &spec, 1, 0);
        assert!(thin.accepted() && full.accepted());
        assert!(thin.confidence() < full.confidence());
        assert!((thin.confidence() - 0.625).abs() < 1e-9);
    }

    #[test]
    fn empty_unfiltered_result_is_accepted_with_low_confidence() {
        let validator = Validator::new(2, 2);
        let verdict = validator.validate(&ok(Vec::new()), &QuerySpec::row_count("t", 0.8), 1, 0);
        assert!(verdict.accepted());
        assert!((verdict.confidence() - 0.4).abs() < 1e-9);
    }
}
