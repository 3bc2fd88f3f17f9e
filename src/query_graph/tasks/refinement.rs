use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::{sql_synthesizer::check_filter, spec_builder::SpecBuilder};
use crate::{
    error::QueryError,
    query_graph::types::{
        execution::ExecutionResult,
        query::{AggFunc, QuerySpec},
    },
    table_store::ColumnInfo,
};

const REFINE_PENALTY: f64 = 0.9;

/// Produces a revised spec after an unsatisfactory attempt.
pub struct Refiner {
    builder: Arc<SpecBuilder>,
}

impl Refiner {
    pub fn new(builder: Arc<SpecBuilder>) -> Self {
        Self { builder }
    }

    /// Always returns a new spec; `previous` is left untouched.
    #[instrument(skip_all)]
    pub async fn refine(
        &self,
        question: &str,
        previous: &QuerySpec,
        result: &ExecutionResult,
        schema: &[ColumnInfo],
    ) -> QuerySpec {
        let next = match result.error() {
            Some(error) if error.is_timeout() => {
                info!("Retrying unchanged spec after timeout");
                previous.clone()
            }
            Some(QueryError::Spec(reason)) => {
                info!(%reason, "Dropping invalid parts of the spec");
                sanitize(previous)
            }
            Some(error) => {
                match self
                    .builder
                    .repair(question, previous, &error.to_string(), schema)
                    .await
                {
                    Ok(repaired) => {
                        info!("Spec repaired from execution feedback");
                        repaired
                    }
                    Err(e) => {
                        warn!(error = %e, "Repair failed; dropping filters");
                        QuerySpec {
                            filters: Vec::new(),
                            ..previous.clone()
                        }
                    }
                }
            }
            None if result.has_no_data() => relax_most_selective(previous),
            None => previous.clone(),
        };

        QuerySpec {
            confidence: (next.confidence * REFINE_PENALTY).clamp(0.0, 1.0),
            ..next
        }
    }
}

/// Removes the filter most likely to have emptied the result.
pub fn relax_most_selective(spec: &QuerySpec) -> QuerySpec {
    let mut filters = spec.filters.clone();
    let most_selective = filters
        .iter()
        .enumerate()
        .min_by_key(|(idx, f)| (f.operator.selectivity_rank(), *idx))
        .map(|(idx, _)| idx);
    if let Some(idx) = most_selective {
        let removed = filters.remove(idx);
        info!(column = %removed.column, operator = %removed.operator, "Relaxed filter");
    }
    QuerySpec {
        filters,
        ..spec.clone()
    }
}

/// Keeps only the parts of `spec` that render.
fn sanitize(spec: &QuerySpec) -> QuerySpec {
    QuerySpec {
        filters: spec
            .filters
            .iter()
            .filter(|f| check_filter(f).is_ok())
            .cloned()
            .collect(),
        aggregations: spec
            .aggregations
            .iter()
            .filter(|a| !a.column.trim().is_empty())
            .filter(|a| !a.is_star() || a.function == AggFunc::Count)
            .cloned()
            .collect(),
        limit: spec.limit.filter(|l| *l > 0),
        ..spec.clone()
    }
}
