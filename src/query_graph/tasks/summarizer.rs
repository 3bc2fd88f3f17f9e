use std::fmt::Write;

use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};

use super::{
    executor::Executor,
    narrative::{has_unbacked_figures, render_table},
    sql_synthesizer::quote_ident,
};
use crate::{
    error::QueryError,
    query_graph::{
        types::summary::{ColumnMetrics, DatasetSummary},
        utils::{truncate, PromptRunner},
    },
    table_store::{ColumnInfo, ColumnType, Row},
};

const MAX_METRIC_COLUMNS: usize = 5;

/// Writes an overview of a whole table from a few aggregate queries.
pub struct Summarizer {
    runner: PromptRunner,
    temperature: f32,
    sample_rows: usize,
}

impl Summarizer {
    pub fn new(runner: PromptRunner, temperature: f32, sample_rows: usize) -> Self {
        Self {
            runner,
            temperature,
            sample_rows,
        }
    }

    #[instrument(skip(self, executor, schema))]
    pub async fn summarize(
        &self,
        executor: &Executor,
        table: &str,
        schema: &[ColumnInfo],
    ) -> Result<DatasetSummary, QueryError> {
        let numeric: Vec<&ColumnInfo> = schema
            .iter()
            .filter(|c| matches!(c.data_type, ColumnType::Integer | ColumnType::Real))
            .take(MAX_METRIC_COLUMNS)
            .collect();

        let result = executor.run_sql(&metrics_sql(table, &numeric)).await;
        if let Some(e) = result.error() {
            return Err(e.clone());
        }
        let Some(totals) = result.rows().first() else {
            return Err(QueryError::Execution("metrics query returned no rows".to_string()));
        };
        let row_count = totals.get("row_count").and_then(Value::as_u64).unwrap_or(0);
        let metrics: Vec<ColumnMetrics> = numeric
            .iter()
            .enumerate()
            .map(|(index, column)| ColumnMetrics {
                column: column.name.clone(),
                non_null: totals
                    .get(&format!("c{index}_count"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                total: metric(totals, index, "sum"),
                average: metric(totals, index, "avg"),
                minimum: metric(totals, index, "min"),
                maximum: metric(totals, index, "max"),
            })
            .collect();

        let sample_sql = format!(
            "SELECT * FROM {} LIMIT {}",
            quote_ident(table),
            self.sample_rows
        );
        let sampled = executor.run_sql(&sample_sql).await;
        if let Some(e) = sampled.error() {
            warn!(error = %e, "Summarising without sample rows");
        }
        let sample = sampled.rows().to_vec();

        let mut backing = totals.clone();
        backing.insert("column_count".to_string(), json!(schema.len()));
        let mut evidence = vec![backing];
        evidence.extend(sample.iter().cloned());

        let fallback = template(table, row_count, schema.len(), &metrics);
        let summary = self
            .write_summary(table, row_count, schema.len(), &metrics, &sample, &evidence)
            .await
            .unwrap_or(fallback);

        info!(table, rows = row_count, metrics = metrics.len(), "Dataset summarised");
        Ok(DatasetSummary {
            table: table.to_string(),
            row_count,
            column_count: schema.len(),
            metrics,
            sample,
            summary,
        })
    }

    /// `None` when the reply is empty, fails, or cites figures that are
    /// not in `evidence`.
    async fn write_summary(
        &self,
        table: &str,
        row_count: u64,
        column_count: usize,
        metrics: &[ColumnMetrics],
        sample: &[Row],
        evidence: &[Row],
    ) -> Option<String> {
        let mut prompt = String::from(
            "Summarise the dataset below for a business reader.\n\n\
            Rules:\n\
            - Lead with the most important finding.\n\
            - Every number you mention must appear below.\n\
            - Keep it to one short paragraph.\n\n",
        );
        let _ = writeln!(prompt, "TABLE: {table}");
        let _ = writeln!(prompt, "ROWS: {row_count}");
        let _ = writeln!(prompt, "COLUMNS: {column_count}");
        if !metrics.is_empty() {
            prompt.push_str("METRICS:\n");
            for m in metrics {
                let _ = writeln!(prompt, "- {}", describe(m));
            }
        }
        prompt.push_str("SAMPLE:\n");
        prompt.push_str(&render_table(sample, self.sample_rows));

        match self
            .runner
            .ask("dataset summary", &prompt, self.temperature)
            .await
        {
            Ok(reply) => {
                let reply = reply.trim();
                if reply.is_empty() {
                    warn!("Empty dataset summary; using template");
                } else if has_unbacked_figures(reply, evidence) {
                    warn!(reply = %truncate(reply, 200), "Summary cites figures not in the data; using template");
                } else {
                    return Some(reply.to_string());
                }
            }
            Err(e) => {
                let e = QueryError::Narration(e.to_string());
                error!(error = %e, "Dataset summary failed; using template");
            }
        }
        None
    }
}

fn metrics_sql(table: &str, columns: &[&ColumnInfo]) -> String {
    let mut select = vec!["COUNT(*) AS row_count".to_string()];
    for (index, column) in columns.iter().enumerate() {
        let name = quote_ident(&column.name);
        select.push(format!("COUNT({name}) AS c{index}_count"));
        for (function, suffix) in [("SUM", "sum"), ("AVG", "avg"), ("MIN", "min"), ("MAX", "max")] {
            select.push(format!("{function}({name}) AS c{index}_{suffix}"));
        }
    }
    format!("SELECT {} FROM {}", select.join(", "), quote_ident(table))
}

fn metric(row: &Row, index: usize, suffix: &str) -> Option<f64> {
    row.get(&format!("c{index}_{suffix}")).and_then(Value::as_f64)
}

fn number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}

fn describe(m: &ColumnMetrics) -> String {
    match (m.total, m.average, m.minimum, m.maximum) {
        (Some(total), Some(average), Some(minimum), Some(maximum)) => format!(
            "{}: total {}, average {}, from {} to {}",
            m.column,
            number(total),
            number(average),
            number(minimum),
            number(maximum)
        ),
        _ => format!("{}: no values", m.column),
    }
}

/// Summary built from the metrics alone.
pub fn template(table: &str, row_count: u64, column_count: usize, metrics: &[ColumnMetrics]) -> String {
    let mut text = format!("{table} has {row_count} rows across {column_count} columns.");
    for m in metrics {
        let _ = write!(text, " {}.", describe(m));
    }
    text
}
