use std::{
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use regex::Regex;
use tracing::{error, info, instrument};

use super::sql_synthesizer::synthesize;
use crate::{
    error::QueryError,
    query_graph::types::{execution::ExecutionResult, query::QuerySpec},
    table_store::TableStore,
};

const FORBIDDEN: &[&str] = &[
    "DROP", "DELETE", "UPDATE", "INSERT", "ALTER", "TRUNCATE", "ATTACH", "PRAGMA", "CREATE",
    "REPLACE", "DETACH", "VACUUM",
];

struct GuardPatterns {
    literal: Regex,
    quoted_ident: Regex,
    word: Regex,
}

fn patterns() -> Option<&'static GuardPatterns> {
    static RE: OnceLock<Option<GuardPatterns>> = OnceLock::new();
    RE.get_or_init(|| {
        Some(GuardPatterns {
            literal: Regex::new(r"'(?:[^']|'')*'").ok()?,
            quoted_ident: Regex::new(r#""(?:[^"]|"")*""#).ok()?,
            word: Regex::new(r"[A-Za-z_]+").ok()?,
        })
    })
    .as_ref()
}

/// Refuses anything but a single read-only statement.
///
/// String literals and quoted identifiers are blanked before the keyword
/// scan, so a column such as `"Last Update"` is not read as `UPDATE`.
pub fn guard(sql: &str) -> Result<(), QueryError> {
    let patterns =
        patterns().ok_or_else(|| QueryError::Spec("statement guard unavailable".to_string()))?;
    let without_literals = patterns.literal.replace_all(sql, "''");
    let without_idents = patterns.quoted_ident.replace_all(&without_literals, "\"\"");
    let body = without_idents.trim().trim_end_matches(';').trim();

    if body.is_empty() {
        return Err(QueryError::Spec("empty statement".to_string()));
    }
    if body.contains(';') {
        return Err(QueryError::Spec("multiple statements are not allowed".to_string()));
    }

    let mut words = patterns.word.find_iter(body).map(|m| m.as_str().to_ascii_uppercase());
    match words.next().as_deref() {
        Some("SELECT" | "WITH") => {}
        _ => return Err(QueryError::Spec("only SELECT queries are allowed".to_string())),
    }
    if let Some(word) = words.find(|w| FORBIDDEN.contains(&w.as_str())) {
        return Err(QueryError::Spec(format!("`{word}` is not allowed")));
    }
    Ok(())
}

/// Runs statements against the table store under a time bound.
pub struct Executor {
    store: Arc<dyn TableStore>,
    timeout: Duration,
    row_cap: u32,
}

impl Executor {
    pub fn new(store: Arc<dyn TableStore>, timeout: Duration, row_cap: u32) -> Self {
        Self {
            store,
            timeout,
            row_cap,
        }
    }

    /// Synthesises and runs `spec`. Never fails: problems are carried in
    /// the returned result.
    #[instrument(skip(self, spec), fields(table = %spec.primary_table))]
    pub async fn run_spec(&self, spec: &QuerySpec) -> ExecutionResult {
        match synthesize(spec, self.row_cap) {
            Ok(sql) => self.run_sql(&sql).await,
            Err(e) => {
                error!(error = %e, "Could not render query");
                ExecutionResult::failure(String::new(), e, Duration::ZERO)
            }
        }
    }

    pub async fn run_sql(&self, sql: &str) -> ExecutionResult {
        let started = Instant::now();
        if let Err(e) = guard(sql) {
            error!(error = %e, %sql, "Rejected statement");
            return ExecutionResult::failure(sql.to_string(), e, started.elapsed());
        }

        match tokio::time::timeout(self.timeout, self.store.execute(sql)).await {
            Ok(Ok(rows)) => {
                info!(%sql, rows = rows.len(), "Query executed");
                ExecutionResult::success(sql.to_string(), rows, started.elapsed())
            }
            Ok(Err(e)) => {
                error!(error = %e, %sql, "Query failed");
                ExecutionResult::failure(
                    sql.to_string(),
                    QueryError::Execution(e.to_string()),
                    started.elapsed(),
                )
            }
            Err(_) => {
                error!(%sql, timeout = ?self.timeout, "Query timed out");
                ExecutionResult::failure(
                    sql.to_string(),
                    QueryError::timeout("query execution", self.timeout),
                    started.elapsed(),
                )
            }
        }
    }
}
