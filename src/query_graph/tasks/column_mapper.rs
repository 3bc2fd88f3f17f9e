use strsim::jaro_winkler;
use tracing::{debug, instrument, warn};

use crate::{query_graph::utils::PromptRunner, table_store::ColumnInfo};

const FUZZY_THRESHOLD: f64 = 0.88;
const LLM_MATCH_SCORE: f64 = 0.6;

/// Business vocabulary and the column names it usually lives under.
const SYNONYMS: &[(&str, &[&str])] = &[
    ("revenue", &["revenue", "amount", "sales", "total", "price", "value"]),
    ("sales", &["sales", "amount", "revenue", "total"]),
    ("income", &["income", "revenue", "amount"]),
    ("spend", &["spend", "amount", "cost"]),
    ("profit", &["profit", "margin"]),
    ("price", &["price", "unitprice", "cost"]),
    ("cost", &["cost", "price"]),
    ("quantity", &["quantity", "qty", "units"]),
    ("units", &["units", "qty", "quantity"]),
    ("volume", &["volume", "qty", "quantity", "units"]),
    ("date", &["date", "orderdate", "timestamp", "time"]),
    ("time", &["time", "date", "timestamp"]),
    ("month", &["month", "date", "period"]),
    ("period", &["period", "month", "date"]),
    ("customer", &["customer", "client", "buyer"]),
    ("client", &["client", "customer"]),
    ("product", &["product", "item", "sku"]),
    ("item", &["item", "product", "sku"]),
    ("region", &["region", "area", "territory", "location", "state"]),
    ("location", &["location", "region", "city", "state"]),
    ("category", &["category", "segment", "type", "class"]),
    ("segment", &["segment", "category"]),
    ("store", &["store", "shop", "branch", "outlet"]),
    ("channel", &["channel", "source"]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMethod {
    Exact,
    Synonym,
    Substring,
    Fuzzy,
    Llm,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMatch {
    pub column: String,
    pub score: f64,
    pub method: MatchMethod,
}

pub struct ColumnMapper {
    runner: PromptRunner,
}

impl ColumnMapper {
    pub fn new(runner: PromptRunner) -> Self {
        Self { runner }
    }

    /// Resolves a business term to one of `columns`.
    ///
    /// The LLM is consulted only when no lexical rule matches, and its answer
    /// is accepted only if it names a listed column.
    #[instrument(skip(self, columns))]
    pub async fn map_term(&self, term: &str, columns: &[ColumnInfo]) -> Option<ColumnMatch> {
        if term.trim() == "*" || columns.is_empty() {
            return None;
        }
        if let Some(found) = lexical_match(term, columns) {
            debug!(column = %found.column, score = found.score, method = ?found.method, "Lexical match");
            return Some(found);
        }

        let prompt = self.build_prompt(term, columns);
        let reply = match self.runner.ask("column mapping", &prompt, 0.0).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Column mapping call failed");
                return None;
            }
        };

        let answer = reply
            .trim()
            .trim_matches(|c: char| c == '"' || c == '`' || c == '\'' || c == '.')
            .trim();
        let column = columns
            .iter()
            .find(|c| c.name == answer)
            .or_else(|| columns.iter().find(|c| c.name.eq_ignore_ascii_case(answer)))?;

        debug!(column = %column.name, "LLM-assisted match");
        Some(ColumnMatch {
            column: column.name.clone(),
            score: LLM_MATCH_SCORE,
            method: MatchMethod::Llm,
        })
    }

    fn build_prompt(&self, term: &str, columns: &[ColumnInfo]) -> String {
        let listing = columns
            .iter()
            .map(|c| format!("- {} ({})", c.name, c.data_type.as_str()))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Map the business term to a column of the table.\n\n\
            TERM: {term}\n\n\
            COLUMNS:\n{listing}\n\n\
            Reply with exactly one column name copied verbatim from COLUMNS, \
            or NONE if no column fits. Do not invent column names."
        )
    }
}

pub fn normalize(s: &str) -> String {
    s.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Deterministic matching: exact, then synonym, then substring, then fuzzy.
pub fn lexical_match(term: &str, columns: &[ColumnInfo]) -> Option<ColumnMatch> {
    let wanted = normalize(term);
    if wanted.is_empty() {
        return None;
    }
    let normalized: Vec<(String, &ColumnInfo)> =
        columns.iter().map(|c| (normalize(&c.name), c)).collect();

    let found = |column: &ColumnInfo, score: f64, method: MatchMethod| ColumnMatch {
        column: column.name.clone(),
        score,
        method,
    };

    if let Some((_, column)) = normalized.iter().find(|(name, _)| *name == wanted) {
        return Some(found(column, 1.0, MatchMethod::Exact));
    }

    for word in words(term) {
        for candidate in synonyms(&word) {
            let hit = normalized.iter().find(|(name, _)| {
                name == candidate || (candidate.len() >= 4 && name.contains(candidate))
            });
            if let Some((_, column)) = hit {
                return Some(found(column, 0.9, MatchMethod::Synonym));
            }
        }
    }

    if wanted.len() >= 3 {
        let substring = normalized
            .iter()
            .filter(|(name, _)| {
                name.len() >= 3 && (name.contains(&wanted) || wanted.contains(name.as_str()))
            })
            .map(|(name, column)| {
                #[allow(clippy::cast_precision_loss)]
                let overlap = name.len().min(wanted.len()) as f64
                    / name.len().max(wanted.len()) as f64;
                found(column, 0.75 + 0.15 * overlap, MatchMethod::Substring)
            });
        if let Some(best) = best_of(substring) {
            return Some(best);
        }
    }

    let fuzzy = normalized.iter().filter_map(|(name, column)| {
        let similarity = jaro_winkler(&wanted, name);
        (similarity >= FUZZY_THRESHOLD)
            .then(|| found(column, similarity * 0.85, MatchMethod::Fuzzy))
    });
    best_of(fuzzy)
}

/// Highest score wins; the earlier column wins a tie.
fn best_of(candidates: impl Iterator<Item = ColumnMatch>) -> Option<ColumnMatch> {
    candidates.fold(None, |best: Option<ColumnMatch>, candidate| match best {
        Some(b) if b.score >= candidate.score => Some(b),
        _ => Some(candidate),
    })
}

fn words(term: &str) -> Vec<String> {
    term.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_ascii_lowercase)
        .collect()
}

fn synonyms(word: &str) -> &'static [&'static str] {
    let singular = word.strip_suffix('s').unwrap_or(word);
    SYNONYMS
        .iter()
        .find(|(key, _)| *key == word || *key == singular)
        .map_or(&[], |(_, list)| *list)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{table_store::ColumnType, testing::ScriptedLlm};

    fn columns(names: &[&str]) -> Vec<ColumnInfo> {
        names
            .iter()
            .map(|name| ColumnInfo {
                name: (*name).to_string(),
                data_type: ColumnType::Text,
            })
            .collect()
    }

    fn mapper(llm: ScriptedLlm) -> ColumnMapper {
        ColumnMapper::new(PromptRunner::new(
            Arc::new(llm),
            64,
            std::time::Duration::from_secs(1),
        ))
    }

    #[test]
    fn exact_match_ignores_case_and_separators() {
        let cols = columns(&["Order_Date", "Amount"]);
        let m = lexical_match("order date", &cols).unwrap();
        assert_eq!(m.column, "Order_Date");
        assert_eq!(m.method, MatchMethod::Exact);
    }

    #[test]
    fn synonym_match() {
        let cols = columns(&["Region", "Amount", "Month"]);
        let m = lexical_match("revenue", &cols).unwrap();
        assert_eq!(m.column, "Amount");
        assert_eq!(m.method, MatchMethod::Synonym);

        let m = lexical_match("total revenue", &cols).unwrap();
        assert_eq!(m.column, "Amount");
    }

    #[test]
    fn substring_and_fuzzy_match() {
        let cols = columns(&["customer_name", "Amount"]);
        let m = lexical_match("name", &cols).unwrap();
        assert_eq!(m.column, "customer_name");
        assert_eq!(m.method, MatchMethod::Substring);

        let cols = columns(&["Discount", "Amount"]);
        let m = lexical_match("discont", &cols).unwrap();
        assert_eq!(m.column, "Discount");
        assert_eq!(m.method, MatchMethod::Fuzzy);
    }

    #[test]
    fn unrelated_term_is_inconclusive() {
        let cols = columns(&["Region", "Amount", "Month"]);
        assert!(lexical_match("widget", &cols).is_none());
    }

    #[tokio::test]
    async fn llm_answer_must_be_a_listed_column() {
        let cols = columns(&["Region", "Amount"]);

        let m = mapper(ScriptedLlm::new().on(&["TERM: territory code"], "`Region`"))
            .map_term("territory code", &cols)
            .await
            .unwrap();
        assert_eq!(m.column, "Region");
        assert_eq!(m.method, MatchMethod::Llm);

        let invented = mapper(ScriptedLlm::new().on(&["TERM: widget"], "widget_count"))
            .map_term("widget", &cols)
            .await;
        assert!(invented.is_none());

        let none = mapper(ScriptedLlm::new().on(&["TERM: widget"], "NONE"))
            .map_term("widget", &cols)
            .await;
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn llm_failure_is_not_an_error() {
        let cols = columns(&["Region"]);
        assert!(mapper(ScriptedLlm::new()).map_term("widget", &cols).await.is_none());
    }

    #[tokio::test]
    async fn lexical_hit_skips_llm() {
        let llm = Arc::new(ScriptedLlm::new());
        let mapper = ColumnMapper::new(PromptRunner::new(
            llm.clone(),
            64,
            std::time::Duration::from_secs(1),
        ));
        mapper
            .map_term("revenue", &columns(&["Amount"]))
            .await
            .unwrap();
        assert!(llm.prompts().is_empty());
    }
}
