use std::{fmt::Write, sync::OnceLock};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::QueryError,
    query_graph::utils::{truncate, PromptRunner},
    table_store::Row,
};

/// Rows backing one part of the answer.
#[derive(Debug, Clone, Copy)]
pub struct NarrativePart<'a> {
    /// Sub-question this part answers, if the question was decomposed.
    pub label: Option<&'a str>,
    pub rows: &'a [Row],
}

pub struct NarrativeGenerator {
    runner: PromptRunner,
    temperature: f32,
    preview_rows: usize,
}

impl NarrativeGenerator {
    pub fn new(runner: PromptRunner, temperature: f32, preview_rows: usize) -> Self {
        Self {
            runner,
            temperature,
            preview_rows,
        }
    }

    /// Answers from the given rows.
    ///
    /// The reply is kept only if it references every non-empty part;
    /// otherwise the templated answer is returned.
    #[instrument(skip_all, fields(parts = parts.len()))]
    pub async fn narrate(&self, question: &str, parts: &[NarrativePart<'_>]) -> String {
        if parts.iter().all(|p| p.rows.is_empty()) {
            return template(parts);
        }

        let prompt = self.build_prompt(question, parts);
        debug!(%prompt, "Generated narrative prompt");

        match self.runner.ask("narration", &prompt, self.temperature).await {
            Ok(reply) => {
                let reply = reply.trim();
                if reply.is_empty() {
                    warn!("Empty narrative; using template");
                } else if grounded(reply, parts) {
                    info!("Narrative generated");
                    return reply.to_string();
                } else {
                    warn!(reply = %truncate(reply, 200), "Narrative numbers not found in data; using template");
                }
            }
            Err(e) => {
                let e = QueryError::Narration(e.to_string());
                error!(error = %e, "Narrative generation failed; using template");
            }
        }
        template(parts)
    }

    /// Answers without data. Numbers not already in the question are not
    /// allowed, since there is nothing to back them.
    #[instrument(skip_all)]
    pub async fn narrate_fallback(&self, question: &str, columns: &[String], reason: &str) -> String {
        let prompt = format!(
            "Answer the question without data.\n\n\
            The structured query could not be completed ({reason}). \
            Explain briefly what the question needs and how the user could rephrase it. \
            Do not state any figures.\n\n\
            AVAILABLE COLUMNS: {}\n\n\
            QUESTION: {question}",
            if columns.is_empty() {
                "none".to_string()
            } else {
                columns.join(", ")
            }
        );

        match self.runner.ask("fallback narration", &prompt, self.temperature).await {
            Ok(reply) => {
                let reply = reply.trim();
                let allowed = numeric_tokens(question);
                let invented = numeric_tokens(reply)
                    .iter()
                    .any(|token| !allowed.iter().any(|a| (a.value - token.value).abs() < 1e-9));
                if !reply.is_empty() && !invented {
                    return reply.to_string();
                }
                warn!("Fallback narrative rejected; using template");
            }
            Err(e) => {
                let e = QueryError::Narration(e.to_string());
                error!(error = %e, "Fallback narration failed; using template");
            }
        }
        fallback_template(question, columns, reason)
    }

    fn build_prompt(&self, question: &str, parts: &[NarrativePart<'_>]) -> String {
        let mut prompt = String::from(
            "Answer the question using only the DATA below.\n\n\
            Rules:\n\
            - Every number you mention must appear in the DATA.\n\
            - Do not estimate, extrapolate or invent figures.\n\
            - Keep it to a few plain sentences for a business reader.\n\n",
        );
        for part in parts {
            match part.label {
                Some(label) => {
                    let _ = writeln!(prompt, "DATA for \"{label}\":");
                }
                None => prompt.push_str("DATA:\n"),
            }
            prompt.push_str(&render_table(part.rows, self.preview_rows));
            prompt.push('\n');
        }
        let _ = write!(prompt, "QUESTION: {question}");
        prompt
    }
}

pub fn render_table(rows: &[Row], limit: usize) -> String {
    let Some(first) = rows.first() else {
        return "(no rows)\n".to_string();
    };
    let mut out = first.keys().cloned().collect::<Vec<_>>().join(" | ");
    out.push('\n');
    for row in rows.iter().take(limit) {
        out.push_str(
            &row.values()
                .map(display_value)
                .collect::<Vec<_>>()
                .join(" | "),
        );
        out.push('\n');
    }
    if rows.len() > limit {
        let _ = writeln!(out, "... {} more row(s)", rows.len() - limit);
    }
    out
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Answer built directly from the first row of each part.
pub fn template(parts: &[NarrativePart<'_>]) -> String {
    parts
        .iter()
        .map(|part| {
            let body = match part.rows.first() {
                None => "No matching rows.".to_string(),
                Some(row) => {
                    let fields = row
                        .iter()
                        .map(|(column, value)| format!("{column}={}", display_value(value)))
                        .collect::<Vec<_>>()
                        .join(", ");
                    if part.rows.len() > 1 {
                        format!("Top result: {fields} ({} rows)", part.rows.len())
                    } else {
                        format!("Top result: {fields}")
                    }
                }
            };
            match part.label {
                Some(label) => format!("{label}: {body}"),
                None => body,
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn fallback_template(question: &str, columns: &[String], reason: &str) -> String {
    let mut text = format!("I could not answer \"{question}\" from the data ({reason}).");
    if !columns.is_empty() {
        let _ = write!(
            text,
            " Try rephrasing with the available columns: {}.",
            columns.join(", ")
        );
    }
    text
}

#[derive(Debug, Clone, Copy)]
struct NumericToken {
    value: f64,
    decimals: i32,
}

fn number_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d[\d,]*(?:\.\d+)?").ok())
        .as_ref()
}

fn numeric_tokens(text: &str) -> Vec<NumericToken> {
    let Some(pattern) = number_pattern() else {
        return Vec::new();
    };
    pattern
        .find_iter(text)
        .filter_map(|m| {
            let raw = m.as_str().trim_end_matches(',').replace(',', "");
            let decimals = raw
                .split_once('.')
                .map_or(0, |(_, frac)| i32::try_from(frac.len()).unwrap_or(0));
            raw.parse::<f64>()
                .ok()
                .map(|value| NumericToken { value, decimals })
        })
        .collect()
}

fn row_numbers(rows: &[Row]) -> Vec<f64> {
    let mut numbers = Vec::new();
    for value in rows.iter().flat_map(|row| row.values()) {
        match value {
            Value::Number(n) => numbers.extend(n.as_f64().map(f64::abs)),
            Value::String(s) => numbers.extend(numeric_tokens(s).iter().map(|t| t.value)),
            _ => {}
        }
    }
    numbers
}

fn matches(token: NumericToken, value: f64) -> bool {
    let scale = 10_f64.powi(token.decimals);
    ((value * scale).round() / scale - token.value).abs() < 1e-9 * token.value.abs().max(1.0)
}

/// True when `text` states a number that no value in `rows` backs.
pub fn has_unbacked_figures(text: &str, rows: &[Row]) -> bool {
    let values = row_numbers(rows);
    numeric_tokens(text)
        .iter()
        .any(|token| !values.iter().any(|value| matches(*token, *value)))
}

fn row_texts(rows: &[Row]) -> Vec<String> {
    rows.iter()
        .flat_map(|row| row.values())
        .filter_map(|value| match value {
            Value::String(s) if s.chars().any(char::is_alphabetic) => Some(s.to_lowercase()),
            _ => None,
        })
        .collect()
}

/// Every non-empty part must be referenced by the answer.
///
/// A part is referenced by a number matching one of its values. When either
/// the answer or the part has no numbers, a text cell quoted in the answer
/// counts instead.
fn grounded(answer: &str, parts: &[NarrativePart<'_>]) -> bool {
    let tokens = numeric_tokens(answer);
    let lowered = answer.to_lowercase();
    parts.iter().filter(|p| !p.rows.is_empty()).all(|part| {
        let values = row_numbers(part.rows);
        if !tokens.is_empty() && !values.is_empty() {
            return tokens
                .iter()
                .any(|token| values.iter().any(|value| matches(*token, *value)));
        }
        row_texts(part.rows)
            .iter()
            .any(|text| lowered.contains(text.as_str()))
    })
}
