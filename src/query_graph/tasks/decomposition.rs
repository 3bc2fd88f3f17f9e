use tracing::{debug, info, warn};

use crate::query_graph::{
    graph::Policy,
    types::query::QueryType,
    utils::{parse_llm_json, PromptRunner},
};

const CONJUNCTIONS: &[&str] = &[" and ", " vs ", " vs. ", " versus ", " compared to ", ";"];

pub struct Decomposer {
    runner: PromptRunner,
    max_parts: usize,
}

impl Decomposer {
    pub fn new(runner: PromptRunner, max_parts: usize) -> Self {
        Self { runner, max_parts }
    }

    /// Splits `question` into independent sub-questions, in order.
    ///
    /// Returns an empty list when the question does not split into at
    /// least two parts.
    pub async fn decompose(&self, question: &str, table: &str) -> Vec<String> {
        let prompt = self.build_prompt(question, table);
        let reply = match self.runner.ask("decomposition", &prompt, 0.0).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Decomposition call failed");
                return Vec::new();
            }
        };

        let parts: Vec<String> = match parse_llm_json::<Vec<String>>(&reply) {
            Ok(parts) => parts
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .take(self.max_parts)
                .collect(),
            Err(e) => {
                warn!(error = %e, "Decomposition reply rejected");
                return Vec::new();
            }
        };

        if parts.len() < 2 {
            debug!(parts = parts.len(), "Question does not decompose");
            return Vec::new();
        }
        info!(?parts, "Decomposed question");
        parts
    }

    fn build_prompt(&self, question: &str, table: &str) -> String {
        format!(
            "Split the question into independent sub-questions over the `{table}` table.\n\n\
            Each sub-question must be answerable on its own with a single query and \
            must restate the measure it asks about. Keep the order of the original \
            question and use at most {} sub-questions.\n\n\
            QUESTION: {question}\n\n\
            Respond ONLY with a JSON array of strings.",
            self.max_parts
        )
    }
}

/// Whether the adaptive policy should try splitting the question.
pub fn should_decompose(policy: Policy, query_type: QueryType, question: &str) -> bool {
    if !policy.allows_decomposition() {
        return false;
    }
    if matches!(query_type, QueryType::Comparison | QueryType::Timeseries) {
        return true;
    }
    let lowered = format!(" {} ", question.to_lowercase());
    CONJUNCTIONS.iter().any(|marker| lowered.contains(marker))
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::testing::ScriptedLlm;

    fn decomposer(llm: ScriptedLlm) -> Decomposer {
        Decomposer::new(
            PromptRunner::new(Arc::new(llm), 256, Duration::from_secs(1)),
            4,
        )
    }

    #[test]
    fn linear_policy_never_decomposes() {
        assert!(!should_decompose(
            Policy::Linear,
            QueryType::Comparison,
            "Jan vs Feb"
        ));
    }

    #[test]
    fn adaptive_triggers() {
        assert!(should_decompose(Policy::Adaptive, QueryType::Timeseries, "revenue"));
        assert!(should_decompose(
            Policy::Adaptive,
            QueryType::Summary,
            "revenue and margin"
        ));
        assert!(should_decompose(
            Policy::Adaptive,
            QueryType::Analytical,
            "east versus west"
        ));
        assert!(!should_decompose(
            Policy::Adaptive,
            QueryType::Summary,
            "total revenue"
        ));
        assert!(!should_decompose(
            Policy::Adaptive,
            QueryType::Summary,
            "brand revenue"
        ));
    }

    #[tokio::test]
    async fn splits_in_order_and_caps_parts() {
        let parts = decomposer(ScriptedLlm::new().on(
            &["Split the question"],
            r#"["a", "b", "c", "d", "e"]"#,
        ))
        .decompose("a, b, c, d and e", "sales")
        .await;
        assert_eq!(parts, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn single_part_is_not_a_decomposition() {
        let parts = decomposer(ScriptedLlm::new().on(&["Split the question"], r#"["all"]"#))
            .decompose("total revenue", "sales")
            .await;
        assert!(parts.is_empty());

        let parts = decomposer(ScriptedLlm::new().on(&["Split the question"], "two things"))
            .decompose("total revenue", "sales")
            .await;
        assert!(parts.is_empty());
    }
}
