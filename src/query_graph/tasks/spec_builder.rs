use std::fmt::Write;

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::column_mapper::ColumnMapper;
use crate::{
    error::QueryError,
    memory::ConversationTurn,
    query_graph::{
        types::query::{
            AggFunc, Aggregation, Direction, Filter, Operator, OrderBy, QuerySpec, QueryType,
        },
        utils::{parse_llm_json, pretty_log, PromptRunner},
    },
    table_store::ColumnInfo,
};

const FIRST_TRY_CERTAINTY: f64 = 0.9;
const RETRY_CERTAINTY: f64 = 0.5;
const DEFAULT_CERTAINTY: f64 = 0.3;
const UNMAPPED_CONFIDENCE_CAP: f64 = 0.3;

/// Intent as the LLM sees it: business terms, not yet column names.
#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SpecDraft {
    /// Terms for columns to list as-is.
    pub entities: Vec<String>,
    pub aggregations: Vec<DraftAggregation>,
    /// Terms to group by, most significant first.
    pub group_by: Vec<String>,
    pub order_by: Vec<DraftOrder>,
    pub filters: Vec<DraftFilter>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DraftAggregation {
    /// sum, avg, count, min or max.
    pub function: String,
    /// Business term or column; `*` or empty for counting rows.
    #[serde(default)]
    pub term: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DraftOrder {
    pub term: String,
    /// asc or desc.
    #[serde(default)]
    pub direction: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DraftFilter {
    pub term: String,
    /// One of =, !=, >, >=, <, <=, between, in.
    pub operator: String,
    /// A scalar, a [low, high] pair for between, or a list for in.
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct BuiltSpec {
    pub spec: QuerySpec,
    pub rationale: String,
    pub issues: Vec<QueryError>,
    /// Set when the spec is the whole-table default.
    pub nothing_mapped: bool,
}

/// Mapping bookkeeping while a draft is resolved.
#[derive(Default)]
struct Resolution {
    terms: usize,
    mapped: usize,
    score: f64,
    unmapped: Vec<String>,
    issues: Vec<QueryError>,
}

pub struct SpecBuilder {
    runner: PromptRunner,
    mapper: ColumnMapper,
}

impl SpecBuilder {
    pub fn new(runner: PromptRunner) -> Self {
        let mapper = ColumnMapper::new(runner.clone());
        Self { runner, mapper }
    }

    #[instrument(skip(self, schema, context))]
    pub async fn build(
        &self,
        question: &str,
        table: &str,
        schema: &[ColumnInfo],
        context: &[ConversationTurn],
    ) -> BuiltSpec {
        let (query_type, certainty) = self.classify(question).await;
        info!(query_type = query_type.as_str(), certainty, "Classified question");

        let (draft, extraction_issue) = match self
            .extract(question, query_type, table, schema, context)
            .await
        {
            Ok(draft) => (draft, None),
            Err(e) => {
                warn!(error = %e, "Extraction failed; using whole-table default");
                (SpecDraft::default(), Some(e))
            }
        };

        let mut built = self
            .resolve(query_type, certainty, table, schema, &draft)
            .await;
        built.issues.extend(extraction_issue);
        pretty_log("Built query spec", &built.spec);
        built
    }

    /// Restricted to the four labels; one retry, then `analytical`.
    pub async fn classify(&self, question: &str) -> (QueryType, f64) {
        let prompt = Self::classification_prompt(question);
        for certainty in [FIRST_TRY_CERTAINTY, RETRY_CERTAINTY] {
            match self.runner.ask("classification", &prompt, 0.0).await {
                Ok(reply) => {
                    if let Some(query_type) = QueryType::parse(&reply) {
                        return (query_type, certainty);
                    }
                    debug!(%reply, "Invalid classification");
                }
                Err(e) => debug!(error = %e, "Classification call failed"),
            }
        }
        (QueryType::Analytical, DEFAULT_CERTAINTY)
    }

    async fn extract(
        &self,
        question: &str,
        query_type: QueryType,
        table: &str,
        schema: &[ColumnInfo],
        context: &[ConversationTurn],
    ) -> Result<SpecDraft, QueryError> {
        let prompt = Self::extraction_prompt(question, query_type, table, schema, context, None)?;
        let reply = self.runner.ask("spec extraction", &prompt, 0.0).await?;
        parse_llm_json(&reply)
    }

    /// Re-extracts after a failed execution, with the error as feedback.
    pub async fn repair(
        &self,
        question: &str,
        previous: &QuerySpec,
        error: &str,
        schema: &[ColumnInfo],
    ) -> Result<QuerySpec, QueryError> {
        let feedback = format!(
            "The previous attempt failed.\nPREVIOUS SPECIFICATION: {}\nERROR: {error}\n\
            Return a corrected specification that avoids this error.",
            serde_json::to_string(previous).unwrap_or_default()
        );
        let prompt = Self::extraction_prompt(
            question,
            previous.query_type,
            &previous.primary_table,
            schema,
            &[],
            Some(&feedback),
        )?;
        let reply = self.runner.ask("spec repair", &prompt, 0.0).await?;
        let draft: SpecDraft = parse_llm_json(&reply)?;

        let built = self
            .resolve(
                previous.query_type,
                FIRST_TRY_CERTAINTY,
                &previous.primary_table,
                schema,
                &draft,
            )
            .await;
        if built.nothing_mapped {
            return Err(QueryError::Spec("repaired specification maps no columns".to_string()));
        }
        Ok(QuerySpec {
            confidence: built.spec.confidence.min(previous.confidence),
            ..built.spec
        })
    }

    /// Resolves every term of `draft` through the column mapper and scores
    /// the result.
    async fn resolve(
        &self,
        query_type: QueryType,
        certainty: f64,
        table: &str,
        schema: &[ColumnInfo],
        draft: &SpecDraft,
    ) -> BuiltSpec {
        let mut res = Resolution::default();

        let mut entities = Vec::new();
        for term in &draft.entities {
            if let Some(column) = self.map(term, schema, &mut res).await {
                if !entities.contains(&column) {
                    entities.push(column);
                }
            }
        }

        let mut aggregations = Vec::new();
        for agg in &draft.aggregations {
            let Some(function) = AggFunc::parse(&agg.function) else {
                res.issues.push(QueryError::Spec(format!(
                    "unknown aggregation `{}`",
                    agg.function
                )));
                continue;
            };
            let term = agg.term.trim();
            if term.is_empty() || term == "*" {
                if function == AggFunc::Count {
                    aggregations.push(Aggregation::new(function, "*"));
                }
                continue;
            }
            if let Some(column) = self.map(term, schema, &mut res).await {
                let aggregation = Aggregation::new(function, &column);
                if !aggregations.contains(&aggregation) {
                    aggregations.push(aggregation);
                }
            }
        }

        let mut group_by = Vec::new();
        for term in &draft.group_by {
            if let Some(column) = self.map(term, schema, &mut res).await {
                if !group_by.contains(&column) {
                    group_by.push(column);
                }
            }
        }

        let mut order_by = Vec::new();
        for order in &draft.order_by {
            if let Some(column) = self.map(&order.term, schema, &mut res).await {
                order_by.push(OrderBy {
                    column,
                    direction: Direction::parse(&order.direction),
                });
            }
        }

        let mut filters = Vec::new();
        for filter in &draft.filters {
            if let Some(column) = self.map(&filter.term, schema, &mut res).await {
                filters.push(Filter {
                    column,
                    operator: Operator::parse(&filter.operator),
                    value: filter.value.clone(),
                });
            }
        }

        let mapped_fraction = if res.terms == 0 {
            if aggregations.is_empty() {
                0.0
            } else {
                1.0
            }
        } else {
            #[allow(clippy::cast_precision_loss)]
            let fraction = res.score / res.terms as f64;
            fraction
        };
        let has_shape = !aggregations.is_empty() || !group_by.is_empty();
        let shape_signal = if !query_type.expects_aggregation() || has_shape {
            1.0
        } else {
            0.0
        };
        let confidence =
            (0.5 * mapped_fraction + 0.3 * certainty + 0.2 * shape_signal).clamp(0.0, 1.0);

        let nothing_mapped = res.mapped == 0 && (res.terms > 0 || aggregations.is_empty());
        let spec = if nothing_mapped {
            QuerySpec {
                unmapped_terms: res.unmapped.clone(),
                ..QuerySpec::row_count(table, confidence.min(UNMAPPED_CONFIDENCE_CAP))
            }
        } else {
            QuerySpec {
                query_type,
                primary_table: table.to_string(),
                entities,
                aggregations,
                group_by,
                order_by,
                filters,
                limit: draft.limit,
                confidence,
                unmapped_terms: res.unmapped.clone(),
            }
        };

        let mut rationale = format!(
            "classified as {} (certainty {certainty:.1}); mapped {} of {} term(s)",
            query_type.as_str(),
            res.mapped,
            res.terms
        );
        if !res.unmapped.is_empty() {
            let _ = write!(rationale, "; unmapped: {}", res.unmapped.join(", "));
        }
        if nothing_mapped {
            rationale.push_str("; fell back to a whole-table row count");
        }

        BuiltSpec {
            spec,
            rationale,
            issues: res.issues,
            nothing_mapped,
        }
    }

    async fn map(
        &self,
        term: &str,
        schema: &[ColumnInfo],
        res: &mut Resolution,
    ) -> Option<String> {
        res.terms += 1;
        match self.mapper.map_term(term, schema).await {
            Some(found) => {
                res.mapped += 1;
                res.score += found.score;
                Some(found.column)
            }
            None => {
                if !res.unmapped.iter().any(|t| t == term) {
                    res.unmapped.push(term.to_string());
                    res.issues.push(QueryError::Mapping(term.to_string()));
                }
                None
            }
        }
    }

    fn classification_prompt(question: &str) -> String {
        format!(
            "Classify the analytics question into exactly one category.\n\n\
            CATEGORIES:\n\
            - summary: one overall figure or an overview of the data\n\
            - analytical: a breakdown, ranking or driver analysis\n\
            - comparison: groups or periods set against each other\n\
            - timeseries: change or trend over time\n\n\
            QUESTION: {question}\n\n\
            Reply with one word: summary, analytical, comparison or timeseries."
        )
    }

    fn extraction_prompt(
        question: &str,
        query_type: QueryType,
        table: &str,
        schema: &[ColumnInfo],
        context: &[ConversationTurn],
        feedback: Option<&str>,
    ) -> Result<String, QueryError> {
        let json_schema = serde_json::to_string_pretty(&schema_for!(SpecDraft))
            .map_err(|e| QueryError::Spec(format!("cannot describe draft schema: {e}")))?;
        let columns = schema
            .iter()
            .map(|c| format!("- {} ({})", c.name, c.data_type.as_str()))
            .collect::<Vec<_>>()
            .join("\n");

        let mut prompt = format!(
            "Extract a query specification from the question.\n\n\
            TABLE: {table}\n\
            COLUMNS:\n{columns}\n\n\
            QUESTION TYPE: {}\n\n",
            query_type.as_str()
        );
        if !context.is_empty() {
            prompt.push_str("PREVIOUS TURNS (most relevant first):\n");
            for turn in context {
                let _ = writeln!(prompt, "- Q: {}\n  A: {}", turn.question, turn.answer_summary);
            }
            prompt.push('\n');
        }
        if let Some(feedback) = feedback {
            let _ = writeln!(prompt, "{feedback}\n");
        }
        let _ = write!(
            prompt,
            "Rules:\n\
            - Use the user's wording or a listed column name for every term.\n\
            - Aggregation functions: sum, avg, count, min, max.\n\
            - Filter operators: =, !=, >, >=, <, <=, between, in.\n\
            - Leave lists empty when the question does not need them.\n\n\
            Respond ONLY with a JSON object matching this schema:\n{json_schema}\n\n\
            Question: {question}"
        );
        Ok(prompt)
    }
}
