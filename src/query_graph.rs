pub mod cache;
pub mod graph;
pub mod session;
pub mod tasks;
pub mod types;
pub mod utils;

use std::{future::Future, sync::Arc, time::Duration};

use futures::future::join_all;
use tracing::{debug, error, info, instrument, warn};

pub use self::graph::Policy;
use self::{
    cache::ResultCache,
    graph::{Event, Stage},
    session::{PartOutcome, SessionState},
    tasks::{
        decomposition::{should_decompose, Decomposer},
        executor::Executor,
        followups,
        narrative::{fallback_template, NarrativeGenerator, NarrativePart},
        refinement::Refiner,
        spec_builder::SpecBuilder,
        summarizer::Summarizer,
        table_resolution::resolve_table,
        validator::Validator,
    },
    types::{execution::ExecutionResult, response::Response, summary::DatasetSummary},
    utils::{truncate, PromptRunner},
};
use crate::{
    error::QueryError,
    llm::TextCompletion,
    memory::{ConversationMemory, ConversationTurn},
    settings::{ControllerSettings, Settings},
    table_store::{ColumnInfo, TableStore},
};

const SUMMARY_CHARS: usize = 200;

/// Resolves questions into executed, validated and narrated answers.
///
/// One instance may serve many sessions; nothing is shared between queries
/// except the conversation log and each session's result cache.
pub struct Controller {
    store: Arc<dyn TableStore>,
    memory: Arc<dyn ConversationMemory>,
    builder: Arc<SpecBuilder>,
    refiner: Refiner,
    decomposer: Decomposer,
    executor: Executor,
    narrator: NarrativeGenerator,
    summarizer: Summarizer,
    cache: ResultCache,
    settings: ControllerSettings,
    context_turns: usize,
    call_timeout: Duration,
}

impl Controller {
    pub fn new(
        store: Arc<dyn TableStore>,
        llm: Arc<dyn TextCompletion>,
        memory: Arc<dyn ConversationMemory>,
        settings: &Settings,
    ) -> Self {
        let runner = PromptRunner::new(llm, settings.llm.max_tokens, settings.llm.timeout());
        let builder = Arc::new(SpecBuilder::new(runner.clone()));
        Self {
            executor: Executor::new(
                store.clone(),
                settings.database.timeout(),
                settings.controller.row_limit,
            ),
            store,
            memory,
            refiner: Refiner::new(builder.clone()),
            builder,
            decomposer: Decomposer::new(runner.clone(), settings.controller.max_sub_queries),
            narrator: NarrativeGenerator::new(
                runner.clone(),
                settings.llm.temperature,
                settings.controller.preview_rows,
            ),
            summarizer: Summarizer::new(
                runner,
                settings.llm.temperature,
                settings.controller.preview_rows,
            ),
            cache: ResultCache::new(settings.controller.cache_ttl()),
            settings: settings.controller.clone(),
            context_turns: settings.memory.context_turns,
            call_timeout: settings.database.timeout(),
        }
    }

    /// Answers `question`. Never fails: every error ends in a fallback
    /// response, and the whole run is bounded by the query timeout.
    ///
    /// A question the session already had answered from data within the
    /// cache TTL gets the earlier response back without a new run.
    #[instrument(skip(self))]
    pub async fn process_query(
        &self,
        session_id: &str,
        question: &str,
        table_hint: Option<&str>,
        policy: Policy,
    ) -> Response {
        let key = ResultCache::key(question, table_hint);
        if let Some(mut response) = self.cache.get(session_id, &key) {
            info!(%key, "Answered from cache");
            response.cached = true;
            self.remember(session_id, question, &response).await;
            return response;
        }

        let envelope = self.settings.query_timeout();
        let response = match tokio::time::timeout(
            envelope,
            self.run(session_id, question, table_hint, policy),
        )
        .await
        {
            Ok(response) => response,
            Err(_) => {
                let e = QueryError::timeout("query", envelope);
                error!(error = %e, "Query abandoned");
                Response {
                    narrative: fallback_template(question, &[], &e.to_string()),
                    data_preview: Vec::new(),
                    confidence: 0.0,
                    sql: None,
                    suggested_followups: followups::suggest(None),
                    trace: vec![Stage::Fallback, Stage::Narrate, Stage::Done],
                    cached: false,
                }
            }
        };

        if response.sql.is_some() {
            self.cache.put(session_id, key, &response);
        }
        self.remember(session_id, question, &response).await;

        info!(
            confidence = response.confidence,
            fallback = response.sql.is_none(),
            "Query answered"
        );
        response
    }

    /// Overview of `table_hint`, or of the first table when none is given:
    /// row and column counts, metrics over up to five numeric columns, a
    /// sample and a written summary. Bounded by the query timeout.
    #[instrument(skip(self))]
    pub async fn summarize(&self, table_hint: Option<&str>) -> Result<DatasetSummary, QueryError> {
        let envelope = self.settings.query_timeout();
        match tokio::time::timeout(envelope, self.summarize_table(table_hint)).await {
            Ok(summary) => summary,
            Err(_) => Err(QueryError::timeout("dataset summary", envelope)),
        }
    }

    async fn summarize_table(&self, table_hint: Option<&str>) -> Result<DatasetSummary, QueryError> {
        let tables = self.bounded("list tables", self.store.list_tables()).await?;
        let table = resolve_table(&tables, table_hint, "")
            .ok_or_else(|| QueryError::Spec("no tables available".to_string()))?;
        let schema = self.bounded("table schema", self.store.schema(&table)).await?;
        self.summarizer
            .summarize(&self.executor, &table, &schema)
            .await
    }

    async fn remember(&self, session_id: &str, question: &str, response: &Response) {
        let turn = ConversationTurn::new(question, &truncate(&response.narrative, SUMMARY_CHARS));
        if let Err(e) = self
            .bounded("memory append", self.memory.append(session_id, turn))
            .await
        {
            warn!(error = %e, "Failed to record conversation turn");
        }
    }

    async fn run(
        &self,
        session_id: &str,
        question: &str,
        table_hint: Option<&str>,
        policy: Policy,
    ) -> Response {
        let max_retries = policy.max_retries(self.settings.max_retries);
        let validator = Validator::new(max_retries, self.settings.min_rows);
        let mut context = Vec::new();
        let mut state = SessionState::new();

        loop {
            debug!(stage = ?state.stage(), attempt = state.attempt(), "Entering stage");
            state = match state.stage() {
                Stage::MapIntent => {
                    let (next, turns) = self
                        .map_intent(state, session_id, question, table_hint)
                        .await;
                    context = turns;
                    next
                }
                Stage::BuildSpec => self.build_spec(state, question, &context, policy).await,
                Stage::Decompose => {
                    self.decompose(state, question, &context, validator, max_retries)
                        .await
                }
                Stage::Execute => self.execute(state).await,
                Stage::Validate => self.validate(state, validator, max_retries),
                Stage::Refine => self.refine(state, question).await,
                Stage::Accept | Stage::Fallback => state.advance(&Event::Proceed),
                Stage::Narrate => self.narrate(state, question).await,
                Stage::Done => break,
            };
        }

        for issue in state.issues() {
            debug!(%issue, "Recorded issue");
        }
        debug!(
            rationale = state.rationale(),
            attempts = state.attempt(),
            specs = state.spec_history().len(),
            verdicts = state.verdicts().len(),
            "Session finished"
        );
        self.respond(&state)
    }

    async fn map_intent(
        &self,
        state: SessionState,
        session_id: &str,
        question: &str,
        table_hint: Option<&str>,
    ) -> (SessionState, Vec<ConversationTurn>) {
        let context = match self
            .bounded(
                "context lookup",
                self.memory
                    .top_k_similar(session_id, question, self.context_turns),
            )
            .await
        {
            Ok(turns) => turns,
            Err(e) => {
                warn!(error = %e, "Continuing without conversation context");
                Vec::new()
            }
        };

        let tables = match self.bounded("list tables", self.store.list_tables()).await {
            Ok(tables) => tables,
            Err(e) => return (state.with_issue(e).advance(&Event::NoTable), context),
        };
        let Some(table) = resolve_table(&tables, table_hint, question) else {
            warn!("No table to query");
            let issue = QueryError::Spec("no tables available".to_string());
            return (state.with_issue(issue).advance(&Event::NoTable), context);
        };

        match self.bounded("table schema", self.store.schema(&table)).await {
            Ok(schema) => {
                info!(%table, columns = schema.len(), "Resolved table");
                let state = state
                    .with_table(table, schema)
                    .advance(&Event::TableResolved);
                (state, context)
            }
            Err(e) => (state.with_issue(e).advance(&Event::NoTable), context),
        }
    }

    async fn build_spec(
        &self,
        state: SessionState,
        question: &str,
        context: &[ConversationTurn],
        policy: Policy,
    ) -> SessionState {
        let Some(table) = state.table().map(str::to_string) else {
            return state.advance(&Event::NoTable);
        };
        let built = self
            .builder
            .build(question, &table, state.schema(), context)
            .await;
        let decompose = should_decompose(policy, built.spec.query_type, question);
        state
            .with_issues(built.issues)
            .with_rationale(built.rationale)
            .with_spec(built.spec)
            .advance(&Event::SpecBuilt { decompose })
    }

    async fn decompose(
        &self,
        state: SessionState,
        question: &str,
        context: &[ConversationTurn],
        validator: Validator,
        max_retries: u32,
    ) -> SessionState {
        let Some(table) = state.table().map(str::to_string) else {
            return state.advance(&Event::NoTable);
        };
        let sub_questions = self.decomposer.decompose(question, &table).await;
        if sub_questions.len() < 2 {
            return state.advance(&Event::NotDecomposable);
        }

        let schema = state.schema().to_vec();
        let parts = join_all(sub_questions.iter().map(|sub| {
            self.run_part(sub, &table, &schema, context, validator, max_retries)
        }))
        .await;

        for part in &parts {
            debug!(
                question = %part.question,
                query_type = ?part.spec.as_ref().map(|spec| spec.query_type),
                trace = ?part.trace,
                accepted = part.accepted.is_some(),
                "Sub-question outcome"
            );
        }
        let any_accepted = parts.iter().any(|p| p.accepted.is_some());
        info!(
            parts = parts.len(),
            accepted = parts.iter().filter(|p| p.accepted.is_some()).count(),
            "Sub-questions finished"
        );
        state
            .with_parts(parts)
            .advance(&Event::Decomposed { any_accepted })
    }

    /// Drives one sub-question from spec building to accept or fallback.
    async fn run_part(
        &self,
        question: &str,
        table: &str,
        schema: &[ColumnInfo],
        context: &[ConversationTurn],
        validator: Validator,
        max_retries: u32,
    ) -> PartOutcome {
        let mut state = SessionState::starting_at(Stage::BuildSpec)
            .with_table(table.to_string(), schema.to_vec());
        loop {
            state = match state.stage() {
                // sub-questions are never split again
                Stage::BuildSpec => {
                    self.build_spec(state, question, context, Policy::Linear)
                        .await
                }
                Stage::Execute => self.execute(state).await,
                Stage::Validate => self.validate(state, validator, max_retries),
                Stage::Refine => self.refine(state, question).await,
                _ => break,
            };
        }

        let accepted = state.accepted().cloned();
        PartOutcome {
            question: question.to_string(),
            spec: state.spec().cloned(),
            confidence: match (&accepted, state.last_verdict()) {
                (Some(_), Some(verdict)) => verdict.confidence(),
                _ => 0.0,
            },
            accepted,
            trace: state.trace().to_vec(),
        }
    }

    #[instrument(skip_all, fields(attempt = state.attempt() + 1))]
    async fn execute(&self, state: SessionState) -> SessionState {
        let result = match state.spec() {
            Some(spec) => self.executor.run_spec(spec).await,
            None => return state.advance(&Event::NoTable),
        };
        state.with_result(result).advance(&Event::Executed)
    }

    fn validate(&self, state: SessionState, validator: Validator, max_retries: u32) -> SessionState {
        let (Some(result), Some(spec)) = (state.last_result(), state.spec()) else {
            return state.advance(&Event::NoTable);
        };
        let attempt = state.attempt();
        let verdict = validator.validate(result, spec, attempt, state.empty_refines());
        let emptied = verdict.needs_refine() && result.error().is_none();
        let issue = result.error().cloned();

        info!(
            attempt,
            rows = result.row_count(),
            elapsed = ?result.elapsed(),
            reason = verdict.reason(),
            confidence = verdict.confidence(),
            "Validated"
        );
        let state = if emptied { state.with_empty_refine() } else { state };
        let event = Event::Validated {
            verdict: verdict.clone(),
            attempt,
            max_retries,
        };
        state.with_issues(issue).with_verdict(verdict).advance(&event)
    }

    async fn refine(&self, state: SessionState, question: &str) -> SessionState {
        let next = match (state.spec(), state.last_result()) {
            (Some(spec), Some(result)) => {
                self.refiner
                    .refine(question, spec, result, state.schema())
                    .await
            }
            _ => return state.advance(&Event::NoTable),
        };
        state.with_spec(next).advance(&Event::Refined)
    }

    async fn narrate(&self, state: SessionState, question: &str) -> SessionState {
        let narrative = if state.parts().iter().any(|p| p.accepted.is_some()) {
            let parts: Vec<NarrativePart<'_>> = state
                .parts()
                .iter()
                .map(|part| NarrativePart {
                    label: Some(part.question.as_str()),
                    rows: part
                        .accepted
                        .as_ref()
                        .map(ExecutionResult::rows)
                        .unwrap_or_default(),
                })
                .collect();
            self.narrator.narrate(question, &parts).await
        } else if let Some(result) = state.accepted() {
            let part = NarrativePart {
                label: None,
                rows: result.rows(),
            };
            self.narrator.narrate(question, &[part]).await
        } else {
            let columns: Vec<String> = state.schema().iter().map(|c| c.name.clone()).collect();
            let reason = match (state.last_verdict(), state.issues().last()) {
                (Some(verdict), _) => verdict.reason().to_string(),
                (None, Some(issue)) => issue.to_string(),
                (None, None) => "no usable data".to_string(),
            };
            self.narrator
                .narrate_fallback(question, &columns, &reason)
                .await
        };
        state.with_narrative(narrative).advance(&Event::Narrated)
    }

    fn respond(&self, state: &SessionState) -> Response {
        let preview_rows = self.settings.preview_rows;
        let narrative = state.narrative().unwrap_or_default().to_string();
        let query_type = state.spec().map(|spec| spec.query_type);
        let accepted_parts: Vec<&PartOutcome> = state
            .parts()
            .iter()
            .filter(|p| p.accepted.is_some())
            .collect();

        if !accepted_parts.is_empty() {
            let results: Vec<&ExecutionResult> = accepted_parts
                .iter()
                .filter_map(|p| p.accepted.as_ref())
                .collect();
            #[allow(clippy::cast_precision_loss)]
            let confidence = accepted_parts.iter().map(|p| p.confidence).sum::<f64>()
                / state.parts().len() as f64;
            return Response {
                narrative,
                data_preview: results
                    .iter()
                    .flat_map(|r| r.rows().iter().cloned())
                    .take(preview_rows)
                    .collect(),
                confidence: confidence.clamp(0.0, 1.0),
                sql: Some(
                    results
                        .iter()
                        .map(|r| r.sql_text())
                        .collect::<Vec<_>>()
                        .join(";\n"),
                ),
                suggested_followups: followups::suggest(query_type),
                trace: state.trace().to_vec(),
                cached: false,
            };
        }

        if let Some(result) = state.accepted() {
            return Response {
                narrative,
                data_preview: result.rows().iter().take(preview_rows).cloned().collect(),
                confidence: state.last_verdict().map_or(0.0, |v| v.confidence()),
                sql: Some(result.sql_text().to_string()),
                suggested_followups: followups::suggest(query_type),
                trace: state.trace().to_vec(),
                cached: false,
            };
        }

        Response {
            narrative,
            data_preview: Vec::new(),
            confidence: state.spec().map_or(0.0, |spec| spec.confidence.min(0.2)),
            sql: None,
            suggested_followups: followups::suggest(None),
            trace: state.trace().to_vec(),
            cached: false,
        }
    }

    /// Bounds a collaborator call that is not an execution or completion.
    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, QueryError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                let e = QueryError::Execution(format!("{operation}: {e}"));
                warn!(error = %e, "Collaborator call failed");
                Err(e)
            }
            Err(_) => {
                let e = QueryError::timeout(operation, self.call_timeout);
                warn!(error = %e, "Collaborator call timed out");
                Err(e)
            }
        }
    }
}
