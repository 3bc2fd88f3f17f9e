use tracing::error;

use super::{
    graph::{transition, Event, Stage},
    types::{
        execution::{ExecutionResult, ValidationVerdict},
        query::QuerySpec,
    },
};
use crate::{error::QueryError, table_store::ColumnInfo};

/// Result of one decomposed sub-question.
#[derive(Debug, Clone)]
pub struct PartOutcome {
    pub question: String,
    pub spec: Option<QuerySpec>,
    pub accepted: Option<ExecutionResult>,
    pub confidence: f64,
    pub trace: Vec<Stage>,
}

/// Working memory of one query.
///
/// Every update consumes the state and returns the next one, so a caller
/// holding a clone keeps an intact snapshot.
#[derive(Debug, Clone)]
pub struct SessionState {
    stage: Stage,
    trace: Vec<Stage>,
    table: Option<String>,
    schema: Vec<ColumnInfo>,
    specs: Vec<QuerySpec>,
    rationale: String,
    attempt: u32,
    empty_refines: u32,
    last_result: Option<ExecutionResult>,
    accepted: Option<ExecutionResult>,
    verdicts: Vec<ValidationVerdict>,
    parts: Vec<PartOutcome>,
    issues: Vec<QueryError>,
    narrative: Option<String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::starting_at(Stage::MapIntent)
    }

    pub fn starting_at(stage: Stage) -> Self {
        Self {
            stage,
            trace: vec![stage],
            table: None,
            schema: Vec::new(),
            specs: Vec::new(),
            rationale: String::new(),
            attempt: 0,
            empty_refines: 0,
            last_result: None,
            accepted: None,
            verdicts: Vec::new(),
            parts: Vec::new(),
            issues: Vec::new(),
            narrative: None,
        }
    }

    /// Applies `event`; an illegal edge is logged and routed to fallback,
    /// or to done once narration has started.
    pub fn advance(mut self, event: &Event) -> Self {
        let next = transition(self.stage, event).unwrap_or_else(|| {
            error!(stage = ?self.stage, ?event, "Illegal transition");
            if matches!(self.stage, Stage::Fallback | Stage::Narrate | Stage::Done) {
                Stage::Done
            } else {
                Stage::Fallback
            }
        });
        self.stage = next;
        self.trace.push(next);
        self
    }

    pub fn with_table(mut self, table: String, schema: Vec<ColumnInfo>) -> Self {
        self.table = Some(table);
        self.schema = schema;
        self
    }

    pub fn with_spec(mut self, spec: QuerySpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn with_rationale(mut self, rationale: String) -> Self {
        self.rationale = rationale;
        self
    }

    /// Records one execution; the attempt counter counts executions.
    pub fn with_result(mut self, result: ExecutionResult) -> Self {
        self.attempt += 1;
        self.last_result = Some(result);
        self
    }

    pub fn with_verdict(mut self, verdict: ValidationVerdict) -> Self {
        if verdict.accepted() {
            self.accepted = self.last_result.clone();
        }
        self.verdicts.push(verdict);
        self
    }

    pub fn with_empty_refine(mut self) -> Self {
        self.empty_refines += 1;
        self
    }

    pub fn with_parts(mut self, parts: Vec<PartOutcome>) -> Self {
        self.parts = parts;
        self
    }

    pub fn with_issue(mut self, issue: QueryError) -> Self {
        self.issues.push(issue);
        self
    }

    pub fn with_issues(mut self, issues: impl IntoIterator<Item = QueryError>) -> Self {
        self.issues.extend(issues);
        self
    }

    pub fn with_narrative(mut self, narrative: String) -> Self {
        self.narrative = Some(narrative);
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn trace(&self) -> &[Stage] {
        &self.trace
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn schema(&self) -> &[ColumnInfo] {
        &self.schema
    }

    pub fn spec(&self) -> Option<&QuerySpec> {
        self.specs.last()
    }

    pub fn spec_history(&self) -> &[QuerySpec] {
        &self.specs
    }

    pub fn rationale(&self) -> &str {
        &self.rationale
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn empty_refines(&self) -> u32 {
        self.empty_refines
    }

    pub fn last_result(&self) -> Option<&ExecutionResult> {
        self.last_result.as_ref()
    }

    pub fn accepted(&self) -> Option<&ExecutionResult> {
        self.accepted.as_ref()
    }

    pub fn verdicts(&self) -> &[ValidationVerdict] {
        &self.verdicts
    }

    pub fn last_verdict(&self) -> Option<&ValidationVerdict> {
        self.verdicts.last()
    }

    pub fn parts(&self) -> &[PartOutcome] {
        &self.parts
    }

    pub fn issues(&self) -> &[QueryError] {
        &self.issues
    }

    pub fn narrative(&self) -> Option<&str> {
        self.narrative.as_deref()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
