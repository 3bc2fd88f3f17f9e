use serde::{Deserialize, Serialize};

use crate::{query_graph::graph::Stage, table_store::Row};

/// What a caller gets back for every question, including total failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub narrative: String,
    pub data_preview: Vec<Row>,
    pub confidence: f64,
    /// `None` when the answer was produced without structured data.
    pub sql: Option<String>,
    pub suggested_followups: Vec<String>,
    pub trace: Vec<Stage>,
    /// Served from the session's result cache instead of a fresh run.
    #[serde(default)]
    pub cached: bool,
}
