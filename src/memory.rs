pub mod sled_log;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::sled_log::SledConversationLog;

/// One question/answer exchange kept for later context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub question: String,
    pub answer_summary: String,
    pub timestamp: DateTime<Utc>,
    /// Owned by the memory store; callers leave it empty.
    pub embedding: Option<Vec<f32>>,
}

impl ConversationTurn {
    pub fn new(question: &str, answer_summary: &str) -> Self {
        Self {
            question: question.to_string(),
            answer_summary: answer_summary.to_string(),
            timestamp: Utc::now(),
            embedding: None,
        }
    }
}

/// Append-only, per-session conversation log with similarity lookup.
#[async_trait]
pub trait ConversationMemory: Send + Sync {
    async fn top_k_similar(
        &self,
        session: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<ConversationTurn>>;

    async fn append(&self, session: &str, turn: ConversationTurn) -> Result<()>;
}
