use std::{sync::Arc, time::Duration};

use serde::{de::DeserializeOwned, Serialize};

use crate::{error::QueryError, llm::TextCompletion};

/// Text-completion handle shared by the tasks, with a per-call time bound.
#[derive(Clone)]
pub struct PromptRunner {
    llm: Arc<dyn TextCompletion>,
    max_tokens: u32,
    timeout: Duration,
}

impl PromptRunner {
    pub fn new(llm: Arc<dyn TextCompletion>, max_tokens: u32, timeout: Duration) -> Self {
        Self {
            llm,
            max_tokens,
            timeout,
        }
    }

    pub async fn ask(
        &self,
        operation: &str,
        prompt: &str,
        temperature: f32,
    ) -> Result<String, QueryError> {
        match tokio::time::timeout(
            self.timeout,
            self.llm.complete(prompt, temperature, self.max_tokens),
        )
        .await
        {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(QueryError::Completion(format!("{operation}: {e}"))),
            Err(_) => Err(QueryError::timeout(operation, self.timeout)),
        }
    }
}

/// Parses a JSON value out of an LLM reply.
///
/// Code fences and prose around the outermost object or array are
/// tolerated; anything that does not deserialise into `T` is an error.
pub fn parse_llm_json<T: DeserializeOwned>(reply: &str) -> Result<T, QueryError> {
    let start = reply.find(['{', '[']);
    let end = reply.rfind(['}', ']']);
    let body = match (start, end) {
        (Some(start), Some(end)) if start <= end => &reply[start..=end],
        _ => {
            return Err(QueryError::Completion(format!(
                "reply contained no JSON: {}",
                truncate(reply, 120)
            )))
        }
    };
    serde_json::from_str(body)
        .map_err(|e| QueryError::Completion(format!("malformed JSON reply: {e}")))
}

/// Cuts `text` to at most `max_chars` characters.
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

pub fn pretty_log<T: Serialize>(message: &str, data: &T) {
    match serde_json::to_string_pretty(data) {
        Ok(pretty) => tracing::debug!("{message} {pretty}"),
        Err(e) => tracing::debug!("{message} <unserialisable: {e}>"),
    }
}
