use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::debug;

use super::types::response::Response;

struct CachedResponse {
    response: Response,
    stored_at: Instant,
}

/// Answers recently given in a session, kept for a fixed time to live.
///
/// A zero TTL disables the cache.
pub struct ResultCache {
    ttl: Duration,
    sessions: Mutex<HashMap<String, HashMap<String, CachedResponse>>>,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Cache key for a question asked against a table, or against whichever
    /// table fits best when no table was named.
    pub fn key(question: &str, table_hint: Option<&str>) -> String {
        format!(
            "{}|table:{}",
            question.trim().to_lowercase(),
            table_hint.unwrap_or("*")
        )
    }

    pub fn get(&self, session_id: &str, key: &str) -> Option<Response> {
        if self.ttl.is_zero() {
            return None;
        }
        let mut sessions = self.sessions.lock().ok()?;
        let entries = sessions.get_mut(session_id)?;
        let fresh = entries
            .get(key)
            .is_some_and(|cached| cached.stored_at.elapsed() < self.ttl);
        if !fresh {
            if entries.remove(key).is_some() {
                debug!(%key, "Cached answer expired");
            }
            return None;
        }
        entries.get(key).map(|cached| cached.response.clone())
    }

    pub fn put(&self, session_id: &str, key: String, response: &Response) {
        if self.ttl.is_zero() {
            return;
        }
        let Ok(mut sessions) = self.sessions.lock() else {
            return;
        };
        let entries = sessions.entry(session_id.to_string()).or_default();
        entries.retain(|_, cached| cached.stored_at.elapsed() < self.ttl);
        entries.insert(
            key,
            CachedResponse {
                response: response.clone(),
                stored_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(narrative: &str) -> Response {
        Response {
            narrative: narrative.to_string(),
            data_preview: Vec::new(),
            confidence: 0.9,
            sql: Some("SELECT 1".to_string()),
            suggested_followups: Vec::new(),
            trace: Vec::new(),
            cached: false,
        }
    }

    #[test]
    fn key_ignores_case_and_padding() {
        assert_eq!(
            ResultCache::key("  Total Revenue ", Some("sales")),
            "total revenue|table:sales"
        );
        assert_ne!(
            ResultCache::key("total revenue", Some("sales")),
            ResultCache::key("total revenue", None)
        );
    }

    #[test]
    fn entries_are_per_session() {
        let cache = ResultCache::new(Duration::from_secs(300));
        let key = ResultCache::key("total revenue", None);
        cache.put("alice", key.clone(), &response("1,250"));
        assert_eq!(
            cache.get("alice", &key).map(|r| r.narrative),
            Some("1,250".to_string())
        );
        assert!(cache.get("bob", &key).is_none());
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache = ResultCache::new(Duration::from_millis(1));
        let key = ResultCache::key("total revenue", None);
        cache.put("alice", key.clone(), &response("1,250"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("alice", &key).is_none());

        let disabled = ResultCache::new(Duration::ZERO);
        disabled.put("alice", key.clone(), &response("1,250"));
        assert!(disabled.get("alice", &key).is_none());
    }
}
