//! Deterministic collaborators for unit tests.

use std::{
    path::PathBuf,
    sync::Mutex,
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rusqlite::Connection;

use crate::{
    llm::TextCompletion,
    memory::SledConversationLog,
    query_graph::Policy,
    settings::{ControllerSettings, DatabaseSettings, LlmSettings, MemorySettings, Settings},
    table_store::{ColumnInfo, Row, SqliteTableStore, TableStore},
};

enum Reply {
    Text(String),
    Fail,
    Hang,
}

/// Answers each prompt with the first rule whose needles all occur in it.
pub struct ScriptedLlm {
    rules: Vec<(Vec<String>, Reply)>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn on(self, needles: &[&str], reply: &str) -> Self {
        self.rule(needles, Reply::Text(reply.to_string()))
    }

    pub fn fail_on(self, needles: &[&str]) -> Self {
        self.rule(needles, Reply::Fail)
    }

    pub fn hang_on(self, needles: &[&str]) -> Self {
        self.rule(needles, Reply::Hang)
    }

    fn rule(mut self, needles: &[&str], reply: Reply) -> Self {
        self.rules
            .push((needles.iter().map(ToString::to_string).collect(), reply));
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn prompts_containing(&self, needle: &str) -> usize {
        self.prompts().iter().filter(|p| p.contains(needle)).count()
    }
}

#[async_trait]
impl TextCompletion for ScriptedLlm {
    async fn complete(&self, prompt: &str, _temperature: f32, _max_tokens: u32) -> Result<String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let reply = self
            .rules
            .iter()
            .find(|(needles, _)| needles.iter().all(|n| prompt.contains(n.as_str())))
            .map(|(_, reply)| reply);
        match reply {
            Some(Reply::Text(text)) => Ok(text.clone()),
            Some(Reply::Fail) => bail!("scripted failure"),
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                bail!("woke up")
            }
            None => Err(anyhow!("no scripted reply")),
        }
    }
}

/// Delegates to SQLite except for `execute`, which misbehaves on demand.
pub struct FaultyStore {
    inner: SqliteTableStore,
    hang: bool,
}

impl FaultyStore {
    pub fn hanging() -> Self {
        Self {
            inner: seeded_store(),
            hang: true,
        }
    }

    pub fn failing() -> Self {
        Self {
            inner: seeded_store(),
            hang: false,
        }
    }
}

#[async_trait]
impl TableStore for FaultyStore {
    async fn execute(&self, _sql: &str) -> Result<Vec<Row>> {
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        bail!("no such column: Amount")
    }

    async fn schema(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        self.inner.schema(table).await
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.inner.list_tables().await
    }
}

/// `sales` holds 1250 in total: 350 for 2024-01 and 900 for 2024-02.
pub fn seeded_store() -> SqliteTableStore {
    let conn = Connection::open_in_memory().expect("in-memory database");
    conn.execute_batch(
        "CREATE TABLE sales (Region TEXT, Amount INTEGER, Month TEXT);
         INSERT INTO sales VALUES ('east', 100, '2024-01');
         INSERT INTO sales VALUES ('west', 250, '2024-01');
         INSERT INTO sales VALUES ('east', 900, '2024-02');",
    )
    .expect("seed sales");
    SqliteTableStore::from_connection(conn)
}

pub fn memory() -> SledConversationLog {
    let db = sled::Config::new()
        .temporary(true)
        .open()
        .expect("temporary sled");
    SledConversationLog::from_db(db).expect("conversation log")
}

pub fn settings() -> Settings {
    Settings {
        llm: LlmSettings {
            url: "http://127.0.0.1:0".to_string(),
            model: "scripted".to_string(),
            temperature: 0.1,
            max_tokens: 256,
            timeout_secs: 5,
        },
        database: DatabaseSettings {
            path: PathBuf::from(":memory:"),
            timeout_secs: 1,
        },
        memory: MemorySettings {
            path: PathBuf::from("unused"),
            context_turns: 2,
        },
        controller: ControllerSettings {
            policy: Policy::Adaptive,
            query_timeout_secs: 20,
            ..ControllerSettings::default()
        },
    }
}
