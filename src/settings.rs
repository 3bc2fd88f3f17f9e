// src/settings.rs

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Parser;
use config::{builder::DefaultState, ConfigBuilder, ConfigError, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::query_graph::Policy;

const DEFAULT_LLM_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_LLM_MODEL: &str = "llama3.1:8b";
const DEFAULT_DB_PATH: &str = "retail.db";
const MEMORY_DIR_NAME: &str = "conversations";

#[derive(Parser, Debug)]
#[command(version)]
pub struct Args {
    /// Path to the local configuration TOML file.
    #[arg(short, value_name = "CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Question to answer. Starts an interactive prompt when omitted.
    #[arg(long)]
    pub question: Option<String>,

    /// Table to query instead of guessing from the question.
    #[arg(long, value_name = "TABLE")]
    pub table: Option<String>,

    /// Resolution policy; overrides `controller.policy`.
    #[arg(long, value_enum)]
    pub policy: Option<Policy>,

    /// Conversation session id. A fresh one is generated when omitted.
    #[arg(long)]
    pub session: Option<String>,

    /// Print an overview of `--table` (or the first table) and exit.
    #[arg(long, conflicts_with = "question")]
    pub summarize: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub path: PathBuf,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    pub path: PathBuf,
    /// Number of prior turns handed to the spec builder.
    pub context_turns: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    pub policy: Policy,
    pub max_retries: u32,
    pub row_limit: u32,
    pub preview_rows: usize,
    pub min_rows: usize,
    pub max_sub_queries: usize,
    pub query_timeout_secs: u64,
    /// How long an answer is reused for the same question in a session.
    /// Zero disables the cache.
    pub cache_ttl_secs: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            policy: Policy::Adaptive,
            max_retries: 2,
            row_limit: 1000,
            preview_rows: 10,
            min_rows: 2,
            max_sub_queries: 4,
            query_timeout_secs: 120,
            cache_ttl_secs: 300,
        }
    }
}

impl ControllerSettings {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub llm: LlmSettings,
    pub database: DatabaseSettings,
    pub memory: MemorySettings,
    pub controller: ControllerSettings,
}

impl Settings {
    /// Load settings from the given TOML file, with sane defaults.
    pub fn from_file(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Self::defaults()?;
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder.build()?.try_deserialize()
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        let controller = ControllerSettings::default();
        ConfigBuilder::<DefaultState>::default()
            .set_default("llm.url", DEFAULT_LLM_URL)?
            .set_default("llm.model", DEFAULT_LLM_MODEL)?
            .set_default("llm.temperature", 0.1)?
            .set_default("llm.max_tokens", 1024)?
            .set_default("llm.timeout_secs", 30)?
            .set_default("database.path", DEFAULT_DB_PATH)?
            .set_default("database.timeout_secs", 30)?
            .set_default(
                "memory.path",
                default_memory_path().to_string_lossy().into_owned(),
            )?
            .set_default("memory.context_turns", 2)?
            .set_default("controller.policy", "adaptive")?
            .set_default("controller.max_retries", controller.max_retries)?
            .set_default("controller.row_limit", controller.row_limit)?
            .set_default(
                "controller.preview_rows",
                u64::try_from(controller.preview_rows).unwrap_or(10),
            )?
            .set_default(
                "controller.min_rows",
                u64::try_from(controller.min_rows).unwrap_or(2),
            )?
            .set_default(
                "controller.max_sub_queries",
                u64::try_from(controller.max_sub_queries).unwrap_or(4),
            )?
            .set_default("controller.query_timeout_secs", controller.query_timeout_secs)?
            .set_default("controller.cache_ttl_secs", controller.cache_ttl_secs)
    }
}

impl LlmSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl DatabaseSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_memory_path() -> PathBuf {
    ProjectDirs::from("com", "retail-insights", "retail-insights").map_or_else(
        || PathBuf::from(MEMORY_DIR_NAME),
        |dirs| dirs.data_dir().join(MEMORY_DIR_NAME),
    )
}
