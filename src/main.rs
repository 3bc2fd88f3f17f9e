mod error;
mod llm;
mod memory;
mod query_graph;
mod settings;
mod table_store;
#[cfg(test)]
mod testing;

use std::{
    io::{self, BufRead, Write},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{
    llm::OllamaClient,
    memory::SledConversationLog,
    query_graph::{types::response::Response, Controller},
    settings::{Args, Settings},
    table_store::SqliteTableStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let mut settings = Settings::from_file(args.config.as_deref())
        .context("problem while loading settings")?;
    if let Some(policy) = args.policy {
        settings.controller.policy = policy;
    }

    let store = SqliteTableStore::open_read_only(&settings.database.path).with_context(|| {
        format!(
            "cannot open database {}",
            settings.database.path.display()
        )
    })?;
    let llm = OllamaClient::new(&settings.llm)?;
    let memory = SledConversationLog::open(&settings.memory.path).with_context(|| {
        format!(
            "cannot open conversation log {}",
            settings.memory.path.display()
        )
    })?;
    let controller = Controller::new(
        Arc::new(store),
        Arc::new(llm),
        Arc::new(memory),
        &settings,
    );

    let session = args
        .session
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let policy = settings.controller.policy;
    info!(%session, ?policy, model = %settings.llm.model, "Retail insights ready");

    if args.summarize {
        let summary = controller.summarize(args.table.as_deref()).await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    if let Some(question) = args.question {
        let response = controller
            .process_query(&session, &question, args.table.as_deref(), policy)
            .await;
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let question = line?;
        let question = question.trim();
        if question.is_empty() {
            continue;
        }
        if matches!(question, "exit" | "quit") {
            break;
        }
        let response = controller
            .process_query(&session, question, args.table.as_deref(), policy)
            .await;
        print_response(&response);
    }
    Ok(())
}

fn print_response(response: &Response) {
    println!("\n{}\n", response.narrative);
    if let Some(sql) = &response.sql {
        println!("SQL: {sql}");
    }
    for row in &response.data_preview {
        println!("  {}", serde_json::Value::Object(row.clone()));
    }
    if response.cached {
        println!("Confidence: {:.2} (cached)", response.confidence);
    } else {
        println!("Confidence: {:.2}", response.confidence);
    }
    if !response.suggested_followups.is_empty() {
        println!("You could also ask:");
        for followup in &response.suggested_followups {
            println!("  - {followup}");
        }
    }
    println!();
}
