//! Replay command - inspect the persisted replay buffer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;

use waypost_core::ReplayBuffer;
use waypost_types::KeyValueStore;

use crate::cli::{OutputFormat, ReplayAction};
use crate::config::Config;
use crate::util::{format_time, open_store, to_json_line, write_output};

/// Execute the replay command.
pub fn cmd_replay(action: ReplayAction, config: &Config, output: Option<&PathBuf>) -> Result<()> {
    let db_path = |db: Option<PathBuf>| db.unwrap_or_else(|| config.db_path());
    let content = match action {
        ReplayAction::List { db, output: args } => {
            let buffer = load_buffer(&db_path(db), config)?;
            match args.format {
                OutputFormat::Json => to_json_line(&buffer.iter().collect::<Vec<_>>())?,
                OutputFormat::Text => format_list_text(&buffer),
            }
        }
        ReplayAction::Stats { db, output: args } => {
            let buffer = load_buffer(&db_path(db), config)?;
            match args.format {
                OutputFormat::Json => to_json_line(&json!({
                    "pending": buffer.len(),
                    "capacity": buffer.capacity(),
                    "evicted": buffer.evicted_count(),
                }))?,
                OutputFormat::Text => format!(
                    "Replay buffer: {} of {} entries, {} evicted\n",
                    buffer.len(),
                    buffer.capacity(),
                    buffer.evicted_count()
                ),
            }
        }
        ReplayAction::Clear { db } => {
            let mut buffer = load_buffer(&db_path(db), config)?;
            let cleared = buffer.len();
            buffer.clear().context("Failed to clear replay buffer")?;
            format!("Cleared {} replay entries\n", cleared)
        }
    };
    write_output(output, &content)
}

fn load_buffer(path: &Path, config: &Config) -> Result<ReplayBuffer> {
    let store: Arc<dyn KeyValueStore> = Arc::new(open_store(path)?);
    ReplayBuffer::load(store, config.replay_capacity()).context("Failed to load replay buffer")
}

fn format_list_text(buffer: &ReplayBuffer) -> String {
    if buffer.is_empty() {
        return "Replay buffer is empty.\n".to_string();
    }

    let mut out = format!("{} buffered observations (oldest first):\n\n", buffer.len());
    for (i, entry) in buffer.iter().enumerate() {
        let request = &entry.request;
        out.push_str(&format!(
            "{:>4}  {}  {}  fix at {}",
            i,
            format_time(entry.enqueued_at),
            request.request_id,
            request.fix.coordinate
        ));
        if request.stopped {
            out.push_str("  stopped");
        }
        if let Some(trip) = &request.trip {
            out.push_str(&format!("  trip {}", trip.external_id));
        }
        out.push('\n');
        for event in &request.events {
            out.push_str(&format!("        {}\n", event));
        }
    }
    out
}
