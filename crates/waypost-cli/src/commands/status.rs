//! Status command - show what a restart would rehydrate.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

use waypost_core::{CACHE_KEY, NearbyCache, ReplayBuffer, SESSION_KEY, SessionState};
use waypost_store::{SqliteStore, StoredEntry};
use waypost_types::KeyValueStore;

use crate::cli::OutputFormat;
use crate::config::Config;
use crate::util::{format_time, open_store, to_json_line, write_output};

/// Persisted engine state.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub database: PathBuf,
    pub state: SessionState,
    pub geofences: usize,
    pub beacons: usize,
    pub places: usize,
    pub synced_region: Option<waypost_types::SyncedRegion>,
    pub replay_pending: usize,
    pub replay_evicted: u64,
    #[serde(skip)]
    pub entries: Vec<StoredEntry>,
}

/// Execute the status command.
pub fn cmd_status(format: OutputFormat, config: &Config, output: Option<&PathBuf>) -> Result<()> {
    let report = read_status(&config.db_path(), config)?;
    let content = match format {
        OutputFormat::Json => to_json_line(&report)?,
        OutputFormat::Text => format_status_text(&report),
    };
    write_output(output, &content)
}

fn read_json<T: DeserializeOwned + Default>(store: &SqliteStore, key: &str) -> Result<T> {
    match store.read(key)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .with_context(|| format!("Persisted value for '{}' is corrupt", key)),
        None => Ok(T::default()),
    }
}

/// Read the persisted state from the database at `path`.
pub fn read_status(path: &Path, config: &Config) -> Result<StatusReport> {
    let store = Arc::new(open_store(path)?);
    let state: SessionState = read_json(&store, SESSION_KEY)?;
    let cache: NearbyCache = read_json(&store, CACHE_KEY)?;
    let entries = store.entries()?;

    let kv: Arc<dyn KeyValueStore> = store;
    let replay = ReplayBuffer::load(kv, config.replay_capacity())
        .context("Failed to load replay buffer")?;

    Ok(StatusReport {
        database: path.to_path_buf(),
        state,
        geofences: cache.geofences().len(),
        beacons: cache.beacons().len(),
        places: cache.places().len(),
        synced_region: cache.synced_region().copied(),
        replay_pending: replay.len(),
        replay_evicted: replay.evicted_count(),
        entries,
    })
}

fn format_status_text(report: &StatusReport) -> String {
    let mut out = format!("Database: {}\n", report.database.display());
    out.push_str(&format!("State:    {}\n", report.state.status()));

    if let Some(config) = report.state.active_config() {
        out.push_str(&format!(
            "Config:   moving every {}s, stopped every {}s, replay {}\n",
            config.moving_update_interval, config.stopped_update_interval, config.replay
        ));
    }
    if let Some(trip) = report.state.trip() {
        out.push_str(&format!("Trip:     {} ({:?})\n", trip.external_id, trip.mode));
    }

    out.push_str(&format!(
        "Cache:    {} geofences, {} beacons, {} places\n",
        report.geofences, report.beacons, report.places
    ));
    match &report.synced_region {
        Some(region) => out.push_str(&format!(
            "Region:   {:.0} m around {}\n",
            region.radius, region.center
        )),
        None => out.push_str("Region:   none (next fix will sync)\n"),
    }
    out.push_str(&format!(
        "Replay:   {} pending, {} evicted\n",
        report.replay_pending, report.replay_evicted
    ));

    if !report.entries.is_empty() {
        out.push_str("\nStored keys:\n");
        for entry in &report.entries {
            out.push_str(&format!(
                "  {:<20} {:>8} bytes  {}\n",
                entry.key,
                entry.size,
                format_time(entry.updated_at)
            ));
        }
    }
    out
}
