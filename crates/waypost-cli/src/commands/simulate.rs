//! Simulate command - run a tracking session over a recorded trace.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{info, warn};

use waypost_core::{
    Error as EngineError, EventReceiver, FixOutcome, MetricsSnapshot, MockSyncClient,
    RetryConfig, SessionHandle, SessionState, SyncClient, TrackingEvent, TrackingSession,
};
use waypost_store::SqliteStore;
use waypost_types::{KeyValueStore, TrackingConfig};

use crate::cli::{OutputFormat, SimulateArgs};
use crate::config::Config;
use crate::script::{ServerScript, Step, fix_at, load_trace, trip_config};
use crate::util::{open_store, to_json_line, write_output};

/// What one trace step did.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub step: &'static str,
    pub outcome: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub detail: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<TrackingEvent>,
}

/// Result of a whole simulation.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub steps: Vec<StepReport>,
    pub state: SessionState,
    pub metrics: MetricsSnapshot,
    pub server_calls: Option<u64>,
}

/// Execute the simulate command.
pub async fn cmd_simulate(
    args: SimulateArgs,
    config: &Config,
    output: Option<&PathBuf>,
) -> Result<()> {
    let steps = load_trace(&args.trace)?;
    let tracking = config.tracking_config(args.preset.as_deref())?;

    let mock = if args.remote || args.endpoint.is_some() {
        None
    } else {
        let script = match &args.server {
            Some(path) => ServerScript::load(path)?,
            None => ServerScript::default(),
        };
        Some(Arc::new(script.into_mock()))
    };
    let client: Arc<dyn SyncClient> = match &mock {
        Some(mock) => mock.clone(),
        None => Arc::new(config.http_client(args.endpoint.as_deref())?),
    };

    let store: Arc<dyn KeyValueStore> = match (&args.db, args.persist) {
        (Some(path), _) => Arc::new(open_store(path)?),
        (None, true) => Arc::new(open_store(&config.db_path())?),
        (None, false) => {
            Arc::new(SqliteStore::open_in_memory().context("Failed to open in-memory database")?)
        }
    };

    let mut options = config.session_options()?;
    if args.no_delay {
        let live_retry = without_delay(options.live_retry.clone());
        let replay_retry = without_delay(options.replay_retry.clone());
        options = options.live_retry(live_retry).replay_retry(replay_retry);
    }

    let session = TrackingSession::restore(client, store, options)
        .context("Failed to restore tracking session")?;
    let handle = session.spawn();
    let mut events = handle.subscribe();

    info!("Simulating {} steps from {}", steps.len(), args.trace.display());
    let report = run_trace(
        &handle,
        mock.as_deref(),
        &mut events,
        steps,
        &tracking,
        OffsetDateTime::now_utc(),
    )
    .await?;
    handle.shutdown().await.ok();

    let report = SimulationReport {
        server_calls: mock.as_ref().map(|m| m.call_count()),
        ..report
    };

    let content = match args.output.format {
        OutputFormat::Json => to_json_line(&report)?,
        OutputFormat::Text => format_report_text(&report, args.events),
    };
    write_output(output, &content)
}

fn without_delay(retry: RetryConfig) -> RetryConfig {
    retry
        .base_delay(Duration::ZERO)
        .max_delay(Duration::ZERO)
        .jitter(false)
}

/// Feed `steps` to the session in order.
///
/// Tracking starts with `tracking` unless the trace opens with its own
/// `start` step or the restored session is already active. A step that fails
/// is reported and the trace continues.
pub async fn run_trace(
    handle: &SessionHandle,
    mock: Option<&MockSyncClient>,
    events: &mut EventReceiver,
    steps: Vec<Step>,
    tracking: &TrackingConfig,
    start: OffsetDateTime,
) -> Result<SimulationReport> {
    let opens_with_start = matches!(steps.first(), Some(Step::Start { .. }));
    if !opens_with_start && !handle.state().await?.is_active() {
        handle.start_tracking(tracking.clone()).await?;
    }
    drain_events(events);

    let mut reports = Vec::with_capacity(steps.len());
    for (index, step) in steps.into_iter().enumerate() {
        let name = step.name();
        let (outcome, detail) = match run_step(handle, mock, step, tracking, start).await {
            Ok(result) => result,
            Err(StepError::Engine(EngineError::SessionClosed)) => {
                bail!("Tracking session stopped unexpectedly at step {}", index)
            }
            Err(e) => {
                warn!("Step {} ({}) failed: {}", index, name, e);
                ("error".to_string(), json!({ "error": e.to_string() }))
            }
        };
        reports.push(StepReport {
            index,
            step: name,
            outcome,
            detail,
            events: drain_events(events),
        });
    }

    Ok(SimulationReport {
        steps: reports,
        state: handle.state().await?,
        metrics: handle.metrics().snapshot(),
        server_calls: None,
    })
}

#[derive(Debug)]
enum StepError {
    Engine(EngineError),
    Invalid(anyhow::Error),
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepError::Engine(e) => write!(f, "{}", e),
            StepError::Invalid(e) => write!(f, "{}", e),
        }
    }
}

impl From<EngineError> for StepError {
    fn from(e: EngineError) -> Self {
        StepError::Engine(e)
    }
}

impl From<anyhow::Error> for StepError {
    fn from(e: anyhow::Error) -> Self {
        StepError::Invalid(e)
    }
}

async fn run_step(
    handle: &SessionHandle,
    mock: Option<&MockSyncClient>,
    step: Step,
    tracking: &TrackingConfig,
    start: OffsetDateTime,
) -> std::result::Result<(String, Value), StepError> {
    match step {
        Step::Start { preset } => {
            let config = match preset {
                Some(name) => crate::config::named_preset(&name)?,
                None => tracking.clone(),
            };
            handle.start_tracking(config).await?;
            done(Value::Null)
        }
        Step::Fix {
            lat,
            lon,
            accuracy,
            offset_secs,
            source,
        } => {
            let fix = fix_at(start, lat, lon, accuracy, offset_secs, source);
            let outcome = handle.on_fix(fix).await?;
            Ok(describe_outcome(&outcome))
        }
        Step::Beacon { id, entered } => {
            let outcome = handle.on_beacon_detected(id, entered).await?;
            Ok(describe_outcome(&outcome))
        }
        Step::StartTrip {
            trip,
            preset,
            config,
        } => {
            let config = trip_config(preset.as_deref(), config.as_ref())?;
            let external_id = trip.external_id.clone();
            handle.start_trip(trip, config).await?;
            done(json!({ "trip": external_id }))
        }
        Step::CompleteTrip => {
            let trip = handle.complete_trip().await?;
            done(json!({ "trip": trip.external_id }))
        }
        Step::CancelTrip => {
            let trip = handle.cancel_trip().await?;
            done(json!({ "trip": trip.external_id }))
        }
        Step::UpdateConfig { config } => {
            handle.update_config(config).await?;
            done(Value::Null)
        }
        Step::Flush => {
            let delivered = handle.flush_replays().await?;
            done(json!({ "delivered": delivered }))
        }
        Step::Offline { offline } => {
            let Some(mock) = mock else {
                return Err(StepError::Invalid(anyhow::anyhow!(
                    "offline steps need the mock server"
                )));
            };
            mock.set_offline(offline);
            done(json!({ "offline": offline }))
        }
        Step::Stop => {
            handle.stop_tracking().await?;
            done(Value::Null)
        }
    }
}

fn done(detail: Value) -> std::result::Result<(String, Value), StepError> {
    Ok(("ok".to_string(), detail))
}

fn describe_outcome(outcome: &FixOutcome) -> (String, Value) {
    let detail = match outcome {
        FixOutcome::Synced { events, flushed } => json!({
            "events": events.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "flushed": flushed,
        }),
        FixOutcome::Queued { pending } => json!({ "pending": pending }),
        FixOutcome::Dropped { error } | FixOutcome::Rejected { error } => {
            json!({ "error": error.to_string() })
        }
        FixOutcome::Ignored | FixOutcome::Skipped | FixOutcome::Discarded => Value::Null,
    };
    (outcome.label().to_string(), detail)
}

fn drain_events(events: &mut EventReceiver) -> Vec<TrackingEvent> {
    let mut drained = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => drained.push(event),
            Err(TryRecvError::Lagged(missed)) => warn!("Missed {} session events", missed),
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    drained
}

fn describe_detail(detail: &Value) -> String {
    let Some(fields) = detail.as_object() else {
        return String::new();
    };
    let parts: Vec<String> = fields
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => format!("{}: {}", key, s),
            Value::Array(items) => format!(
                "{}: [{}]",
                key,
                items
                    .iter()
                    .map(|i| i.as_str().map(String::from).unwrap_or_else(|| i.to_string()))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            other => format!("{}: {}", key, other),
        })
        .collect();
    parts.join(", ")
}

/// Format a simulation report as text.
pub fn format_report_text(report: &SimulationReport, show_events: bool) -> String {
    let mut out = String::new();
    for step in &report.steps {
        let detail = describe_detail(&step.detail);
        out.push_str(&format!("{:>4}  {:<14} {:<10}", step.index, step.step, step.outcome));
        if !detail.is_empty() {
            out.push_str(&format!(" {}", detail));
        }
        out.push('\n');
        if show_events {
            for event in &step.events {
                let line = serde_json::to_string(event).unwrap_or_default();
                out.push_str(&format!("        event {}\n", line));
            }
        }
    }

    let m = &report.metrics;
    out.push('\n');
    out.push_str(&format!("Final state:  {}\n", report.state.status()));
    out.push_str(&format!(
        "Fixes:        {} processed, {} handled locally\n",
        m.fixes_processed, m.syncs_skipped
    ));
    out.push_str(&format!(
        "Dispatches:   {} ({} attempts, {} ok, {} failed)\n",
        m.dispatches, m.attempts, m.successes, m.failures
    ));
    out.push_str(&format!(
        "Replay:       {} queued, {} flushed, {} evicted, {} discarded\n",
        m.queued, m.flushed, m.evicted, m.discarded
    ));
    if let Some(calls) = report.server_calls {
        out.push_str(&format!("Server calls: {}\n", calls));
    }
    out
}
