//! Scheduling pipeline: pairs discovered groups into bounded batches, drives
//! submission of each payload, and runs the outer poll loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use qcourier_core::{GroupRef, ItemOutcome, ItemStatus, RunSummary, WorkItem};
use qcourier_discovery::{discover_groups, discover_items, extract_car_number, result_file_name};
use qcourier_storage::{
    write_result, DedupStore, HttpSubmitter, RemoteSubmitter, SubmitError, SubmitterConfig,
};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const DEDUP_SNAPSHOT_FILE: &str = "processed_files.json";
pub const SUMMARY_FILE: &str = "processing_summary.json";

#[derive(Debug, Clone)]
pub struct CourierConfig {
    pub graphs_dir: PathBuf,
    pub results_dir: PathBuf,
    pub group_prefix: String,
    pub api_url: String,
    pub api_username: String,
    pub api_password: String,
    pub http_timeout: Duration,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub item_delay: Duration,
    pub batch_delay: Duration,
}

impl CourierConfig {
    pub fn from_env() -> Result<Self> {
        let api_url =
            std::env::var("QCOURIER_API_URL").context("QCOURIER_API_URL must be set")?;
        Ok(Self {
            graphs_dir: std::env::var("QCOURIER_GRAPHS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./graphs")),
            results_dir: std::env::var("QCOURIER_RESULTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./quantum_results")),
            group_prefix: std::env::var("QCOURIER_GROUP_PREFIX")
                .unwrap_or_else(|_| "graph".to_string()),
            api_url,
            api_username: std::env::var("QCOURIER_API_USERNAME").unwrap_or_default(),
            api_password: std::env::var("QCOURIER_API_PASSWORD").unwrap_or_default(),
            http_timeout: Duration::from_secs(env_u64("QCOURIER_HTTP_TIMEOUT_SECS", 10)),
            poll_interval: Duration::from_secs(env_u64("QCOURIER_POLL_INTERVAL_SECS", 5)),
            error_backoff: Duration::from_secs(env_u64("QCOURIER_ERROR_BACKOFF_SECS", 10)),
            item_delay: Duration::from_millis(env_u64("QCOURIER_ITEM_DELAY_MS", 1000)),
            batch_delay: Duration::from_millis(env_u64("QCOURIER_BATCH_DELAY_MS", 2000)),
        })
    }

    pub fn dedup_snapshot_path(&self) -> PathBuf {
        self.results_dir.join(DEDUP_SNAPSHOT_FILE)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.results_dir.join(SUMMARY_FILE)
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("payload parse failed: {0}")]
    Payload(String),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error("unrecognized response format")]
    ResponseFormat,
    #[error("writing result failed: {0}")]
    Persist(String),
}

/// Partitions the ordered group list into batches of two, tail singleton if
/// the count is odd. Input order is preserved across the concatenated output.
pub fn pair_groups<T>(groups: Vec<T>) -> Vec<Vec<T>> {
    let mut batches = Vec::with_capacity(groups.len().div_ceil(2));
    let mut iter = groups.into_iter();
    while let Some(first) = iter.next() {
        match iter.next() {
            Some(second) => batches.push(vec![first, second]),
            None => batches.push(vec![first]),
        }
    }
    batches
}

/// Normalizes a remote response into the canonical result-record shape.
///
/// Two shapes are accepted: a body whose `data` is already a sequence passes
/// through unchanged, and a `{status: true, data: {..}}` mapping becomes a
/// sequence of `{bitstring, value}` records in mapping order. Anything else
/// is rejected so no artifact is written for it.
pub fn normalize_response(body: &Value) -> Result<Value, ProcessError> {
    if body.get("data").map(Value::is_array).unwrap_or(false) {
        return Ok(body.clone());
    }
    if body.get("status").and_then(Value::as_bool) == Some(true) {
        if let Some(map) = body.get("data").and_then(Value::as_object) {
            let records: Vec<Value> = map
                .iter()
                .map(|(bitstring, value)| json!({ "bitstring": bitstring, "value": value }))
                .collect();
            return Ok(json!({ "data": records }));
        }
    }
    Err(ProcessError::ResponseFormat)
}

pub struct CourierPipeline {
    config: CourierConfig,
    submitter: Arc<dyn RemoteSubmitter>,
}

impl CourierPipeline {
    /// Builds the pipeline and eagerly creates the results root; failing to
    /// create it is the one fatal startup condition.
    pub fn new(config: CourierConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.results_dir).with_context(|| {
            format!("creating results directory {}", config.results_dir.display())
        })?;
        let submitter = HttpSubmitter::new(SubmitterConfig {
            api_url: config.api_url.clone(),
            username: config.api_username.clone(),
            password: config.api_password.clone(),
            timeout: config.http_timeout,
        })?;
        Ok(Self {
            config,
            submitter: Arc::new(submitter),
        })
    }

    /// Same pipeline with the remote seam swapped out, for tests.
    pub fn with_submitter(config: CourierConfig, submitter: Arc<dyn RemoteSubmitter>) -> Result<Self> {
        std::fs::create_dir_all(&config.results_dir).with_context(|| {
            format!("creating results directory {}", config.results_dir.display())
        })?;
        Ok(Self { config, submitter })
    }

    /// One full discovery pass: scan, pair, execute batches sequentially,
    /// persist dedup state after each batch, then write the run summary.
    pub async fn run_pass(&self, store: &mut DedupStore) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let groups = discover_groups(&self.config.graphs_dir, &self.config.group_prefix)?;
        info!(%run_id, groups = groups.len(), "discovery pass");

        let batches = pair_groups(groups);
        let batch_count = batches.len();
        let mut outcomes = Vec::new();

        for (i, batch) in batches.into_iter().enumerate() {
            let batch_outcomes = match batch.as_slice() {
                [solo] => self.process_group(solo, store).await,
                [left, right] => {
                    let (a, b) = tokio::join!(
                        self.process_group(left, store),
                        self.process_group(right, store)
                    );
                    a.into_iter().chain(b).collect()
                }
                _ => unreachable!("batches hold one or two groups"),
            };

            // Dedup marking happens only here, after the batch's groups have
            // joined, and only for items whose artifact was durably written.
            for outcome in &batch_outcomes {
                if outcome.is_completed() {
                    store.insert(outcome.dedup_key());
                }
            }
            if let Err(err) = store.flush().await {
                warn!(error = %format!("{err:#}"), "dedup snapshot flush failed");
            }

            outcomes.extend(batch_outcomes);
            if i + 1 < batch_count {
                sleep(self.config.batch_delay).await;
            }
        }

        let summary = RunSummary::from_outcomes(Utc::now(), &outcomes);
        for entry in summary.results.iter().filter(|r| !r.success) {
            warn!(
                group = %entry.group,
                file = %entry.file,
                error = entry.error.as_deref().unwrap_or("unknown"),
                "item failed"
            );
        }
        info!(
            %run_id,
            processed = summary.total_processed,
            successful = summary.successful,
            failed = summary.failed,
            "pass complete"
        );

        let summary_value = serde_json::to_value(&summary).context("serializing run summary")?;
        if let Err(err) = write_result(&self.config.results_dir, SUMMARY_FILE, &summary_value).await
        {
            warn!(error = %format!("{err:#}"), "run summary write failed");
        }

        Ok(summary)
    }

    /// Processes one group's items in order. Discovery trouble inside a group
    /// degrades to an empty result; the directory is re-scanned next cycle.
    async fn process_group(&self, group: &GroupRef, store: &DedupStore) -> Vec<ItemOutcome> {
        let items = match discover_items(group) {
            Ok(items) => items,
            Err(err) => {
                warn!(group = %group.name, error = %format!("{err:#}"), "item discovery failed");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            let key = qcourier_core::dedup_key(&group.name, &item.file_name);
            let status = if store.contains(&key) {
                ItemStatus::Skipped
            } else {
                match self.run_item(group, &item).await {
                    Ok(output_path) => ItemStatus::Completed { output_path },
                    Err(err) => ItemStatus::Failed {
                        error: err.to_string(),
                    },
                }
            };

            let throttle = matches!(status, ItemStatus::Completed { .. });
            outcomes.push(ItemOutcome {
                group_name: group.name.clone(),
                file_name: item.file_name.clone(),
                car_number: extract_car_number(&item.file_name),
                status,
            });
            if throttle {
                sleep(self.config.item_delay).await;
            }
        }
        outcomes
    }

    /// Submit one payload and write its normalized result. The artifact write
    /// is the only externally observable side effect; nothing is written on
    /// any failure path.
    async fn run_item(&self, group: &GroupRef, item: &WorkItem) -> Result<PathBuf, ProcessError> {
        let bytes = tokio::fs::read(&item.path)
            .await
            .map_err(|err| ProcessError::Payload(err.to_string()))?;
        let payload: Value = serde_json::from_slice(&bytes)
            .map_err(|err| ProcessError::Payload(err.to_string()))?;

        let response = self
            .submitter
            .submit(&group.name, &item.file_name, &payload)
            .await?;
        let record = normalize_response(&response)?;

        let file_name = result_file_name(&group.name, &item.file_name);
        let group_dir = self.config.results_dir.join(&group.name);
        write_result(&group_dir, &file_name, &record)
            .await
            .map_err(|err| ProcessError::Persist(format!("{err:#}")))
    }

    /// Outer control loop: repeat passes on a fixed interval, back off after
    /// a failed pass, and flush dedup state once the shutdown flag flips.
    /// Shutdown is cooperative and checked between cycles, not inside one.
    pub async fn run_poll_loop(
        &self,
        store: &mut DedupStore,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let wait = match self.run_pass(store).await {
                Ok(_) => self.config.poll_interval,
                Err(err) => {
                    error!(error = %format!("{err:#}"), "pass failed, backing off");
                    self.config.error_backoff
                }
            };
            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.changed() => {}
            }
        }

        store
            .flush()
            .await
            .context("flushing dedup snapshot at shutdown")
    }
}

/// Flips the returned flag on SIGINT or SIGTERM.
pub fn spawn_shutdown_listener() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!(error = %err, "SIGTERM handler unavailable, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
