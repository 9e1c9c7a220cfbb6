//! Persisted dedup state, atomic result-artifact writes and the HTTP
//! submission client.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use qcourier_core::DedupSnapshot;
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tracing::{info_span, Instrument};
use uuid::Uuid;

/// Set of completed-item keys, loaded at startup and flushed after each
/// batch. The snapshot file is the only state that survives a restart.
#[derive(Debug)]
pub struct DedupStore {
    path: PathBuf,
    keys: BTreeSet<String>,
}

impl DedupStore {
    /// Loads the snapshot at `path`. A missing file is an empty store; a
    /// corrupt file is surfaced so startup can decide what to do with it.
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking dedup snapshot {}", path.display()))?
        {
            return Ok(Self {
                path,
                keys: BTreeSet::new(),
            });
        }

        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading dedup snapshot {}", path.display()))?;
        let snapshot: DedupSnapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing dedup snapshot {}", path.display()))?;
        Ok(Self {
            path,
            keys: snapshot.files.into_iter().collect(),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn insert(&mut self, key: String) -> bool {
        self.keys.insert(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Overwrites the snapshot with the full current set and a timestamp.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let snapshot = DedupSnapshot {
            files: self.keys.iter().cloned().collect(),
            timestamp: Utc::now(),
        };
        let bytes =
            serde_json::to_vec_pretty(&snapshot).context("serializing dedup snapshot")?;
        write_atomic(&self.path, &bytes).await
    }
}

/// Writes a normalized result record under `dir`, creating the directory as
/// needed. Returns the path of the written artifact.
pub async fn write_result(dir: &Path, file_name: &str, record: &Value) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating results directory {}", dir.display()))?;
    let path = dir.join(file_name);
    let bytes = serde_json::to_vec_pretty(record).context("serializing result record")?;
    write_atomic(&path, &bytes).await?;
    Ok(path)
}

/// Temp-file + rename so a crash mid-write never leaves a torn artifact.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("artifact path {} has no parent", path.display()))?;
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

    fs::write(&temp_path, bytes)
        .await
        .with_context(|| format!("writing temp artifact {}", temp_path.display()))?;
    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming temp artifact {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
}

/// Seam between the pipeline and the remote compute service.
#[async_trait]
pub trait RemoteSubmitter: Send + Sync {
    async fn submit(&self, group_name: &str, file_name: &str, payload: &Value)
        -> Result<Value, SubmitError>;
}

#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    pub api_url: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

/// Authenticated POST of raw payload JSON to the fixed endpoint. No retries
/// here: a failed item is simply retried on the next poll cycle.
#[derive(Debug)]
pub struct HttpSubmitter {
    client: reqwest::Client,
    config: SubmitterConfig,
}

impl HttpSubmitter {
    pub fn new(config: SubmitterConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl RemoteSubmitter for HttpSubmitter {
    async fn submit(
        &self,
        group_name: &str,
        file_name: &str,
        payload: &Value,
    ) -> Result<Value, SubmitError> {
        // The two groups of a batch submit concurrently on one task, so the
        // span must travel with the future rather than sit on the thread's
        // span stack across suspension points.
        let span = info_span!("submit", group = group_name, file = file_name);
        async {
            let response = self
                .client
                .post(&self.config.api_url)
                .basic_auth(&self.config.username, Some(&self.config.password))
                .json(payload)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SubmitError::HttpStatus {
                    status: status.as_u16(),
                    body,
                });
            }

            Ok(response.json().await?)
        }
        .instrument(span)
        .await
    }
}
