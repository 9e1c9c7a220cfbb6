//! Core domain model for the circuit courier: groups, work items, dedup keys
//! and the artifact schemas shared across the workspace.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A numbered group directory (`graph_<n>`) holding one set of payload files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRef {
    pub index: u64,
    pub name: String,
    pub path: PathBuf,
}

/// One payload file inside a group, the unit of remote submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub file_name: String,
    pub path: PathBuf,
}

/// Composite identity of a completed item, `"{group}/{file}"`.
///
/// This is the only state that crosses poll cycles and process restarts;
/// everything else is rebuilt from the filesystem every pass.
pub fn dedup_key(group_name: &str, file_name: &str) -> String {
    format!("{group_name}/{file_name}")
}

/// Persisted dedup snapshot, overwritten wholesale on every flush.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupSnapshot {
    pub files: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Terminal state of one item within a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    /// Dedup hit: already completed in an earlier pass, nothing was done.
    Skipped,
    Completed { output_path: PathBuf },
    Failed { error: String },
}

/// Outcome of processing one item, fed into the run summary.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub group_name: String,
    pub file_name: String,
    pub car_number: Option<u64>,
    pub status: ItemStatus,
}

impl ItemOutcome {
    pub fn dedup_key(&self) -> String {
        dedup_key(&self.group_name, &self.file_name)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, ItemStatus::Completed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, ItemStatus::Skipped)
    }
}

/// One row of the persisted run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryEntry {
    pub group: String,
    pub file: String,
    pub car_number: Option<u64>,
    pub success: bool,
    pub output_path: Option<String>,
    pub error: Option<String>,
}

/// Aggregate report for one full discovery pass, written as
/// `processing_summary.json` and superseded by the next pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub timestamp: DateTime<Utc>,
    pub total_processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<SummaryEntry>,
}

impl RunSummary {
    /// Builds the summary from per-item outcomes. Skipped items were already
    /// reported by the pass that completed them and are not counted again.
    pub fn from_outcomes(timestamp: DateTime<Utc>, outcomes: &[ItemOutcome]) -> Self {
        let results: Vec<SummaryEntry> = outcomes
            .iter()
            .filter(|o| !o.is_skipped())
            .map(|o| {
                let (success, output_path, error) = match &o.status {
                    ItemStatus::Completed { output_path } => {
                        (true, Some(output_path.display().to_string()), None)
                    }
                    ItemStatus::Failed { error } => (false, None, Some(error.clone())),
                    ItemStatus::Skipped => unreachable!("skipped outcomes filtered above"),
                };
                SummaryEntry {
                    group: o.group_name.clone(),
                    file: o.file_name.clone(),
                    car_number: o.car_number,
                    success,
                    output_path,
                    error,
                }
            })
            .collect();

        let successful = results.iter().filter(|r| r.success).count();
        let failed = results.len() - successful;
        Self {
            timestamp,
            total_processed: results.len(),
            successful,
            failed,
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(group: &str, file: &str, status: ItemStatus) -> ItemOutcome {
        ItemOutcome {
            group_name: group.to_string(),
            file_name: file.to_string(),
            car_number: None,
            status,
        }
    }

    #[test]
    fn dedup_key_joins_group_and_file() {
        assert_eq!(
            dedup_key("graph_1", "api_payload_car_3.json"),
            "graph_1/api_payload_car_3.json"
        );
    }

    #[test]
    fn summary_counts_exclude_skipped_items() {
        let outcomes = vec![
            outcome("graph_1", "a.json", ItemStatus::Skipped),
            outcome(
                "graph_1",
                "b.json",
                ItemStatus::Completed {
                    output_path: PathBuf::from("out/b.json"),
                },
            ),
            outcome(
                "graph_2",
                "c.json",
                ItemStatus::Failed {
                    error: "boom".into(),
                },
            ),
        ];

        let summary = RunSummary::from_outcomes(Utc::now(), &outcomes);
        assert_eq!(summary.total_processed, 2);
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.results.len(), 2);
    }

    #[test]
    fn summary_serializes_with_camel_case_fields() {
        let outcomes = vec![outcome(
            "graph_2",
            "api_payload_car_7.json",
            ItemStatus::Failed {
                error: "status 500".into(),
            },
        )];
        let summary = RunSummary::from_outcomes(Utc::now(), &outcomes);
        let json = serde_json::to_value(&summary).expect("serialize summary");

        assert!(json.get("totalProcessed").is_some());
        let row = &json["results"][0];
        assert_eq!(row["group"], "graph_2");
        assert_eq!(row["carNumber"], serde_json::Value::Null);
        assert_eq!(row["outputPath"], serde_json::Value::Null);
        assert_eq!(row["error"], "status 500");
    }
}
