//! Read-only discovery of group directories and payload files, plus the pure
//! filename parsers used to derive result-artifact names.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use qcourier_core::{GroupRef, WorkItem};
use regex::Regex;
use tracing::warn;

static CAR_ORDINAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_car_(\d+)\.json$").expect("car ordinal regex is valid"));

/// Parses the numeric suffix of `{prefix}_<n>`. Anything else is not a group.
pub fn parse_group_index(dir_name: &str, prefix: &str) -> Option<u64> {
    let rest = dir_name.strip_prefix(prefix)?.strip_prefix('_')?;
    if rest.is_empty() {
        return None;
    }
    rest.parse().ok()
}

/// Extracts the embedded car ordinal from a payload filename, e.g.
/// `api_payload_car_7.json` -> `Some(7)`.
pub fn extract_car_number(file_name: &str) -> Option<u64> {
    CAR_ORDINAL
        .captures(file_name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Deterministic result-artifact name for one item. Falls back to the
/// original stem when no car ordinal can be extracted.
pub fn result_file_name(group_name: &str, item_file_name: &str) -> String {
    match extract_car_number(item_file_name) {
        Some(car) => format!("Result_{group_name}_car_{car}.json"),
        None => {
            let stem = item_file_name
                .strip_suffix(".json")
                .unwrap_or(item_file_name);
            format!("Result_{group_name}_{stem}.json")
        }
    }
}

/// Enumerates group directories under `root`, ascending by numeric index.
///
/// A missing root is an empty discovery result, not an error: the directory
/// may appear before the next poll cycle. Entries that do not match the
/// `{prefix}_<n>` convention are skipped.
pub fn discover_groups(root: &Path, prefix: &str) -> Result<Vec<GroupRef>> {
    if !root.exists() {
        warn!(root = %root.display(), "graphs root missing, discovering nothing this cycle");
        return Ok(Vec::new());
    }

    let mut groups = Vec::new();
    let entries =
        std::fs::read_dir(root).with_context(|| format!("reading {}", root.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("reading entry under {}", root.display()))?;
        if !entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(index) = parse_group_index(&name, prefix) {
            groups.push(GroupRef {
                index,
                name,
                path: entry.path(),
            });
        }
    }

    groups.sort_by_key(|g| g.index);
    Ok(groups)
}

/// Enumerates the `.json` payload files directly inside a group directory,
/// lexically sorted. Files without a car ordinal are still items; they get a
/// fallback output name at write time.
pub fn discover_items(group: &GroupRef) -> Result<Vec<WorkItem>> {
    let entries = std::fs::read_dir(&group.path)
        .with_context(|| format!("reading group {}", group.path.display()))?;

    let mut items = Vec::new();
    for entry in entries {
        let entry =
            entry.with_context(|| format!("reading entry under {}", group.path.display()))?;
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        if !file_name.ends_with(".json") {
            continue;
        }
        items.push(WorkItem {
            file_name,
            path: entry.path(),
        });
    }

    items.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(items)
}
