use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use colored::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::Result;

/// Older records are pruned after each persist.
pub const MAX_RECORDS: usize = 500;

// ======================================================
// DATA STRUCTURE
// ======================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub timestamp: String,
    pub mode: String,
    pub found: usize,
    pub added: usize,
    pub removed: usize,
    pub notified: bool,
    pub outcome: String,
    pub exit_code: i32,
    pub hash: Option<String>,
}

impl RunRecord {
    pub fn new(mode: &str) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_timestamp(),
            mode: mode.to_string(),
            found: 0,
            added: 0,
            removed: 0,
            notified: false,
            outcome: String::new(),
            exit_code: 0,
            hash: None,
        }
    }
}

/// Fixed-width UTC timestamp, so file names sort chronologically.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ======================================================
// HASH
// ======================================================

fn compute_hash(record: &RunRecord) -> Result<String> {
    let mut temp = record.clone();
    temp.hash = None;

    let json = serde_json::to_string(&temp)?;

    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());

    Ok(format!("{:x}", hasher.finalize()))
}

// ======================================================
// PERSIST
// ======================================================

pub fn persist(dir: &Path, record: &RunRecord) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let mut with_hash = record.clone();
    with_hash.hash = Some(compute_hash(record)?);

    let path = dir.join(format!("{}.json", record.timestamp.replace(':', "-")));
    fs::write(&path, serde_json::to_string_pretty(&with_hash)?)?;

    prune(dir, MAX_RECORDS)?;
    Ok(path)
}

fn record_paths(dir: &Path) -> io::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();

    entries.sort();
    Ok(entries)
}

fn prune(dir: &Path, keep: usize) -> Result<()> {
    let entries = record_paths(dir)?;
    if entries.len() <= keep {
        return Ok(());
    }

    for path in &entries[..entries.len() - keep] {
        fs::remove_file(path)?;
    }
    Ok(())
}

// ======================================================
// LOAD
// ======================================================

/// All readable records, oldest first. Unparseable files are skipped.
pub fn load_all(dir: &Path) -> Result<Vec<RunRecord>> {
    let mut records = Vec::new();

    for path in record_paths(dir)? {
        let content = fs::read_to_string(&path)?;
        match serde_json::from_str::<RunRecord>(&content) {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable history record"),
        }
    }

    Ok(records)
}

// ======================================================
// INTEGRITY
// ======================================================

/// Files whose stored hash does not match their content (or that no longer parse).
pub fn verify(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut bad = Vec::new();

    for path in record_paths(dir)? {
        let content = fs::read_to_string(&path)?;

        let record: RunRecord = match serde_json::from_str(&content) {
            Ok(r) => r,
            Err(_) => {
                bad.push(path);
                continue;
            }
        };

        match &record.hash {
            Some(stored) if *stored == compute_hash(&record)? => {}
            _ => bad.push(path),
        }
    }

    Ok(bad)
}

// ======================================================
// DISPLAY
// ======================================================

pub fn print_table(records: &[RunRecord], limit: usize) {
    if records.is_empty() {
        println!("No runs recorded yet.");
        return;
    }

    println!();
    println!("{}", "Doctobot Runs".bold());
    println!("{}", "─".repeat(88).dimmed());
    println!(
        "{:<26} {:<8} {:>6} {:>6} {:>8} {:<9} {}",
        "Timestamp", "Mode", "Found", "Added", "Removed", "Notified", "Outcome"
    );
    println!("{}", "─".repeat(88).dimmed());

    let start = records.len().saturating_sub(limit);
    for r in &records[start..] {
        let outcome = format!("{} ({})", r.outcome, r.exit_code);
        let outcome = match r.exit_code {
            0 => outcome.green(),
            2 | 3 => outcome.yellow(),
            _ => outcome.red(),
        };

        println!(
            "{:<26} {:<8} {:>6} {:>6} {:>8} {:<9} {}",
            r.timestamp,
            r.mode,
            r.found,
            r.added,
            r.removed,
            if r.notified { "yes" } else { "no" },
            outcome
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: &str, found: usize) -> RunRecord {
        RunRecord {
            timestamp: ts.to_string(),
            found,
            outcome: "notified".into(),
            ..RunRecord::new("always")
        }
    }

    #[test]
    fn persist_hashes_and_loads_in_order() {
        let dir = tempfile::tempdir().unwrap();
        persist(dir.path(), &record("2025-03-10T08:00:00.000Z", 2)).unwrap();
        persist(dir.path(), &record("2025-03-09T08:00:00.000Z", 1)).unwrap();

        let all = load_all(dir.path()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].found, 1);
        assert_eq!(all[1].found, 2);
        assert!(all.iter().all(|r| r.hash.is_some()));
        assert!(verify(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn verify_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let path = persist(dir.path(), &record("2025-03-10T08:00:00.000Z", 2)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("\"found\": 2", "\"found\": 9")).unwrap();

        assert_eq!(verify(dir.path()).unwrap(), vec![path]);
    }

    #[test]
    fn prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for day in 1..=5 {
            let ts = format!("2025-03-{:02}T08:00:00.000Z", day);
            fs::write(
                dir.path().join(format!("{}.json", ts.replace(':', "-"))),
                serde_json::to_string(&record(&ts, day)).unwrap(),
            )
            .unwrap();
        }

        prune(dir.path(), 2).unwrap();
        let all = load_all(dir.path()).unwrap();
        let found: Vec<usize> = all.iter().map(|r| r.found).collect();
        assert_eq!(found, vec![4, 5]);
    }

    #[test]
    fn missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("history");
        assert!(load_all(&missing).unwrap().is_empty());
        assert!(verify(&missing).unwrap().is_empty());
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let ts = now_timestamp();
        assert_eq!(ts.len(), "2025-03-10T08:00:00.000Z".len());
        assert!(ts.ends_with('Z'));
    }
}
