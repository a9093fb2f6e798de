use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::scan::Listing;

// ======================================================
// DATA STRUCTURES
// ======================================================

/// Canonical form of a listing used for change detection. The hour is
/// dropped because cards do not always state one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateItem {
    // Field order gives the (day, name, url) sort.
    pub day: String,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub items: Vec<StateItem>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDiff {
    pub added: Vec<StateItem>,
    pub removed: Vec<StateItem>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

// ======================================================
// CANONICAL FORM / DIFF
// ======================================================

pub fn canonicalize(listings: &[Listing]) -> Vec<StateItem> {
    listings
        .iter()
        .map(|l| StateItem {
            day: l.availability.date.format("%Y-%m-%d").to_string(),
            name: l.name.clone(),
            url: l.url.clone(),
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn diff(old: &[StateItem], new: &[StateItem]) -> StateDiff {
    let old: BTreeSet<&StateItem> = old.iter().collect();
    let new: BTreeSet<&StateItem> = new.iter().collect();

    StateDiff {
        added: new.difference(&old).map(|i| (*i).clone()).collect(),
        removed: old.difference(&new).map(|i| (*i).clone()).collect(),
    }
}

// ======================================================
// LOAD / SAVE
// ======================================================

/// Missing file: empty state. Unreadable or corrupt file: warning, empty state.
pub fn load(path: &Path) -> State {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return State::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "state file unreadable, starting empty");
            return State::default();
        }
    };

    match serde_json::from_str(&raw) {
        Ok(state) => state,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "state file corrupt, starting empty");
            State::default()
        }
    }
}

/// Write `items` atomically (temp file + rename), creating parent directories.
pub fn save(path: &Path, items: &[StateItem]) -> Result<()> {
    let state_err = |source: io::Error| Error::State {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(state_err)?;
    }

    let state = State {
        items: items.to_vec(),
        updated_at: Some(Utc::now().to_rfc3339()),
    };
    let json = serde_json::to_string_pretty(&state)?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(state_err)?;
    fs::rename(&tmp, path).map_err(state_err)?;
    Ok(())
}

pub fn reset(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(Error::State {
            path: path.to_path_buf(),
            source,
        }),
    }
}
