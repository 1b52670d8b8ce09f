use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("expected a .json file, got: {0}")]
    NotJson(PathBuf),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize duration table: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Cumulative seconds spent in voice, keyed by member id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DurationTable(BTreeMap<u64, f64>);

impl DurationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds to the member's total and returns the new total.
    pub fn add(&mut self, member_id: u64, elapsed_secs: f64) -> f64 {
        let total = self.0.entry(member_id).or_insert(0.0);
        *total += elapsed_secs;
        *total
    }

    pub fn get(&self, member_id: u64) -> Option<f64> {
        self.0.get(&member_id).copied()
    }

    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }

    /// Members by descending total, ties broken by member id.
    pub fn ranked(&self) -> Vec<(u64, f64)> {
        let mut rows: Vec<(u64, f64)> = self.0.iter().map(|(id, secs)| (*id, *secs)).collect();
        rows.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        rows
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// JSON file holding a [`DurationTable`]. Every update rewrites the whole file.
#[derive(Debug, Clone)]
pub struct DurationStore {
    path: PathBuf,
}

impl DurationStore {
    /// Creates the file with an empty table if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if !is_json {
            return Err(StoreError::NotJson(path));
        }

        let store = Self { path };
        if !store.path.exists() {
            tracing::info!(path = %store.path.display(), "creating duration file");
            store.save(&DurationTable::new())?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing, unreadable or corrupt file reads as an empty table.
    pub fn load(&self) -> DurationTable {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return DurationTable::new(),
            Err(e) => {
                tracing::error!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to read duration file"
                );
                return DurationTable::new();
            }
        };

        match serde_json::from_str::<BTreeMap<u64, f64>>(&raw) {
            Ok(map) => DurationTable(map),
            Err(e) => {
                tracing::error!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to decode duration file"
                );
                DurationTable::new()
            }
        }
    }

    pub fn save(&self, table: &DurationTable) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(&table.0)?;
        fs::write(&self.path, json).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })
    }

    /// Adds a finished session to the member's total and persists the table.
    pub fn record(&self, member_id: u64, elapsed_secs: f64) -> Result<f64, StoreError> {
        let mut table = self.load();
        let total = table.add(member_id, elapsed_secs);
        self.save(&table)?;
        tracing::debug!(member_id, elapsed_secs, total, "recorded voice time");
        Ok(total)
    }

    /// `None` when nothing was ever recorded for the member.
    pub fn query(&self, member_id: u64) -> Option<f64> {
        self.load().get(member_id)
    }

    pub fn leaderboard(&self, limit: usize) -> Vec<(u64, f64)> {
        let mut rows = self.load().ranked();
        rows.truncate(limit);
        rows
    }

    pub fn grand_total(&self) -> f64 {
        self.load().total()
    }
}
