//! Series persistence: the interface the router talks to, and an in-memory
//! implementation.
//!
//! A series is a named list of values ("currency" in the request format).
//! Every appended value records its increment over the previous one.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Outcome of a mutating store operation that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Ok,
    AlreadyExists,
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// One recorded value of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub value: f64,
    /// `value - previous`, 0 for the first value.
    pub inc_abs: f64,
    /// `inc_abs / previous`, 0 for the first value or a zero previous.
    pub inc_rel: f64,
    /// Unix milliseconds.
    pub date: u64,
}

impl HistoryEntry {
    /// Entry for `value` appended after `previous`.
    pub fn after(previous: Option<f64>, value: f64, date: u64) -> Self {
        let (inc_abs, inc_rel) = match previous {
            Some(prev) => {
                let abs = value - prev;
                let rel = if prev == 0.0 { 0.0 } else { abs / prev };
                (abs, rel)
            }
            None => (0.0, 0.0),
        };
        Self {
            value,
            inc_abs,
            inc_rel,
            date,
        }
    }
}

/// A series and its latest value, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSummary {
    pub currency: String,
    pub value: Option<f64>,
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Persistence collaborator used by the message router.
///
/// Implementations are called from worker tasks and must be thread-safe.
pub trait SeriesStore: Send + Sync {
    /// `Ok` or `AlreadyExists`.
    fn add(&self, name: &str) -> Result<StoreStatus, StoreError>;

    /// `Ok` or `NotFound`.
    fn add_value(&self, name: &str, value: f64) -> Result<StoreStatus, StoreError>;

    /// `Ok` or `NotFound`. Drops the series and its history.
    fn remove(&self, name: &str) -> Result<StoreStatus, StoreError>;

    /// Every series, ordered by name.
    fn list(&self) -> Result<Vec<SeriesSummary>, StoreError>;

    /// History oldest first, `None` for an unknown series.
    fn history(&self, name: &str) -> Result<Option<Vec<HistoryEntry>>, StoreError>;
}

// ── In-memory store ───────────────────────────────────────────────────────────

/// Store that lives as long as the process. Used by tests and by the daemon
/// when `storage.backend = "memory"`.
#[derive(Clone, Default)]
pub struct MemoryStore {
    series: Arc<DashMap<String, Vec<HistoryEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SeriesStore for MemoryStore {
    fn add(&self, name: &str) -> Result<StoreStatus, StoreError> {
        match self.series.entry(name.to_string()) {
            Entry::Occupied(_) => Ok(StoreStatus::AlreadyExists),
            Entry::Vacant(entry) => {
                entry.insert(Vec::new());
                Ok(StoreStatus::Ok)
            }
        }
    }

    fn add_value(&self, name: &str, value: f64) -> Result<StoreStatus, StoreError> {
        let Some(mut history) = self.series.get_mut(name) else {
            return Ok(StoreStatus::NotFound);
        };
        let previous = history.last().map(|e| e.value);
        history.push(HistoryEntry::after(previous, value, now_millis()));
        Ok(StoreStatus::Ok)
    }

    fn remove(&self, name: &str) -> Result<StoreStatus, StoreError> {
        Ok(match self.series.remove(name) {
            Some(_) => StoreStatus::Ok,
            None => StoreStatus::NotFound,
        })
    }

    fn list(&self) -> Result<Vec<SeriesSummary>, StoreError> {
        let mut all: Vec<SeriesSummary> = self
            .series
            .iter()
            .map(|entry| SeriesSummary {
                currency: entry.key().clone(),
                value: entry.value().last().map(|e| e.value),
            })
            .collect();
        all.sort_by(|a, b| a.currency.cmp(&b.currency));
        Ok(all)
    }

    fn history(&self, name: &str) -> Result<Option<Vec<HistoryEntry>>, StoreError> {
        Ok(self.series.get(name).map(|h| h.clone()))
    }
}
