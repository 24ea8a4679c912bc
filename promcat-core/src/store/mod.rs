//! Durable record store for catalog entries
//!
//! Provides a trait-based abstraction over the backing file so the catalog
//! service does not care whether entries live in a JSON document file or in
//! SQLite. Every call goes back to disk: worker processes share the file, not
//! memory.

pub mod json_store;
pub mod sqlite_store;

use crate::entry::CatalogEntry;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use json_store::JsonFileStore;
pub use sqlite_store::SqliteStore;

/// Predicate used for lookups, keyed upserts and removals.
pub type EntryPredicate<'a> = &'a (dyn Fn(&CatalogEntry) -> bool + Sync);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Trait for record store implementations
///
/// Mutating calls are persisted before they return. Enumeration order is
/// insertion order of the backing store.
pub trait RecordStore: Send + Sync {
    /// First entry matching `predicate`
    fn get(&self, predicate: EntryPredicate<'_>) -> Result<Option<CatalogEntry>>;

    /// Replace the first entry matching `key`, or insert `entry` if none does
    fn upsert(&self, entry: &CatalogEntry, key: EntryPredicate<'_>) -> Result<UpsertOutcome>;

    /// Delete every entry matching `predicate`, returning how many were removed
    fn remove(&self, predicate: EntryPredicate<'_>) -> Result<usize>;

    /// All live entries
    fn all(&self) -> Result<Vec<CatalogEntry>>;

    /// Number of live entries
    fn count(&self) -> Result<usize> {
        Ok(self.all()?.len())
    }

    /// Path of the backing file
    fn path(&self) -> &Path;
}

/// Type alias for dynamic record store
pub type DynRecordStore = dyn RecordStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Json,
    Sqlite,
}

/// Opens (creating if absent) the store backing file for `backend`.
pub fn open_store(backend: StoreBackend, path: impl Into<PathBuf>) -> Result<Arc<DynRecordStore>> {
    let path = path.into();
    let store: Arc<DynRecordStore> = match backend {
        StoreBackend::Json => Arc::new(JsonFileStore::open(path)?),
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(path)?),
    };

    Ok(store)
}

pub fn by_hostname(hostname: &str) -> impl Fn(&CatalogEntry) -> bool + Sync + '_ {
    move |entry| entry.hostname == hostname
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::entry::Labels;
    use chrono::{TimeZone, Utc};

    pub(crate) fn entry(hostname: &str, targets: &[&str], labels: &[(&str, &str)]) -> CatalogEntry {
        CatalogEntry {
            hostname: hostname.to_string(),
            labels: labels
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect::<Labels>(),
            targets: targets.iter().map(|target| target.to_string()).collect(),
            expiration: Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    pub(crate) fn exercise_store(store: &DynRecordStore) {
        assert_eq!(store.count().unwrap(), 0);
        assert!(store.all().unwrap().is_empty());
        assert!(store.get(&by_hostname("a")).unwrap().is_none());

        let a = entry("a", &["h1:9090"], &[("env", "prod")]);
        let b = entry("b", &["h2:9090"], &[("env", "prod")]);
        assert_eq!(store.upsert(&a, &by_hostname("a")).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&b, &by_hostname("b")).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.count().unwrap(), 2);

        let mut updated = a.clone();
        updated.targets.push("h3:9090".to_string());
        assert_eq!(
            store.upsert(&updated, &by_hostname("a")).unwrap(),
            UpsertOutcome::Updated
        );

        let all = store.all().unwrap();
        let hostnames: Vec<&str> = all.iter().map(|entry| entry.hostname.as_str()).collect();
        assert_eq!(hostnames, vec!["a", "b"]);
        assert_eq!(store.get(&by_hostname("a")).unwrap(), Some(updated));

        let found = store
            .get(&|entry: &CatalogEntry| entry.targets.contains(&"h2:9090".to_string()))
            .unwrap();
        assert_eq!(found.map(|entry| entry.hostname), Some("b".to_string()));

        assert_eq!(store.remove(&by_hostname("missing")).unwrap(), 0);
        assert_eq!(
            store
                .remove(&|entry: &CatalogEntry| entry.labels.get("env").map(String::as_str) == Some("prod"))
                .unwrap(),
            2
        );
        assert_eq!(store.count().unwrap(), 0);

        let c = entry("c", &[], &[]);
        store.upsert(&c, &by_hostname("c")).unwrap();
        assert_eq!(store.all().unwrap(), vec![c]);
    }

    #[test]
    fn json_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(StoreBackend::Json, dir.path().join("db.json")).unwrap();
        exercise_store(store.as_ref());
    }

    #[test]
    fn sqlite_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(StoreBackend::Sqlite, dir.path().join("db.sqlite3")).unwrap();
        exercise_store(store.as_ref());
    }
}
