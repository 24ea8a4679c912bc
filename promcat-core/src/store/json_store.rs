use super::{EntryPredicate, RecordStore, UpsertOutcome};
use crate::entry::CatalogEntry;
use crate::error::Result;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const DEFAULT_TABLE: &str = "_default";

/// On-disk layout: a `_default` table mapping document ids to entries,
/// `{"_default": {"1": {...}, "2": {...}}}`. Ids only grow, so they double as
/// insertion order. Other top-level tables are carried through untouched.
#[derive(Debug, Default, Serialize)]
struct TableFile {
    #[serde(rename = "_default")]
    entries: BTreeMap<u64, CatalogEntry>,
    #[serde(flatten)]
    other_tables: BTreeMap<String, Value>,
}

impl TableFile {
    fn from_slice(bytes: &[u8]) -> Result<Self> {
        let mut tables: BTreeMap<String, Value> = serde_json::from_slice(bytes)?;
        let documents: BTreeMap<String, CatalogEntry> = match tables.remove(DEFAULT_TABLE) {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(table) => serde_json::from_value(table)?,
        };

        let entries = documents
            .into_iter()
            .map(|(doc_id, entry)| {
                doc_id
                    .parse::<u64>()
                    .map(|doc_id| (doc_id, entry))
                    .map_err(|_| serde::de::Error::custom(format!("invalid document id: {}", doc_id)))
            })
            .collect::<std::result::Result<BTreeMap<_, _>, serde_json::Error>>()?;

        Ok(Self {
            entries,
            other_tables: tables,
        })
    }

    fn next_doc_id(&self) -> u64 {
        self.entries.keys().next_back().map_or(1, |last| last + 1)
    }
}

/// JsonFileStore keeps the whole catalog in one JSON document and replaces it
/// with write-to-temp-then-rename on every mutation.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let store = Self { path };
        if !store.path.exists() {
            store.persist(&TableFile::default())?;
            tracing::info!("Created catalog store {:?}", store.path);
        }

        Ok(store)
    }

    fn load(&self) -> Result<TableFile> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(TableFile::default()),
            Err(error) => return Err(error.into()),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(TableFile::default());
        }

        TableFile::from_slice(&bytes)
    }

    fn persist(&self, table: &TableFile) -> Result<()> {
        let payload = serde_json::to_vec(table)?;
        let tmp_path = self
            .path
            .with_extension(format!("{}.tmp", ulid::Ulid::new()));

        let mut file = fs::File::create(&tmp_path)?;
        let written = file.write_all(&payload).and_then(|_| file.sync_all());
        drop(file);

        if let Err(error) = written.and_then(|_| fs::rename(&tmp_path, &self.path)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(error.into());
        }

        Ok(())
    }
}

impl RecordStore for JsonFileStore {
    fn get(&self, predicate: EntryPredicate<'_>) -> Result<Option<CatalogEntry>> {
        let table = self.load()?;
        Ok(table.entries.into_values().find(|entry| predicate(entry)))
    }

    fn upsert(&self, entry: &CatalogEntry, key: EntryPredicate<'_>) -> Result<UpsertOutcome> {
        let mut table = self.load()?;

        let existing = table
            .entries
            .iter()
            .find(|(_, current)| key(current))
            .map(|(doc_id, _)| *doc_id);

        let outcome = match existing {
            Some(doc_id) => {
                table.entries.insert(doc_id, entry.clone());
                UpsertOutcome::Updated
            }
            None => {
                let doc_id = table.next_doc_id();
                table.entries.insert(doc_id, entry.clone());
                UpsertOutcome::Inserted
            }
        };

        self.persist(&table)?;
        Ok(outcome)
    }

    fn remove(&self, predicate: EntryPredicate<'_>) -> Result<usize> {
        let mut table = self.load()?;
        let before = table.entries.len();
        table.entries.retain(|_, entry| !predicate(entry));

        let removed = before - table.entries.len();
        if removed > 0 {
            self.persist(&table)?;
        }

        Ok(removed)
    }

    fn all(&self) -> Result<Vec<CatalogEntry>> {
        Ok(self.load()?.entries.into_values().collect())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.load()?.entries.len())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::by_hostname;
    use crate::store::tests::entry;

    #[test]
    fn reads_existing_document_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        fs::write(
            &path,
            r#"{"_default": {
                "2": {"hostname": "b", "labels": {"env": "prod"}, "targets": ["h2:9100"], "expiration": "2030-01-01T00:00:00.000001"},
                "10": {"hostname": "c", "labels": {}, "targets": [], "expiration": "2030-01-01T00:00:00"},
                "1": {"hostname": "a", "labels": null, "targets": ["h1:9100"], "expiration": "2030-01-01T00:00:00.5"}
            }}"#,
        )
        .unwrap();

        let store = JsonFileStore::open(path).unwrap();
        let hostnames: Vec<String> = store
            .all()
            .unwrap()
            .into_iter()
            .map(|entry| entry.hostname)
            .collect();
        assert_eq!(hostnames, vec!["a", "b", "c"]);

        store
            .upsert(&entry("d", &[], &[("k", "v")]), &by_hostname("d"))
            .unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["_default"]["11"]["hostname"], "d");
        assert_eq!(raw["_default"]["1"]["expiration"], "2030-01-01T00:00:00.500000");
    }

    #[test]
    fn open_creates_empty_table_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("db.json");

        let store = JsonFileStore::open(path.clone()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), r#"{"_default":{}}"#);

        store
            .upsert(&entry("a", &["h1:9100"], &[]), &by_hostname("a"))
            .unwrap();
        store.remove(&by_hostname("a")).unwrap();

        let names: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|item| item.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("db.json")]);
    }

    #[test]
    fn rewrite_keeps_other_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        fs::write(
            &path,
            r#"{"_default": {}, "audit": {"1": {"note": "keep me"}}}"#,
        )
        .unwrap();

        let store = JsonFileStore::open(path.clone()).unwrap();
        store
            .upsert(&entry("a", &["h1:9100"], &[]), &by_hostname("a"))
            .unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["audit"]["1"]["note"], "keep me");
        assert_eq!(raw["_default"]["1"]["hostname"], "a");
    }

    #[test]
    fn empty_file_reads_as_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        fs::write(&path, "").unwrap();

        let store = JsonFileStore::open(path).unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn corrupt_file_surfaces_as_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        fs::write(&path, "{not json").unwrap();

        let store = JsonFileStore::open(path).unwrap();
        let error = store.all().unwrap_err();
        assert!(error.is_storage_unavailable());
    }
}
