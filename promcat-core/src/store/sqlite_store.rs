use super::{EntryPredicate, RecordStore, UpsertOutcome};
use crate::entry::{CatalogEntry, Labels, format_expiration, parse_expiration};
use crate::error::Result;
use rusqlite::{Connection, Transaction, params};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// SqliteStore keeps one row per entry; labels and targets are JSON text.
/// `doc_id` gives insertion order.
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { db_path };
        store.init_schema()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS catalog_entries (
                doc_id INTEGER PRIMARY KEY AUTOINCREMENT,
                hostname TEXT NOT NULL,
                labels TEXT NOT NULL,
                targets TEXT NOT NULL,
                expiration TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_catalog_entries_hostname ON catalog_entries(hostname)",
            [],
        )?;

        Ok(())
    }

    fn load_rows(conn: &Connection) -> Result<Vec<(i64, CatalogEntry)>> {
        let mut stmt = conn.prepare(
            "SELECT doc_id, hostname, labels, targets, expiration
             FROM catalog_entries ORDER BY doc_id",
        )?;

        let rows = stmt.query_map([], |row| {
            let doc_id: i64 = row.get(0)?;
            let hostname: String = row.get(1)?;
            let labels_json: String = row.get(2)?;
            let targets_json: String = row.get(3)?;
            let expiration: String = row.get(4)?;

            let labels: Labels = serde_json::from_str(&labels_json)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            let targets: Vec<String> = serde_json::from_str(&targets_json)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            let expiration = parse_expiration(&expiration).ok_or_else(|| {
                rusqlite::Error::ToSqlConversionFailure(
                    format!("invalid expiration timestamp: {}", expiration).into(),
                )
            })?;

            Ok((
                doc_id,
                CatalogEntry {
                    hostname,
                    labels,
                    targets,
                    expiration,
                },
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }

        Ok(entries)
    }

    fn write_row(tx: &Transaction<'_>, doc_id: Option<i64>, entry: &CatalogEntry) -> Result<()> {
        let labels_json = serde_json::to_string(&entry.labels)?;
        let targets_json = serde_json::to_string(&entry.targets)?;
        let expiration = format_expiration(&entry.expiration);

        match doc_id {
            Some(doc_id) => {
                tx.execute(
                    "UPDATE catalog_entries
                     SET hostname = ?1, labels = ?2, targets = ?3, expiration = ?4
                     WHERE doc_id = ?5",
                    params![entry.hostname, labels_json, targets_json, expiration, doc_id],
                )?;
            }
            None => {
                tx.execute(
                    "INSERT INTO catalog_entries (hostname, labels, targets, expiration)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![entry.hostname, labels_json, targets_json, expiration],
                )?;
            }
        }

        Ok(())
    }
}

impl RecordStore for SqliteStore {
    fn get(&self, predicate: EntryPredicate<'_>) -> Result<Option<CatalogEntry>> {
        let conn = self.get_conn()?;
        Ok(Self::load_rows(&conn)?
            .into_iter()
            .map(|(_, entry)| entry)
            .find(|entry| predicate(entry)))
    }

    fn upsert(&self, entry: &CatalogEntry, key: EntryPredicate<'_>) -> Result<UpsertOutcome> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let existing = Self::load_rows(&tx)?
            .into_iter()
            .find(|(_, current)| key(current))
            .map(|(doc_id, _)| doc_id);

        Self::write_row(&tx, existing, entry)?;
        tx.commit()?;

        Ok(match existing {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        })
    }

    fn remove(&self, predicate: EntryPredicate<'_>) -> Result<usize> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let doomed: Vec<i64> = Self::load_rows(&tx)?
            .into_iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(doc_id, _)| doc_id)
            .collect();

        for doc_id in &doomed {
            tx.execute("DELETE FROM catalog_entries WHERE doc_id = ?1", [doc_id])?;
        }
        tx.commit()?;

        Ok(doomed.len())
    }

    fn all(&self) -> Result<Vec<CatalogEntry>> {
        let conn = self.get_conn()?;
        Ok(Self::load_rows(&conn)?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect())
    }

    fn count(&self) -> Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM catalog_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn path(&self) -> &Path {
        &self.db_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::by_hostname;
    use crate::store::tests::entry;

    #[test]
    fn reopen_keeps_entries_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.sqlite3");

        {
            let store = SqliteStore::open(path.clone()).unwrap();
            store
                .upsert(&entry("b", &["h2:9100"], &[]), &by_hostname("b"))
                .unwrap();
            store
                .upsert(&entry("a", &["h1:9100"], &[("env", "prod")]), &by_hostname("a"))
                .unwrap();
        }

        let store = SqliteStore::open(path).unwrap();
        let hostnames: Vec<String> = store
            .all()
            .unwrap()
            .into_iter()
            .map(|entry| entry.hostname)
            .collect();
        assert_eq!(hostnames, vec!["b", "a"]);
        assert_eq!(store.count().unwrap(), 2);
    }
}
