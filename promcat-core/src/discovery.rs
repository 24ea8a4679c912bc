use crate::entry::DiscoveryTarget;
use crate::error::Result;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Writes the file-based discovery document: a JSON array of
/// `{labels, targets}` objects. The file is replaced atomically so pollers
/// never read a half-written array.
#[derive(Debug, Clone)]
pub struct DiscoveryWriter {
    path: PathBuf,
}

impl DiscoveryWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&self, targets: &[DiscoveryTarget]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let payload = serde_json::to_vec(targets)?;
        let tmp_path = self
            .path
            .with_extension(format!("{}.tmp", ulid::Ulid::new()));

        let mut file = fs::File::create(&tmp_path).await?;
        if let Err(error) = write_all_synced(&mut file, &payload).await {
            drop(file);
            let _ = fs::remove_file(&tmp_path).await;
            return Err(error.into());
        }
        drop(file);

        if let Err(error) = fs::rename(&tmp_path, &self.path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(error.into());
        }

        tracing::debug!(
            "Wrote {} discovery groups to {:?}",
            targets.len(),
            self.path
        );
        Ok(())
    }
}

async fn write_all_synced(file: &mut fs::File, payload: &[u8]) -> std::io::Result<()> {
    file.write_all(payload).await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn writes_json_array_of_groups() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiscoveryWriter::new(dir.path().join("sd").join("file_sd_config.json"));

        writer.write(&[]).await.unwrap();
        assert_eq!(fs::read_to_string(writer.path()).await.unwrap(), "[]");

        let group = DiscoveryTarget {
            labels: BTreeMap::from([("env".to_string(), "prod".to_string())]),
            targets: vec!["h1:9100".to_string()],
        };
        writer.write(&[group]).await.unwrap();

        let raw = fs::read_to_string(writer.path()).await.unwrap();
        assert_eq!(raw, r#"[{"labels":{"env":"prod"},"targets":["h1:9100"]}]"#);

        let mut names = Vec::new();
        let mut dir_entries = fs::read_dir(writer.path().parent().unwrap()).await.unwrap();
        while let Some(item) = dir_entries.next_entry().await.unwrap() {
            names.push(item.file_name());
        }
        assert_eq!(names.len(), 1);
    }
}
