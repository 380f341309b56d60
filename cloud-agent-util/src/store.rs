use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::trace;

use crate::fs::write_to_file;

/// A directory tree of per-provider files
///
/// Every provider owns one sub-directory under the store root. Files are
/// either JSON documents or single-value plaintext files. Writes are atomic
/// but there is no locking, concurrent writers to the same file race.
#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("path must name an entry below the store root")]
    InvalidPath,
}

impl Store {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn with_root(&self, path: &Path) -> Result<PathBuf, StoreError> {
        let rel_path = path.strip_prefix("/").unwrap_or(path);

        // provider names come from the command line
        for component in rel_path.components() {
            if !matches!(component, Component::Normal(_)) {
                return Err(StoreError::InvalidPath);
            }
        }
        Ok(self.root.join(rel_path))
    }

    /// Encode `value` as pretty JSON and write it to `path`
    pub async fn write<P: AsRef<Path>, V: Serialize>(
        &self,
        path: P,
        value: &V,
    ) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(value)?;
        self.write_text(path, &contents).await
    }

    /// Read the file at `path` as text
    pub async fn read_text<P: AsRef<Path>>(&self, path: P) -> Result<Option<String>, StoreError> {
        let full_path = self.with_root(path.as_ref())?;
        trace!("reading {}", full_path.display());

        match fs::read_to_string(&full_path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Atomically replace the file at `path`, creating parent directories
    pub async fn write_text<P: AsRef<Path>>(&self, path: P, contents: &str) -> Result<(), StoreError> {
        let full_path = self.with_root(path.as_ref())?;
        trace!("writing {}", full_path.display());
        write_to_file(full_path, contents).await?;
        Ok(())
    }

    /// List the names of the sub-directories at `path`, sorted.
    ///
    /// A missing location lists as empty. Plain files and non-unicode names
    /// are skipped.
    pub async fn list_dirs<P: AsRef<Path>>(&self, path: P) -> Result<Vec<String>, StoreError> {
        let full_path = self.with_root(path.as_ref())?;
        let mut dir_entries = match fs::read_dir(full_path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = dir_entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();

        Ok(names)
    }

    /// Delete everything at the given location.
    ///
    /// This operation is idempotent - deleting a non-existent path succeeds.
    pub async fn delete_all<P: AsRef<Path>>(&self, path: P) -> Result<(), StoreError> {
        let full_path = self.with_root(path.as_ref())?;
        if full_path == self.root {
            return Err(StoreError::InvalidPath);
        }
        trace!("removing {}", full_path.display());
        match fs::remove_dir_all(full_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[tokio::test]
    async fn it_reads_missing_files_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        assert!(store.read_text("nope/link.conf").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn it_writes_and_reads_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let mut doc = BTreeMap::new();
        doc.insert("CLOUD_BASE_URL".to_owned(), "https://example.com".to_owned());
        store.write("example/wb-cloud-agent.conf", &doc).await.unwrap();

        let text = store
            .read_text("example/wb-cloud-agent.conf")
            .await
            .unwrap()
            .unwrap();
        let read: BTreeMap<String, String> = serde_json::from_str(&text).unwrap();
        assert_eq!(read, doc);
    }

    #[tokio::test]
    async fn it_lists_only_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        store.write_text("b/file", "").await.unwrap();
        store.write_text("a/file", "").await.unwrap();
        store.write_text("stray.conf", "").await.unwrap();

        assert_eq!(store.list_dirs("/").await.unwrap(), vec!["a", "b"]);
        assert!(store.list_dirs("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn it_deletes_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        store.write_text("a/file", "x").await.unwrap();
        store.delete_all("a").await.unwrap();
        store.delete_all("a").await.unwrap();

        assert!(store.list_dirs("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn it_rejects_parent_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let result = store.delete_all("../etc").await;
        assert!(matches!(result, Err(StoreError::InvalidPath)));
    }
}
