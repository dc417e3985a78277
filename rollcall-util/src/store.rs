use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tracing::trace;

use super::fs::safe_write_all;

/// A filesystem backed store
///
/// This is a very simple mechanism for persisting data on disk.
/// Each document is a JSON file named after its key; writes are atomic
/// (the document is either fully replaced or keeps its prior value) but
/// there is no coordination between concurrent writers. Callers are
/// expected to have a single owner per collection.
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

    #[error("path must not have any `..` segments")]
    InvalidPath,
}

impl Store {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    // Constructs a full path for a given collection path and document name.
    fn with_root(&self, path: &Path) -> Result<PathBuf, StoreError> {
        let doc_path = path.strip_prefix("/").unwrap_or(path);

        // Reject any path with ".." or other non-normal components
        for component in doc_path.components() {
            if !matches!(component, std::path::Component::Normal(_)) {
                return Err(StoreError::InvalidPath);
            }
        }
        Ok(self.root.join(doc_path))
    }

    fn doc_path(&self, path: &Path, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
            return Err(StoreError::InvalidPath);
        }
        Ok(self.with_root(path)?.join(key).with_extension("json"))
    }

    /// Create or update a document at the specified location and with the given
    /// key
    ///
    /// Note that while writes are atomic, concurrent usage of a store may result in
    /// data-loss. Same with two different stores on the same base path.
    pub async fn write<P: AsRef<Path>, V: Serialize>(
        &self,
        path: P,
        key: &str,
        value: &V,
    ) -> Result<(), StoreError> {
        let parent = self.with_root(path.as_ref())?;

        // ensure the parent exists, this will fail if the parent
        // exists but is not a directory
        fs::create_dir_all(parent.as_path()).await?;

        let full_path = self.doc_path(path.as_ref(), key)?;
        let buf = serde_json::to_vec(&value)?;
        trace!("writing {}", full_path.display());
        tokio::task::spawn_blocking(move || safe_write_all(full_path, &buf))
            .await
            .map_err(io::Error::other)??;
        Ok(())
    }

    /// Read a document from the specified location
    pub async fn read<P: AsRef<Path>, V: DeserializeOwned>(
        &self,
        path: P,
        key: &str,
    ) -> Result<Option<V>, StoreError> {
        let full_path = self.doc_path(path.as_ref(), key)?;
        trace!("reading {}", full_path.display());

        match fs::read_to_string(&full_path).await {
            Ok(contents) => {
                let value = serde_json::from_str::<V>(&contents)?;
                Ok(Some(value))
            }
            Err(err) => match err.kind() {
                // We don't have a stored document
                io::ErrorKind::NotFound => Ok(None),

                // We have a document but failed to load it
                _ => Err(err.into()),
            },
        }
    }

    /// List the keys of all documents at the given location.
    ///
    /// Only `.json` documents are returned, with the extension removed.
    /// Leftovers from interrupted writes are skipped.
    pub async fn list<P: AsRef<Path>>(&self, path: P) -> Result<Vec<String>, StoreError> {
        let full_path = self.with_root(path.as_ref())?;
        let mut dir_entries = match fs::read_dir(full_path).await {
            Ok(entries) => entries,
            Err(err) => match err.kind() {
                io::ErrorKind::NotFound => return Ok(Vec::new()),
                _ => return Err(err.into()),
            },
        };

        let mut keys = Vec::new();
        while let Some(entry) = dir_entries.next_entry().await? {
            // ignore non-unicode names
            if let Ok(name) = entry.file_name().into_string()
                && let Some(key) = name.strip_suffix(".json")
                && !key.is_empty()
            {
                keys.push(key.to_owned());
            }
        }
        keys.sort();

        Ok(keys)
    }

    /// Delete the document at the given location.
    ///
    /// This operation is idempotent - deleting a non-existent document succeeds.
    pub async fn delete<P: AsRef<Path>>(&self, path: P, key: &str) -> Result<(), StoreError> {
        let full_path = self.doc_path(path.as_ref(), key)?;
        trace!("removing {}", full_path.display());
        match fs::remove_file(full_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use tempfile::tempdir;

    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Doc {
        name: String,
    }

    #[tokio::test]
    async fn test_writes_and_reads_documents() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());

        let doc = Doc {
            name: "LT1".into(),
        };
        store.write("/rooms", "lt1", &doc).await.unwrap();

        let read: Option<Doc> = store.read("/rooms", "lt1").await.unwrap();
        assert_eq!(read, Some(doc));
    }

    #[tokio::test]
    async fn test_returns_none_for_missing_documents() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());

        let read: Option<Doc> = store.read("/", "nothing").await.unwrap();
        assert_eq!(read, None);
    }

    #[tokio::test]
    async fn test_lists_only_json_documents() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());

        store.write("/events", "b", &Doc { name: "b".into() }).await.unwrap();
        store.write("/events", "a", &Doc { name: "a".into() }).await.unwrap();

        // simulate an interrupted write
        std::fs::write(dir.path().join("events").join("c.sync-xyz123"), b"{").unwrap();

        let keys = store.list("/events").await.unwrap();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_lists_nothing_for_a_missing_collection() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());

        assert!(store.list("/events").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deletes_are_idempotent() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());

        store.write("/", "doc", &Doc { name: "x".into() }).await.unwrap();
        store.delete("/", "doc").await.unwrap();
        store.delete("/", "doc").await.unwrap();

        let read: Option<Doc> = store.read("/", "doc").await.unwrap();
        assert_eq!(read, None);
    }

    #[tokio::test]
    async fn test_rejects_paths_escaping_the_root() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());

        let res = store.write("/../outside", "doc", &Doc { name: "x".into() }).await;
        assert!(matches!(res, Err(StoreError::InvalidPath)));

        let res = store.write("/", "../doc", &Doc { name: "x".into() }).await;
        assert!(matches!(res, Err(StoreError::InvalidPath)));
    }
}
