use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use super::{validate_key, ExportSink, FileStorage, StorageError};

const PART_SUFFIX: &str = ".part";

/// Stores artifacts as files under a root directory.
///
/// In-progress writes go to `<key>.part` and are renamed into place on commit.
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn open_for_write(&self, key: &str) -> Result<Box<dyn ExportSink>, StorageError> {
        let final_path = self.path_for(key)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut part_name = final_path.clone().into_os_string();
        part_name.push(PART_SUFFIX);
        let part_path = PathBuf::from(part_name);

        let file = fs::File::create(&part_path).await?;
        debug!(key, path = %part_path.display(), "opened export sink");

        Ok(Box::new(LocalSink {
            file: Some(BufWriter::new(file)),
            part_path,
            final_path,
            written: 0,
        }))
    }

    async fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let path = self.path_for(key)?;
        if fs::try_exists(&path).await? {
            Ok(path)
        } else {
            Err(StorageError::NotFound(key.to_string()))
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        Ok(fs::try_exists(&path).await?)
    }
}

struct LocalSink {
    /// `None` once committed or aborted.
    file: Option<BufWriter<fs::File>>,
    part_path: PathBuf,
    final_path: PathBuf,
    written: u64,
}

#[async_trait]
impl ExportSink for LocalSink {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        let file = self.file.as_mut().ok_or_else(|| {
            StorageError::Io(std::io::Error::other("sink already finished"))
        })?;
        file.write_all(bytes).await?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<u64, StorageError> {
        let mut file = self.file.take().ok_or_else(|| {
            StorageError::Io(std::io::Error::other("sink already finished"))
        })?;
        let result = async {
            file.flush().await?;
            file.get_ref().sync_all().await?;
            drop(file);
            fs::rename(&self.part_path, &self.final_path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&self.part_path).await;
            return Err(e.into());
        }
        Ok(self.written)
    }

    async fn abort(mut self: Box<Self>) -> Result<(), StorageError> {
        drop(self.file.take());
        match fs::remove_file(&self.part_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LocalSink {
    fn drop(&mut self) {
        // Dropped mid-write (panic or cancelled future): leave no partial file.
        if self.file.take().is_some() {
            if let Err(e) = std::fs::remove_file(&self.part_path) {
                warn!(path = %self.part_path.display(), error = %e, "failed to remove partial export");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_publishes_under_key() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFileStorage::new(dir.path());

        let mut sink = storage.open_for_write("exports/a.csv").await.unwrap();
        sink.write(b"hello;").await.unwrap();
        sink.write(b"world\r\n").await.unwrap();
        assert!(!storage.exists("exports/a.csv").await.unwrap());

        let size = sink.commit().await.unwrap();
        assert_eq!(size, 13);

        let path = storage.resolve("exports/a.csv").await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"hello;world\r\n");
        assert!(!dir.path().join("exports/a.csv.part").exists());
    }

    #[tokio::test]
    async fn abort_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFileStorage::new(dir.path());

        let mut sink = storage.open_for_write("exports/b.csv").await.unwrap();
        sink.write(b"partial").await.unwrap();
        sink.abort().await.unwrap();

        assert!(matches!(
            storage.resolve("exports/b.csv").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(!dir.path().join("exports/b.csv.part").exists());
    }

    #[tokio::test]
    async fn dropped_sink_is_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFileStorage::new(dir.path());

        let mut sink = storage.open_for_write("c.csv").await.unwrap();
        sink.write(b"x").await.unwrap();
        drop(sink);

        assert!(!dir.path().join("c.csv.part").exists());
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_keys_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFileStorage::new(dir.path());

        storage.delete("missing.csv").await.unwrap();
        assert!(matches!(
            storage.open_for_write("../escape.csv").await,
            Err(StorageError::InvalidKey(_))
        ));
    }
}
