//! Local-directory artifact store
//!
//! Objects are plain files under a root directory. The version token is the
//! hex SHA-256 of the contents. Writes go to a temporary file that is renamed
//! into place. Every mutation holds an exclusive `flock` on `{root}/.store.lock`
//! across the read-compare-rename, so conditional writes hold between
//! processes sharing the directory, not just between tasks.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use liftify_core::{LiftifyError, Result};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::store::{
    validate_path, ArtifactStore, ObjectMeta, VersionedObject, WritePrecondition, WriteResult,
};

const TMP_MARKER: &str = ".tmp-";
const LOCK_FILE: &str = ".store.lock";

/// Exclusive lock on the store directory; released on drop
struct StoreLock(std::fs::File);

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

/// Artifact store rooted at a local directory
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
    identity: String,
    write_lock: Mutex<()>,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let identity = format!("file:{}", root.display());
        Self {
            root,
            identity,
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        validate_path(path)?;
        Ok(self.root.join(path))
    }

    /// Block (off the runtime) until this handle holds the directory lock
    async fn lock(&self) -> Result<StoreLock> {
        fs::create_dir_all(&self.root).await?;
        let path = self.root.join(LOCK_FILE);
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| LiftifyError::Other(format!("store lock task failed: {}", e)))??;
        Ok(StoreLock(file))
    }

    async fn read_optional(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let file = self.resolve(path)?;
        match fs::read(&file).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn content_version(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[async_trait]
impl ArtifactStore for FsStore {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        self.read_optional(path)
            .await?
            .map(Bytes::from)
            .ok_or_else(|| LiftifyError::NotFound(format!("object not found: {}", path)))
    }

    async fn get_versioned(&self, path: &str) -> Result<Option<VersionedObject>> {
        Ok(self.read_optional(path).await?.map(|data| VersionedObject {
            version: content_version(&data),
            data: Bytes::from(data),
        }))
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let file = self.resolve(path)?;
        let metadata = match fs::metadata(&file).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let data = match self.read_optional(path).await? {
            Some(data) => data,
            None => return Ok(None),
        };

        Ok(Some(ObjectMeta {
            path: path.to_string(),
            size: metadata.len(),
            version: content_version(&data),
            content_type: None,
            last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        }))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        _content_type: &str,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let file = self.resolve(path)?;
        let _guard = self.write_lock.lock().await;
        let _lock = self.lock().await?;

        let current = self.read_optional(path).await?.map(|d| content_version(&d));
        match (&precondition, &current) {
            (WritePrecondition::DoesNotExist, Some(version)) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: version.clone(),
                });
            }
            (WritePrecondition::MatchesVersion(expected), Some(version)) if expected != version => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: version.clone(),
                });
            }
            (WritePrecondition::MatchesVersion(_), None) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: "0".to_string(),
                });
            }
            _ => {}
        }

        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = file.with_file_name(format!(
            "{}{}{}",
            file_name,
            TMP_MARKER,
            uuid::Uuid::new_v4()
        ));
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &file).await?;

        debug!("Wrote {} ({} bytes)", path, data.len());
        Ok(WriteResult::Success {
            version: content_version(&data),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let file = self.resolve(path)?;
        let _guard = self.write_lock.lock().await;
        let _lock = self.lock().await?;
        match fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let entry_path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(entry_path);
                    continue;
                }
                let Ok(relative) = entry_path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.contains(TMP_MARKER) || key == LOCK_FILE {
                    continue;
                }
                if key.starts_with(prefix) {
                    paths.push(key);
                }
            }
        }

        paths.sort();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_roundtrip_and_versions() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());

        let first = store
            .put("acme/shop/a.txt", Bytes::from("one"), "text/plain", WritePrecondition::None)
            .await
            .unwrap();
        let WriteResult::Success { version } = first else {
            panic!("expected success");
        };
        assert_eq!(store.get("acme/shop/a.txt").await.unwrap(), Bytes::from("one"));

        let versioned = store.get_versioned("acme/shop/a.txt").await.unwrap().unwrap();
        assert_eq!(versioned.version, version);
    }

    #[tokio::test]
    async fn test_conditional_writes() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());

        store
            .put("k.json", Bytes::from("{}"), "application/json", WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        let again = store
            .put("k.json", Bytes::from("{}"), "application/json", WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        assert!(!again.is_success());

        let stale = store
            .put(
                "k.json",
                Bytes::from("{\"a\":1}"),
                "application/json",
                WritePrecondition::MatchesVersion("not-a-version".to_string()),
            )
            .await
            .unwrap();
        assert!(!stale.is_success());
        assert_eq!(store.get("k.json").await.unwrap(), Bytes::from("{}"));
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());
        store.write("_continuations/job-1.json", Bytes::from("{}"), "application/json").await.unwrap();
        store.write("acme/shop/20250101/run/state.json", Bytes::from("{}"), "application/json").await.unwrap();

        assert_eq!(
            store.list("_continuations/").await.unwrap(),
            vec!["_continuations/job-1.json"]
        );
        assert_eq!(store.list("").await.unwrap().len(), 2);

        store.delete("_continuations/job-1.json").await.unwrap();
        store.delete("_continuations/job-1.json").await.unwrap();
        assert!(store.list("_continuations/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());
        assert!(store.get("../outside").await.is_err());
    }

    #[test]
    fn test_separate_instances_commit_once() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let seed = FsStore::new(&root);
        let runtime = tokio::runtime::Runtime::new().unwrap();

        for trial in 0..25 {
            let path = format!("acme/shop/20250101/run/state-{}.json", trial);
            let WriteResult::Success { version } = runtime
                .block_on(seed.put(&path, Bytes::from("v0"), "application/json", WritePrecondition::None))
                .unwrap()
            else {
                panic!("seed write failed");
            };

            let barrier = std::sync::Arc::new(std::sync::Barrier::new(2));
            let writers: Vec<_> = (0..2)
                .map(|writer| {
                    let root = root.clone();
                    let path = path.clone();
                    let version = version.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        let store = FsStore::new(root);
                        let runtime = tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                            .unwrap();
                        barrier.wait();
                        runtime
                            .block_on(store.put(
                                &path,
                                Bytes::from(format!("writer-{}", writer)),
                                "application/json",
                                WritePrecondition::MatchesVersion(version),
                            ))
                            .unwrap()
                            .is_success()
                    })
                })
                .collect();

            let wins = writers
                .into_iter()
                .map(|w| w.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(wins, 1, "trial {}", trial);
        }
    }

    #[tokio::test]
    async fn test_lock_file_is_not_listed() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());
        store.write("a.txt", Bytes::from("a"), "text/plain").await.unwrap();
        assert!(dir.path().join(LOCK_FILE).exists());
        assert_eq!(store.list("").await.unwrap(), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn test_list_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path().join("not-created"));
        assert!(store.list("").await.unwrap().is_empty());
    }
}
