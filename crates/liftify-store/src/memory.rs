//! In-memory artifact store for tests
//!
//! Thread-safe via `RwLock`. Versions are numeric counters exposed as strings.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use liftify_core::{LiftifyError, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::store::{
    validate_path, ArtifactStore, ObjectMeta, VersionedObject, WritePrecondition, WriteResult,
};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    version: u64,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: self.data.len() as u64,
            version: self.version.to_string(),
            content_type: Some(self.content_type.clone()),
            last_modified: Some(self.last_modified),
        }
    }
}

/// In-memory store; clones share the same objects
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> LiftifyError {
        LiftifyError::Other("memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    fn identity(&self) -> &str {
        "memory"
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| LiftifyError::NotFound(format!("object not found: {}", path)))
    }

    async fn get_versioned(&self, path: &str) -> Result<Option<VersionedObject>> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        Ok(objects.get(path).map(|o| VersionedObject {
            data: o.data.clone(),
            version: o.version.to_string(),
        }))
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        Ok(objects.get(path).map(|o| o.meta(path)))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        content_type: &str,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        validate_path(path)?;
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => match current {
                Some(obj) if obj.version.to_string() != expected => {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
                None => {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: "0".to_string(),
                    });
                }
                _ => {}
            },
            WritePrecondition::None => {}
        }

        let version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
                version,
                last_modified: Utc::now(),
            },
        );

        Ok(WriteResult::Success {
            version: version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| Self::poisoned())?
            .remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        let mut paths: Vec<String> = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        paths.sort();
        Ok(paths)
    }
}
