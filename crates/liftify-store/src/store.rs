//! Artifact store abstraction
//!
//! The contract follows cloud object storage semantics:
//! - Conditional writes with preconditions (compare-and-swap on a version token)
//! - Idempotent deletes
//! - Prefix listing
//!
//! The version token is an opaque `String`; each backend decides what it means.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use liftify_core::{ArtifactRef, LiftifyError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Content type for JSON documents
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// Content type for log files and generated code
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

/// Precondition for conditional writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if the object does not exist
    DoesNotExist,
    /// Write only if the object's version matches the given token
    MatchesVersion(String),
    /// Write unconditionally
    None,
}

/// Result of a conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded, returns the new version token
    Success { version: String },
    /// Precondition failed, returns the current version token
    PreconditionFailed { current_version: String },
}

impl WriteResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Metadata about a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub path: String,
    pub size: u64,
    pub version: String,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Object contents together with the version they were read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedObject {
    pub data: Bytes,
    pub version: String,
}

/// Object storage used for every artifact and all cross-stage state
#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    /// Identity recorded in artifact references
    fn identity(&self) -> &str;

    /// Reads an entire object.
    ///
    /// Returns `LiftifyError::NotFound` if the object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Reads an object and the version it was read at, `None` if absent
    async fn get_versioned(&self, path: &str) -> Result<Option<VersionedObject>>;

    /// Object metadata without the contents, `None` if absent
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;

    /// Writes with a precondition.
    ///
    /// A failed precondition is a normal result, never an error.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        content_type: &str,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object. Succeeds if it doesn't exist.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Paths starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Reference to `path` in this store
    fn artifact_ref(&self, path: &str) -> ArtifactRef {
        ArtifactRef::new(self.identity(), path)
    }

    /// Unconditional write returning a reference to the written object
    async fn write(&self, path: &str, data: Bytes, content_type: &str) -> Result<ArtifactRef> {
        match self
            .put(path, data, content_type, WritePrecondition::None)
            .await?
        {
            WriteResult::Success { .. } => Ok(self.artifact_ref(path)),
            WriteResult::PreconditionFailed { current_version } => Err(LiftifyError::Other(
                format!(
                    "unconditional write to {} rejected at version {}",
                    path, current_version
                ),
            )),
        }
    }

    /// Reads an object as UTF-8 text, `None` if absent
    async fn get_text(&self, path: &str) -> Result<Option<String>> {
        match self.get(path).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(LiftifyError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Reads and decodes a JSON object with its version, `None` if absent
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn ArtifactStore,
    path: &str,
) -> Result<Option<(T, String)>> {
    match store.get_versioned(path).await? {
        Some(object) => {
            let value = serde_json::from_slice(&object.data)?;
            Ok(Some((value, object.version)))
        }
        None => Ok(None),
    }
}

/// Encodes and writes a JSON object under a precondition
pub async fn put_json<T: Serialize>(
    store: &dyn ArtifactStore,
    path: &str,
    value: &T,
    precondition: WritePrecondition,
) -> Result<WriteResult> {
    let data = serde_json::to_vec_pretty(value)?;
    store
        .put(path, Bytes::from(data), CONTENT_TYPE_JSON, precondition)
        .await
}

/// Rejects absolute paths and relative components
pub(crate) fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() || path.starts_with('/') {
        return Err(LiftifyError::InputShape(format!(
            "invalid artifact path '{}'",
            path
        )));
    }
    if path
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(LiftifyError::InputShape(format!(
            "invalid artifact path '{}'",
            path
        )));
    }
    Ok(())
}
