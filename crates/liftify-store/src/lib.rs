//! # liftify-store
//!
//! Object storage for pipeline artifacts and cross-stage state.
//!
//! This crate provides:
//! - The `ArtifactStore` contract (get/put/list with conditional writes)
//! - An in-memory backend for tests
//! - A local-directory backend

mod fs;
mod memory;
mod store;

pub use fs::FsStore;
pub use memory::MemoryStore;
pub use store::{
    get_json, put_json, ArtifactStore, ObjectMeta, VersionedObject, WritePrecondition,
    WriteResult, CONTENT_TYPE_JSON, CONTENT_TYPE_TEXT,
};
