use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::document::Document;
use crate::error::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Contract between the pipeline core and the underlying document store.
///
/// Implementations must make `replace_all` atomic and linearizable with
/// respect to `read_all` on the same collection: a reader sees either the
/// previous contents or the complete new contents. A failed replace must
/// leave the previous contents (or absence) untouched.
pub trait DocumentStore: Send + Sync {
    /// Every document of `collection`, in storage order.
    ///
    /// Fails with [`StoreError::CollectionNotFound`] when the collection does
    /// not exist; an existing empty collection yields an empty vector.
    fn read_all(&self, collection: &str) -> StoreResult<Vec<Document>>;

    /// Replace the contents of `collection`, creating it if absent.
    fn replace_all(&self, collection: &str, docs: Vec<Document>) -> StoreResult<()>;

    /// Names of all existing collections, sorted.
    fn list_collections(&self) -> StoreResult<Vec<String>>;

    /// Remove a collection. Returns false if it did not exist.
    fn drop_collection(&self, collection: &str) -> StoreResult<bool>;
}

impl<S: DocumentStore + ?Sized> DocumentStore for Arc<S> {
    fn read_all(&self, collection: &str) -> StoreResult<Vec<Document>> {
        (**self).read_all(collection)
    }

    fn replace_all(&self, collection: &str, docs: Vec<Document>) -> StoreResult<()> {
        (**self).replace_all(collection, docs)
    }

    fn list_collections(&self) -> StoreResult<Vec<String>> {
        (**self).list_collections()
    }

    fn drop_collection(&self, collection: &str) -> StoreResult<bool> {
        (**self).drop_collection(collection)
    }
}

pub(crate) fn validate_name(name: &str) -> StoreResult<()> {
    if name.is_empty() || name.starts_with('$') {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// In-process store.
///
/// Each collection is an immutable `Arc<Vec<Document>>`; a replace builds the
/// new vector outside the lock and swaps the pointer under the write lock, so
/// readers never observe a partial collection.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Arc<Vec<Document>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in `collection`, if it exists.
    pub fn count(&self, collection: &str) -> Option<usize> {
        let cols = self.collections.read().unwrap();
        cols.get(collection).map(|docs| docs.len())
    }
}

impl DocumentStore for MemoryStore {
    fn read_all(&self, collection: &str) -> StoreResult<Vec<Document>> {
        let snapshot = {
            let cols = self.collections.read().unwrap();
            cols.get(collection)
                .map(Arc::clone)
                .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))?
        };
        Ok(snapshot.as_ref().clone())
    }

    fn replace_all(&self, collection: &str, docs: Vec<Document>) -> StoreResult<()> {
        validate_name(collection)?;
        let count = docs.len();
        let fresh = Arc::new(docs);
        let mut cols = self.collections.write().unwrap();
        cols.insert(collection.to_string(), fresh);
        drop(cols);
        debug!(collection, count, "replaced collection");
        Ok(())
    }

    fn list_collections(&self) -> StoreResult<Vec<String>> {
        let cols = self.collections.read().unwrap();
        let mut names: Vec<String> = cols.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn drop_collection(&self, collection: &str) -> StoreResult<bool> {
        let mut cols = self.collections.write().unwrap();
        Ok(cols.remove(collection).is_some())
    }
}
