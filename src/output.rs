use tracing::{info, warn};

use crate::document::Document;
use crate::error::{Error, Result};
use crate::store::DocumentStore;

/// Atomically replace `to` with `docs` through the store's replace primitive.
///
/// `position` is the `$out` stage's index, used for error reporting. Returns
/// the number of documents written.
pub fn materialize(
    position: usize,
    docs: Vec<Document>,
    to: &str,
    store: &dyn DocumentStore,
) -> Result<u64> {
    let count = docs.len() as u64;
    match store.replace_all(to, docs) {
        Ok(()) => {
            info!(collection = to, count, "materialized pipeline output");
            Ok(count)
        }
        Err(source) => {
            warn!(collection = to, stage = position, error = %source, "materialization failed");
            Err(Error::MaterializationFailed {
                stage: position,
                collection: to.to_string(),
                source,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::into_document;
    use crate::error::StoreError;
    use crate::store::{MemoryStore, StoreResult};
    use serde_json::json;

    struct RejectingStore;

    impl DocumentStore for RejectingStore {
        fn read_all(&self, collection: &str) -> StoreResult<Vec<Document>> {
            Err(StoreError::CollectionNotFound(collection.to_string()))
        }

        fn replace_all(&self, _collection: &str, _docs: Vec<Document>) -> StoreResult<()> {
            Err(StoreError::Injected("disk full".into()))
        }

        fn list_collections(&self) -> StoreResult<Vec<String>> {
            Ok(Vec::new())
        }

        fn drop_collection(&self, _collection: &str) -> StoreResult<bool> {
            Ok(false)
        }
    }

    #[test]
    fn creates_missing_destination() {
        let store = MemoryStore::new();
        let docs = vec![into_document(json!({"a": 1})).unwrap()];
        assert_eq!(materialize(3, docs, "dest", &store).unwrap(), 1);
        assert_eq!(store.count("dest"), Some(1));
    }

    #[test]
    fn empty_result_still_replaces() {
        let store = MemoryStore::new();
        store
            .replace_all("dest", vec![into_document(json!({"old": true})).unwrap()])
            .unwrap();
        assert_eq!(materialize(0, Vec::new(), "dest", &store).unwrap(), 0);
        assert_eq!(store.count("dest"), Some(0));
    }

    #[test]
    fn store_failure_reports_stage_and_collection() {
        let err = materialize(2, Vec::new(), "dest", &RejectingStore).unwrap_err();
        match err {
            Error::MaterializationFailed {
                stage,
                collection,
                source: StoreError::Injected(_),
            } => {
                assert_eq!(stage, 2);
                assert_eq!(collection, "dest");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
