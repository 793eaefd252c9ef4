use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::cancel::{CancellationToken, Checkpoint};
use crate::document::Document;
use crate::error::{Error, Result, StoreError};
use crate::pipeline::Pipeline;
use crate::runner::PipelineRunner;
use crate::store::{DocumentStore, StoreResult};

/// A named, read-only pipeline over another collection or view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewDefinition {
    pub name: String,
    pub view_on: String,
    pub pipeline: Pipeline,
}

impl ViewDefinition {
    /// Every name this view reads from.
    fn dependencies(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.view_on.as_str())
            .chain(self.pipeline.lookups().map(|(_, l)| l.from.as_str()))
    }
}

/// Registry of view definitions.
#[derive(Debug, Default)]
pub struct ViewCatalog {
    views: RwLock<HashMap<String, Arc<ViewDefinition>>>,
}

impl ViewCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a view. The pipeline may not contain `$out` and may not
    /// depend on the view itself, directly or through other views.
    pub fn create(&self, view: ViewDefinition) -> Result<()> {
        if let Some(to) = view.pipeline.output() {
            return Err(Error::invalid(
                Some(view.pipeline.len() - 1),
                format!("view '{}' cannot contain $out (target '{to}')", view.name),
            ));
        }

        let mut views = self.views.write().unwrap();
        if views.contains_key(&view.name) {
            return Err(Error::NamespaceExists(view.name));
        }
        if reaches(&views, &view, &view.name) {
            return Err(Error::invalid(
                None,
                format!("view '{}' would depend on itself", view.name),
            ));
        }
        views.insert(view.name.clone(), Arc::new(view));
        Ok(())
    }

    pub fn drop_view(&self, name: &str) -> Result<()> {
        let mut views = self.views.write().unwrap();
        views
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::ViewNotFound(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<Arc<ViewDefinition>> {
        let views = self.views.read().unwrap();
        views.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.views.read().unwrap().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let views = self.views.read().unwrap();
        let mut names: Vec<String> = views.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Whether `start`'s dependency graph contains `target`.
fn reaches(
    views: &HashMap<String, Arc<ViewDefinition>>,
    start: &ViewDefinition,
    target: &str,
) -> bool {
    let mut seen = HashSet::new();
    let mut pending: Vec<&str> = start.dependencies().collect();
    while let Some(name) = pending.pop() {
        if name == target {
            return true;
        }
        if !seen.insert(name) {
            continue;
        }
        if let Some(view) = views.get(name) {
            pending.extend(view.dependencies());
        }
    }
    false
}

/// Store facade that resolves view names by evaluating their pipelines on
/// read and refuses writes to them. Everything else goes to `base`.
///
/// View evaluation shares one checkpoint, so views read during a run are
/// bounded by that run's cancellation token and deadline.
pub struct ViewStore<'a> {
    base: &'a dyn DocumentStore,
    views: &'a ViewCatalog,
    runner: &'a PipelineRunner,
    checkpoint: Checkpoint,
}

impl<'a> ViewStore<'a> {
    pub fn new(
        base: &'a dyn DocumentStore,
        views: &'a ViewCatalog,
        runner: &'a PipelineRunner,
        token: CancellationToken,
    ) -> Self {
        let checkpoint = runner.checkpoint(&token);
        Self::with_checkpoint(base, views, runner, checkpoint)
    }

    pub(crate) fn with_checkpoint(
        base: &'a dyn DocumentStore,
        views: &'a ViewCatalog,
        runner: &'a PipelineRunner,
        checkpoint: Checkpoint,
    ) -> Self {
        Self {
            base,
            views,
            runner,
            checkpoint,
        }
    }

    pub(crate) fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }
}

impl DocumentStore for ViewStore<'_> {
    fn read_all(&self, collection: &str) -> StoreResult<Vec<Document>> {
        let Some(view) = self.views.get(collection) else {
            return self.base.read_all(collection);
        };
        self.runner
            .evaluate_checked(&view.pipeline, self, &view.view_on, &self.checkpoint)
            .map_err(|e| StoreError::View {
                view: view.name.clone(),
                source: Box::new(e),
            })
    }

    fn replace_all(&self, collection: &str, docs: Vec<Document>) -> StoreResult<()> {
        if self.views.contains(collection) {
            return Err(StoreError::ReadOnly(collection.to_string()));
        }
        self.base.replace_all(collection, docs)
    }

    fn list_collections(&self) -> StoreResult<Vec<String>> {
        self.base.list_collections()
    }

    fn drop_collection(&self, collection: &str) -> StoreResult<bool> {
        if self.views.contains(collection) {
            return Err(StoreError::ReadOnly(collection.to_string()));
        }
        self.base.drop_collection(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::into_document;
    use crate::pipeline::Stage;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn view(name: &str, view_on: &str, stages: Vec<Stage>) -> ViewDefinition {
        ViewDefinition {
            name: name.into(),
            view_on: view_on.into(),
            pipeline: Pipeline::new(stages).unwrap(),
        }
    }

    #[test]
    fn rejects_out_stage() {
        let catalog = ViewCatalog::new();
        let err = catalog
            .create(view("v", "src", vec![Stage::out("x")]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPipeline { stage: Some(0), .. }));
        assert!(!catalog.contains("v"));
    }

    #[test]
    fn rejects_duplicates_and_cycles() {
        let catalog = ViewCatalog::new();
        catalog.create(view("a", "b", vec![])).unwrap();
        assert!(matches!(
            catalog.create(view("a", "c", vec![])),
            Err(Error::NamespaceExists(_))
        ));
        assert!(matches!(
            catalog.create(view("b", "a", vec![])),
            Err(Error::InvalidPipeline { .. })
        ));
        assert!(matches!(
            catalog.create(view("c", "src", vec![Stage::lookup("c", "k", "k", "x")])),
            Err(Error::InvalidPipeline { .. })
        ));
        assert!(matches!(
            catalog.create(view("b", "src", vec![Stage::lookup("a", "k", "k", "x")])),
            Err(Error::InvalidPipeline { .. })
        ));
        assert_eq!(catalog.names(), vec!["a"]);
    }

    #[test]
    fn drop_unknown_view() {
        let catalog = ViewCatalog::new();
        assert!(matches!(catalog.drop_view("v"), Err(Error::ViewNotFound(_))));
    }

    #[test]
    fn view_store_evaluates_views_and_blocks_writes() {
        let base = MemoryStore::new();
        base.replace_all("src", vec![into_document(json!({"k": 1})).unwrap()])
            .unwrap();
        base.replace_all("f", vec![into_document(json!({"k": 1, "v": "x"})).unwrap()])
            .unwrap();
        let catalog = ViewCatalog::new();
        catalog
            .create(view("joined", "src", vec![Stage::lookup("f", "k", "k", "fs")]))
            .unwrap();
        let runner = PipelineRunner::default();
        let store = ViewStore::new(&base, &catalog, &runner, CancellationToken::new());

        let docs = store.read_all("joined").unwrap();
        assert_eq!(
            docs,
            vec![into_document(json!({"k": 1, "fs": [{"k": 1, "v": "x"}]})).unwrap()]
        );
        assert!(matches!(
            store.replace_all("joined", Vec::new()),
            Err(StoreError::ReadOnly(_))
        ));
        assert_eq!(store.read_all("src").unwrap().len(), 1);
    }

    #[test]
    fn view_reads_share_the_run_deadline() {
        let base = MemoryStore::new();
        base.replace_all("src", Vec::new()).unwrap();
        let catalog = ViewCatalog::new();
        catalog.create(view("v", "src", vec![])).unwrap();
        let runner = PipelineRunner::new(
            crate::config::RunnerConfig::default()
                .with_timeout(std::time::Duration::from_millis(200)),
        );
        let store = ViewStore::new(&base, &catalog, &runner, CancellationToken::new());
        assert!(store.read_all("v").is_ok());

        std::thread::sleep(std::time::Duration::from_millis(250));
        match store.read_all("v") {
            Err(StoreError::View { source, .. }) => {
                assert!(matches!(*source, Error::TimedOut { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn view_over_missing_source_reports_view() {
        let base = MemoryStore::new();
        let catalog = ViewCatalog::new();
        catalog.create(view("v", "missing", vec![])).unwrap();
        let runner = PipelineRunner::default();
        let store = ViewStore::new(&base, &catalog, &runner, CancellationToken::new());
        match store.read_all("v") {
            Err(StoreError::View { view, source }) => {
                assert_eq!(view, "v");
                assert!(matches!(*source, Error::CollectionNotFound { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
