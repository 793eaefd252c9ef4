use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::cancel::CancellationToken;
use crate::config::RunnerConfig;
use crate::document;
use crate::error::{Error, Result, StoreError};
use crate::import;
use crate::pipeline::Pipeline;
use crate::runner::{PipelineRunner, RunReport};
use crate::storage::FileStore;
use crate::store::{DocumentStore, MemoryStore};
use crate::view::{ViewCatalog, ViewDefinition, ViewStore};

/// Entry point tying a document store, a view catalog and a pipeline runner
/// together.
///
/// Thread-safe: independent pipelines may run concurrently from several
/// threads; the store serializes replaces of the same collection.
pub struct OxiJoin {
    store: Arc<dyn DocumentStore>,
    views: ViewCatalog,
    runner: PipelineRunner,
}

impl OxiJoin {
    pub fn new(store: Arc<dyn DocumentStore>, config: RunnerConfig) -> Self {
        Self {
            store,
            views: ViewCatalog::new(),
            runner: PipelineRunner::new(config),
        }
    }

    /// In-memory engine with default settings.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), RunnerConfig::default())
    }

    /// Open or create a file-backed engine at `data_dir`, configured from
    /// the environment.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let store = FileStore::open(data_dir).map_err(|source| Error::Store {
            stage: None,
            collection: data_dir.display().to_string(),
            source,
        })?;
        let config = RunnerConfig::from_env()?;
        info!(data_dir = %data_dir.display(), workers = config.workers, "opened engine");
        Ok(Self::new(Arc::new(store), config))
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn config(&self) -> &RunnerConfig {
        self.runner.config()
    }

    fn resolver(&self, token: &CancellationToken) -> ViewStore<'_> {
        ViewStore::new(self.store.as_ref(), &self.views, &self.runner, token.clone())
    }

    // -----------------------------------------------------------------------
    // Collections
    // -----------------------------------------------------------------------

    /// Replace a collection's contents with `docs`.
    pub fn replace(&self, collection: &str, docs: Vec<Value>) -> Result<u64> {
        let docs = docs
            .into_iter()
            .map(document::into_document)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|source| write_error(collection, source))?;
        let count = docs.len() as u64;
        self.resolver(&CancellationToken::new())
            .replace_all(collection, docs)
            .map_err(|source| write_error(collection, source))?;
        Ok(count)
    }

    /// Every document of a collection or view.
    pub fn read(&self, name: &str) -> Result<Vec<Value>> {
        let docs = self
            .resolver(&CancellationToken::new())
            .read_all(name)
            .map_err(|e| Error::from_read(None, name, e))?;
        Ok(docs.into_iter().map(Value::Object).collect())
    }

    /// Load a CSV data file into the collection named after it (the file
    /// name up to its first dot), replacing whatever that collection held.
    /// Returns the collection name and the number of rows loaded.
    pub fn import_csv(&self, path: &Path) -> Result<(String, u64)> {
        let display = path.display().to_string();
        let collection = import::collection_name(path)
            .ok_or_else(|| write_error(&display, StoreError::InvalidName(display.clone())))?
            .to_string();
        let count = self.import_csv_as(&collection, path)?;
        Ok((collection, count))
    }

    /// Load a CSV data file into `collection`, replacing its contents.
    pub fn import_csv_as(&self, collection: &str, path: &Path) -> Result<u64> {
        let docs = import::read_csv(path)?;
        let count = docs.len() as u64;
        self.resolver(&CancellationToken::new())
            .replace_all(collection, docs)
            .map_err(|source| write_error(collection, source))?;
        info!(collection, path = %path.display(), rows = count, "imported csv");
        Ok(count)
    }

    pub fn list_collections(&self) -> Result<Vec<String>> {
        self.store.list_collections().map_err(|source| Error::Store {
            stage: None,
            collection: String::new(),
            source,
        })
    }

    pub fn drop_collection(&self, collection: &str) -> Result<bool> {
        self.resolver(&CancellationToken::new())
            .drop_collection(collection)
            .map_err(|source| write_error(collection, source))
    }

    // -----------------------------------------------------------------------
    // Pipelines
    // -----------------------------------------------------------------------

    /// Run an aggregation pipeline over `collection`.
    ///
    /// With a trailing `$out` the destination is replaced atomically and the
    /// report's `rows` is the number of documents written; without one the
    /// run is a preview and `rows` is the size of the result.
    pub fn aggregate(&self, collection: &str, pipeline_json: &Value) -> Result<RunReport> {
        self.aggregate_with_token(collection, pipeline_json, &CancellationToken::new())
    }

    pub fn aggregate_with_token(
        &self,
        collection: &str,
        pipeline_json: &Value,
        token: &CancellationToken,
    ) -> Result<RunReport> {
        let pipeline = Pipeline::parse(pipeline_json)?;
        self.run(&pipeline, collection, token)
    }

    /// Run an already-validated pipeline.
    pub fn run(
        &self,
        pipeline: &Pipeline,
        collection: &str,
        token: &CancellationToken,
    ) -> Result<RunReport> {
        let resolver = self.resolver(token);
        self.runner
            .run_checked(pipeline, &resolver, collection, resolver.checkpoint())
    }

    /// Evaluate a pipeline and return its documents without writing
    /// anything, even if it ends in `$out`.
    pub fn preview(&self, collection: &str, pipeline_json: &Value) -> Result<Vec<Value>> {
        let pipeline = Pipeline::parse(pipeline_json)?;
        let resolver = self.resolver(&CancellationToken::new());
        let docs = self
            .runner
            .evaluate_checked(&pipeline, &resolver, collection, resolver.checkpoint())?;
        Ok(docs.into_iter().map(Value::Object).collect())
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    /// Register a read-only view evaluated on every read.
    pub fn create_view(&self, name: &str, view_on: &str, pipeline_json: &Value) -> Result<()> {
        crate::store::validate_name(name).map_err(|source| write_error(name, source))?;
        let pipeline = Pipeline::parse(pipeline_json)?;
        if self.list_collections()?.iter().any(|c| c == name) {
            return Err(Error::NamespaceExists(name.to_string()));
        }
        self.views.create(ViewDefinition {
            name: name.to_string(),
            view_on: view_on.to_string(),
            pipeline,
        })?;
        info!(view = name, view_on, "created view");
        Ok(())
    }

    pub fn drop_view(&self, name: &str) -> Result<()> {
        self.views.drop_view(name)
    }

    pub fn list_views(&self) -> Vec<String> {
        self.views.names()
    }

    pub fn view(&self, name: &str) -> Option<Arc<ViewDefinition>> {
        self.views.get(name)
    }
}

fn write_error(collection: &str, source: StoreError) -> Error {
    Error::Store {
        stage: None,
        collection: collection.to_string(),
        source,
    }
}
