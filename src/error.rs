use std::time::Duration;

use thiserror::Error;

/// Errors raised by a [`DocumentStore`](crate::store::DocumentStore) adapter.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("invalid collection name: {0:?}")]
    InvalidName(String),

    #[error("document must be a JSON object")]
    NotAnObject,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt record in collection '{collection}' at offset {offset}")]
    Corrupt { collection: String, offset: u64 },

    #[error("'{0}' is a view and cannot be written")]
    ReadOnly(String),

    #[error("view '{view}' failed: {source}")]
    View {
        view: String,
        #[source]
        source: Box<Error>,
    },

    #[error("injected failure: {0}")]
    Injected(String),
}

impl StoreError {
    /// Transient failures worth retrying by the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}

/// Pipeline execution errors.
///
/// `stage` is the zero-based position of the failing stage; `None` means the
/// failure happened while reading the pipeline's source collection.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid pipeline{}: {reason}", at_stage(.stage))]
    InvalidPipeline {
        stage: Option<usize>,
        reason: String,
    },

    #[error("collection not found{}: {collection}", at_stage(.stage))]
    CollectionNotFound {
        stage: Option<usize>,
        collection: String,
    },

    #[error("materialization into '{collection}' failed at stage {stage}: {source}")]
    MaterializationFailed {
        stage: usize,
        collection: String,
        #[source]
        source: StoreError,
    },

    #[error("store error{} reading '{collection}': {source}", at_stage(.stage))]
    Store {
        stage: Option<usize>,
        collection: String,
        #[source]
        source: StoreError,
    },

    #[error("pipeline cancelled before stage {stage}")]
    Cancelled { stage: usize },

    #[error("pipeline exceeded its {limit:?} time limit before stage {stage}")]
    TimedOut { stage: usize, limit: Duration },

    #[error("view not found: {0}")]
    ViewNotFound(String),

    #[error("a collection or view named '{0}' already exists")]
    NamespaceExists(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("import of '{path}' failed: {source}")]
    Import {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

fn at_stage(stage: &Option<usize>) -> String {
    match stage {
        Some(i) => format!(" at stage {i}"),
        None => String::new(),
    }
}

impl Error {
    pub(crate) fn invalid(stage: Option<usize>, reason: impl Into<String>) -> Self {
        Error::InvalidPipeline {
            stage,
            reason: reason.into(),
        }
    }

    /// Map a store read failure onto the pipeline taxonomy.
    ///
    /// A failed view read surfaces as the error raised inside the view,
    /// attributed to the stage that read it.
    pub(crate) fn from_read(stage: Option<usize>, collection: &str, err: StoreError) -> Self {
        match err {
            StoreError::View { source, .. } => match *source {
                Error::CollectionNotFound { collection, .. } => {
                    Error::CollectionNotFound { stage, collection }
                }
                Error::Store {
                    collection, source, ..
                } => Error::Store {
                    stage,
                    collection,
                    source,
                },
                Error::Cancelled { .. } => Error::Cancelled {
                    stage: stage.unwrap_or(0),
                },
                Error::TimedOut { limit, .. } => Error::TimedOut {
                    stage: stage.unwrap_or(0),
                    limit,
                },
                other => other,
            },
            StoreError::CollectionNotFound(_) => Error::CollectionNotFound {
                stage,
                collection: collection.to_string(),
            },
            source => Error::Store {
                stage,
                collection: collection.to_string(),
                source,
            },
        }
    }

    /// Position of the failing stage, if the error is tied to one.
    pub fn stage(&self) -> Option<usize> {
        match self {
            Error::InvalidPipeline { stage, .. }
            | Error::CollectionNotFound { stage, .. }
            | Error::Store { stage, .. } => *stage,
            Error::MaterializationFailed { stage, .. }
            | Error::Cancelled { stage }
            | Error::TimedOut { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Whether re-running the whole pipeline might succeed without the
    /// definition or the data being changed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::MaterializationFailed { source, .. } | Error::Store { source, .. } => {
                source.is_transient()
            }
            _ => false,
        }
    }

    /// Cancellation and timeouts are terminal statuses rather than faults.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled { .. } | Error::TimedOut { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
