pub mod cancel;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod import;
pub mod join;
pub mod lookup;
pub mod output;
pub mod pipeline;
pub mod runner;
pub mod storage;
pub mod store;
pub mod value;
pub mod view;

pub use cancel::CancellationToken;
pub use config::RunnerConfig;
pub use document::Document;
pub use engine::OxiJoin;
pub use error::{Error, Result, StoreError};
pub use pipeline::{LookupStage, Pipeline, Stage};
pub use runner::{PipelineRunner, RunReport, StageReport};
pub use storage::FileStore;
pub use store::{DocumentStore, MemoryStore};
pub use value::ArrayKeys;
