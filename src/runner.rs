use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancel::{CancellationToken, Checkpoint};
use crate::config::RunnerConfig;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::lookup;
use crate::output;
use crate::pipeline::{Pipeline, Stage};
use crate::store::DocumentStore;

/// Per-stage execution summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub index: usize,
    pub kind: &'static str,
    pub collection: String,
    pub input_rows: u64,
    pub output_rows: u64,
    /// Input documents with at least one match (lookup stages only).
    pub matched: Option<u64>,
    pub elapsed_ms: u64,
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub source: String,
    /// `None` for a preview run with no `$out` stage.
    pub destination: Option<String>,
    /// Documents in the final stream: written by `$out`, or counted in preview.
    pub rows: u64,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub stages: Vec<StageReport>,
}

/// Executes validated pipelines against a [`DocumentStore`].
///
/// Stages run strictly in sequence; each consumes the complete output of the
/// previous one. Cancellation and the configured timeout are checked before
/// every stage and inside lookups between index build and probing. Nothing
/// is written unless every stage before `$out` succeeds.
#[derive(Debug, Clone, Default)]
pub struct PipelineRunner {
    config: RunnerConfig,
}

impl PipelineRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run `pipeline` over `source`, materializing into its `$out` target if
    /// it has one.
    pub fn run(
        &self,
        pipeline: &Pipeline,
        store: &dyn DocumentStore,
        source: &str,
    ) -> Result<RunReport> {
        self.run_with_token(pipeline, store, source, &CancellationToken::new())
    }

    pub fn run_with_token(
        &self,
        pipeline: &Pipeline,
        store: &dyn DocumentStore,
        source: &str,
        token: &CancellationToken,
    ) -> Result<RunReport> {
        self.run_checked(pipeline, store, source, &self.checkpoint(token))
    }

    /// Start the run clock: cancellation through `token` plus the configured
    /// timeout, counted from now.
    pub(crate) fn checkpoint(&self, token: &CancellationToken) -> Checkpoint {
        Checkpoint::new(token.clone(), self.config.timeout)
    }

    pub(crate) fn run_checked(
        &self,
        pipeline: &Pipeline,
        store: &dyn DocumentStore,
        source: &str,
        checkpoint: &Checkpoint,
    ) -> Result<RunReport> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let destination = pipeline.output().map(str::to_string);
        info!(source, destination = ?destination, stages = pipeline.len(), "running pipeline");

        let result = self.execute(pipeline, store, source, checkpoint);
        let (rows, stages) = match result {
            Ok(done) => done,
            Err(e) => {
                if e.is_cancellation() {
                    warn!(source, stage = ?e.stage(), "pipeline stopped: {e}");
                } else {
                    warn!(source, stage = ?e.stage(), "pipeline failed: {e}");
                }
                return Err(e);
            }
        };

        let report = RunReport {
            source: source.to_string(),
            destination,
            rows,
            started_at,
            elapsed_ms: clock.elapsed().as_millis() as u64,
            stages,
        };
        info!(
            source,
            rows = report.rows,
            elapsed_ms = report.elapsed_ms,
            "pipeline finished"
        );
        Ok(report)
    }

    /// Run every stage except `$out` and return the resulting documents.
    pub fn evaluate(
        &self,
        pipeline: &Pipeline,
        store: &dyn DocumentStore,
        source: &str,
        token: &CancellationToken,
    ) -> Result<Vec<Document>> {
        self.evaluate_checked(pipeline, store, source, &self.checkpoint(token))
    }

    /// [`evaluate`](Self::evaluate) under an existing run's checkpoint.
    pub(crate) fn evaluate_checked(
        &self,
        pipeline: &Pipeline,
        store: &dyn DocumentStore,
        source: &str,
        checkpoint: &Checkpoint,
    ) -> Result<Vec<Document>> {
        let mut stages = Vec::new();
        self.transform(pipeline, store, source, checkpoint, &mut stages)
    }

    fn execute(
        &self,
        pipeline: &Pipeline,
        store: &dyn DocumentStore,
        source: &str,
        checkpoint: &Checkpoint,
    ) -> Result<(u64, Vec<StageReport>)> {
        let mut reports = Vec::with_capacity(pipeline.len());
        let docs = self.transform(pipeline, store, source, checkpoint, &mut reports)?;

        let Some(to) = pipeline.output() else {
            return Ok((docs.len() as u64, reports));
        };
        let position = pipeline.len() - 1;
        checkpoint.check(position)?;

        let clock = Instant::now();
        let input_rows = docs.len() as u64;
        let written = output::materialize(position, docs, to, store)?;
        reports.push(StageReport {
            index: position,
            kind: "$out",
            collection: to.to_string(),
            input_rows,
            output_rows: written,
            matched: None,
            elapsed_ms: clock.elapsed().as_millis() as u64,
        });
        Ok((written, reports))
    }

    fn transform(
        &self,
        pipeline: &Pipeline,
        store: &dyn DocumentStore,
        source: &str,
        checkpoint: &Checkpoint,
        reports: &mut Vec<StageReport>,
    ) -> Result<Vec<Document>> {
        checkpoint.check(0)?;
        let mut current = store
            .read_all(source)
            .map_err(|e| Error::from_read(None, source, e))?;
        debug!(source, docs = current.len(), "read source collection");

        for (position, stage) in pipeline.stages().iter().enumerate() {
            let Stage::Lookup(lookup) = stage else {
                // `$out` is terminal by construction.
                break;
            };
            checkpoint.check(position)?;

            let clock = Instant::now();
            let input_rows = current.len() as u64;
            let (docs, stats) =
                lookup::run(position, current, lookup, store, &self.config, checkpoint)?;
            let report = StageReport {
                index: position,
                kind: stage.kind(),
                collection: lookup.from.clone(),
                input_rows,
                output_rows: docs.len() as u64,
                matched: Some(stats.matched as u64),
                elapsed_ms: clock.elapsed().as_millis() as u64,
            };
            debug!(
                stage = position,
                from = %lookup.from,
                input = report.input_rows,
                matched = stats.matched,
                shards = stats.shards,
                elapsed_ms = report.elapsed_ms,
                "lookup stage done"
            );
            reports.push(report);
            current = docs;
        }
        Ok(current)
    }
}
