use std::thread;
use std::time::Instant;

use serde_json::Value;
use tracing::debug;

use crate::cancel::{CancellationToken, Checkpoint};
use crate::config::RunnerConfig;
use crate::document::{self, Document};
use crate::error::{Error, Result};
use crate::join::JoinIndex;
use crate::pipeline::LookupStage;
use crate::store::DocumentStore;
use crate::value::{self, ArrayKeys};

/// Probe this many documents between cancellation checks.
const CHECK_EVERY: usize = 1024;

/// Counters gathered while executing one lookup stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupStats {
    pub foreign_docs: usize,
    pub distinct_keys: usize,
    /// Input documents that found at least one foreign document.
    pub matched: usize,
    pub shards: usize,
}

/// Run a lookup stage on its own, sequentially and without a deadline.
pub fn execute_lookup(
    input: Vec<Document>,
    stage: &LookupStage,
    store: &dyn DocumentStore,
) -> Result<Vec<Document>> {
    let config = RunnerConfig::default().with_workers(1);
    let checkpoint = Checkpoint::new(CancellationToken::new(), None);
    run(0, input, stage, store, &config, &checkpoint).map(|(docs, _)| docs)
}

/// Execute the lookup at pipeline position `position`.
///
/// The foreign collection is read and indexed in full before the first
/// probe. Output document `i` is input document `i` with `as` set to its
/// (possibly empty) match array.
pub(crate) fn run(
    position: usize,
    input: Vec<Document>,
    stage: &LookupStage,
    store: &dyn DocumentStore,
    config: &RunnerConfig,
    checkpoint: &Checkpoint,
) -> Result<(Vec<Document>, LookupStats)> {
    let started = Instant::now();
    let foreign = store
        .read_all(&stage.from)
        .map_err(|e| Error::from_read(Some(position), &stage.from, e))?;

    let index = JoinIndex::build(foreign, &stage.foreign_field, config.array_keys);
    debug!(
        stage = position,
        from = %stage.from,
        foreign_docs = index.len(),
        distinct_keys = index.key_count(),
        unindexed = index.unindexed(),
        elapsed_us = started.elapsed().as_micros() as u64,
        "built join index"
    );
    checkpoint.check(position)?;

    let shards = shard_count(input.len(), config);
    let (docs, matched) = if shards <= 1 {
        probe_shard(input, &index, stage, config.array_keys, checkpoint, position)?
    } else {
        probe_parallel(input, shards, &index, stage, config.array_keys, checkpoint, position)?
    };

    let stats = LookupStats {
        foreign_docs: index.len(),
        distinct_keys: index.key_count(),
        matched,
        shards: shards.max(1),
    };
    Ok((docs, stats))
}

fn shard_count(len: usize, config: &RunnerConfig) -> usize {
    if config.workers <= 1 || len < 2 || len < config.parallel_threshold {
        return 1;
    }
    config.workers.min(len)
}

fn attach(
    mut doc: Document,
    index: &JoinIndex,
    stage: &LookupStage,
    arrays: ArrayKeys,
) -> (Document, bool) {
    let keys = value::join_keys(&doc, &stage.local_field, arrays);
    let matches = index.probe(&keys);
    let hit = !matches.is_empty();
    document::set_field(&mut doc, &stage.as_field, Value::Array(matches));
    (doc, hit)
}

fn probe_shard(
    shard: Vec<Document>,
    index: &JoinIndex,
    stage: &LookupStage,
    arrays: ArrayKeys,
    checkpoint: &Checkpoint,
    position: usize,
) -> Result<(Vec<Document>, usize)> {
    let mut out = Vec::with_capacity(shard.len());
    let mut matched = 0;
    for (i, doc) in shard.into_iter().enumerate() {
        if i > 0 && i % CHECK_EVERY == 0 {
            checkpoint.check(position)?;
        }
        let (doc, hit) = attach(doc, index, stage, arrays);
        matched += usize::from(hit);
        out.push(doc);
    }
    Ok((out, matched))
}

/// Split the input into contiguous shards, probe them on scoped threads and
/// concatenate the results in shard order.
fn probe_parallel(
    input: Vec<Document>,
    shards: usize,
    index: &JoinIndex,
    stage: &LookupStage,
    arrays: ArrayKeys,
    checkpoint: &Checkpoint,
    position: usize,
) -> Result<(Vec<Document>, usize)> {
    let total = input.len();
    let chunk = total.div_ceil(shards);

    let mut parts = Vec::with_capacity(shards);
    let mut rest = input;
    while rest.len() > chunk {
        let tail = rest.split_off(chunk);
        parts.push(rest);
        rest = tail;
    }
    parts.push(rest);

    let results: Vec<Result<(Vec<Document>, usize)>> = thread::scope(|s| {
        let handles: Vec<_> = parts
            .into_iter()
            .map(|part| {
                s.spawn(move || probe_shard(part, index, stage, arrays, checkpoint, position))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    });

    let mut out = Vec::with_capacity(total);
    let mut matched = 0;
    for result in results {
        let (docs, hits) = result?;
        out.extend(docs);
        matched += hits;
    }
    Ok((out, matched))
}
