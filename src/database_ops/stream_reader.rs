//! Incremental reader for a single top-level JSON array that is too large to
//! buffer. Elements are parsed on a blocking thread and forwarded over a
//! bounded channel; the async side groups them into batches and hands each
//! batch to the caller's processor.
//!
//! Backpressure: once `concurrency` batches are in flight the reader stops
//! pulling from the channel. The channel holds a single element, so a paused
//! reader leaves the parser with at most one element queued and one in hand,
//! blocked on send until a batch resolves.

use anyhow::{anyhow, Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::de::{self, DeserializeOwned, SeqAccess, Visitor};
use serde::Deserializer as _;
use std::fmt;
use std::fs::File;
use std::future::Future;
use std::io::{BufReader, Read};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Elements the parser may run ahead of the reader.
const PARSE_AHEAD: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    pub batch_size: usize,
    /// Maximum number of unresolved processor invocations.
    pub concurrency: usize,
    /// Log progress at info level every N resolved batches.
    pub progress_every: u64,
}

impl StreamOptions {
    pub fn new(batch_size: usize, concurrency: usize) -> Self {
        Self {
            batch_size,
            concurrency,
            progress_every: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Elements parsed from the array.
    pub parsed: u64,
    /// Elements whose batch was processed successfully.
    pub processed: u64,
    /// Batches handed to the processor.
    pub batches: u64,
    /// Times parsing was suspended because the in-flight limit was reached.
    pub pauses: u64,
}

/// Stream the JSON array stored at `path` through `process` in batches.
pub async fn stream_json_array<T, F, Fut>(
    path: &Path,
    opts: StreamOptions,
    process: F,
) -> Result<StreamStats>
where
    T: DeserializeOwned + Send + 'static,
    F: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = BufReader::with_capacity(8 << 20, file);
    stream_json_reader(reader, opts, process)
        .await
        .with_context(|| format!("stream {}", path.display()))
}

/// Same as [`stream_json_array`] for any blocking reader.
pub async fn stream_json_reader<T, R, F, Fut>(
    reader: R,
    opts: StreamOptions,
    mut process: F,
) -> Result<StreamStats>
where
    T: DeserializeOwned + Send + 'static,
    R: Read + Send + 'static,
    F: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let batch_size = opts.batch_size.max(1);
    let concurrency = opts.concurrency.max(1);
    let progress_every = opts.progress_every.max(1);

    let (tx, mut rx) = mpsc::channel::<T>(PARSE_AHEAD);
    let parser = tokio::task::spawn_blocking(move || parse_array(reader, tx));

    let mut in_flight = FuturesUnordered::new();
    let mut stats = StreamStats::default();
    let mut resolved = 0u64;
    let mut batch: Vec<T> = Vec::with_capacity(batch_size);

    loop {
        if in_flight.len() >= concurrency {
            // Paused: nothing is pulled from the parser until a batch resolves.
            stats.pauses += 1;
            if let Some(done) = in_flight.next().await {
                stats.processed += done?;
                resolved += 1;
                log_progress(&stats, resolved, progress_every, in_flight.len());
            }
            continue;
        }
        tokio::select! {
            biased;
            Some(done) = in_flight.next(), if !in_flight.is_empty() => {
                stats.processed += done?;
                resolved += 1;
                log_progress(&stats, resolved, progress_every, in_flight.len());
            }
            item = rx.recv() => match item {
                Some(item) => {
                    stats.parsed += 1;
                    batch.push(item);
                    if batch.len() >= batch_size {
                        let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                        stats.batches += 1;
                        debug!(batch = stats.batches, items = full.len(), in_flight = in_flight.len() + 1, "dispatching batch");
                        let items = full.len();
                        in_flight.push(tracked(process(full), items));
                    }
                }
                None => break,
            }
        }
    }

    // Channel closed: the parser either reached the end of the array or failed.
    let parsed = parser
        .await
        .map_err(|e| anyhow!("json parser task failed: {e}"))??;
    if parsed != stats.parsed {
        return Err(anyhow!(
            "parser reported {parsed} elements but {} were received",
            stats.parsed
        ));
    }

    if !batch.is_empty() {
        stats.batches += 1;
        debug!(batch = stats.batches, items = batch.len(), "dispatching final partial batch");
        let items = batch.len();
        in_flight.push(tracked(process(batch), items));
    }
    while let Some(done) = in_flight.next().await {
        stats.processed += done?;
        resolved += 1;
        log_progress(&stats, resolved, progress_every, in_flight.len());
    }

    info!(
        parsed = stats.parsed,
        processed = stats.processed,
        batches = stats.batches,
        pauses = stats.pauses,
        "stream complete"
    );
    Ok(stats)
}

async fn tracked<Fut>(fut: Fut, items: usize) -> Result<u64>
where
    Fut: Future<Output = Result<()>>,
{
    fut.await?;
    Ok(items as u64)
}

fn log_progress(stats: &StreamStats, resolved: u64, every: u64, in_flight: usize) {
    if resolved % every == 0 {
        info!(
            processed = stats.processed,
            batches_done = resolved,
            batches_dispatched = stats.batches,
            in_flight,
            "stream progress"
        );
    }
}

fn parse_array<T, R>(reader: R, tx: mpsc::Sender<T>) -> Result<u64>
where
    T: DeserializeOwned,
    R: Read,
{
    let mut de = serde_json::Deserializer::from_reader(reader);
    let count = (&mut de)
        .deserialize_seq(ArrayForwarder { tx })
        .context("parse json array")?;
    de.end().context("trailing data after json array")?;
    Ok(count)
}

/// Forwards each array element to the channel as soon as it is complete.
struct ArrayForwarder<T> {
    tx: mpsc::Sender<T>,
}

impl<'de, T> Visitor<'de> for ArrayForwarder<T>
where
    T: DeserializeOwned,
{
    type Value = u64;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a top-level JSON array")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<u64, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut count = 0u64;
        while let Some(item) = seq.next_element::<T>()? {
            // Blocks while the consumer is paused.
            if self.tx.blocking_send(item).is_err() {
                return Err(de::Error::custom("stream consumer stopped"));
            }
            count += 1;
        }
        Ok(count)
    }
}
