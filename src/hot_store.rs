//! # Hot Store
//! Ordered FIFO of freshly fetched records, oldest first.
//!
//! Records are held as opaque serialized blobs. Length, byte size and
//! per-source counts are maintained incrementally so every introspection
//! call is O(1). Append and pop each take the lock once per batch, so a
//! reader never observes a half-appended batch.
//!
//! The store never caps itself; keeping it inside its envelope is the
//! exporter's job. `pop_oldest` is reserved for the exporter.
//!
//! Durability: a store opened with [`HotStore::open`] keeps a JSON-Lines
//! snapshot next to it; [`HotStore::flush`] rewrites it atomically. The
//! store lock is only held while the blob list is cloned; disk I/O runs
//! outside it, so async callers should go through [`HotStore::flush_blocking`].

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use metrics::gauge;
use tracing::{info, warn};

use crate::record::{Record, SourceKind};

#[derive(Debug)]
struct Entry {
    source: SourceKind,
    bytes: u64,
    blob: Arc<str>,
}

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<Entry>,
    bytes: u64,
    per_source: HashMap<SourceKind, usize>,
    dirty: bool,
}

impl Inner {
    fn push(&mut self, e: Entry) {
        self.bytes = self.bytes.saturating_add(e.bytes);
        *self.per_source.entry(e.source).or_insert(0) += 1;
        self.queue.push_back(e);
    }

    fn pop(&mut self) -> Option<Entry> {
        let e = self.queue.pop_front()?;
        self.bytes = self.bytes.saturating_sub(e.bytes);
        if let Some(c) = self.per_source.get_mut(&e.source) {
            *c = c.saturating_sub(1);
        }
        Some(e)
    }
}

#[derive(Debug)]
pub struct HotStore {
    inner: Mutex<Inner>,
    snapshot_path: Option<PathBuf>,
    /// Serializes snapshot writers so an older copy never lands last.
    flush_gate: Mutex<()>,
}

impl HotStore {
    /// Volatile store without a snapshot.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            snapshot_path: None,
            flush_gate: Mutex::new(()),
        }
    }

    /// Open (or create) a store backed by a JSON-Lines snapshot at `path`.
    /// Lines that fail to decode are skipped with a warning.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut inner = Inner::default();
        match fs::File::open(&path) {
            Ok(f) => {
                let mut skipped = 0usize;
                for raw in BufReader::new(f).split(b'\n') {
                    let raw = raw
                        .with_context(|| format!("reading hot store snapshot {}", path.display()))?;
                    let line = match String::from_utf8(raw) {
                        Ok(line) => line,
                        Err(e) => {
                            skipped += 1;
                            warn!(error = %e, "skipping non-utf8 hot store line");
                            continue;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Record>(&line) {
                        Ok(rec) => inner.push(Entry {
                            source: rec.source,
                            bytes: rec.raw_size_estimate,
                            blob: line.into(),
                        }),
                        Err(e) => {
                            skipped += 1;
                            warn!(error = %e, "skipping undecodable hot store line");
                        }
                    }
                }
                info!(
                    path = %path.display(),
                    len = inner.queue.len(),
                    skipped,
                    "hot store restored"
                );
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("opening hot store snapshot {}", path.display()))
            }
        }
        let store = Self {
            inner: Mutex::new(inner),
            snapshot_path: Some(path),
            flush_gate: Mutex::new(()),
        };
        store.publish_gauges();
        Ok(store)
    }

    /// Append a batch at the tail under a single lock. Returns the number appended.
    pub fn append_batch(&self, records: Vec<Record>) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut encoded = Vec::with_capacity(records.len());
        for rec in &records {
            let blob = serde_json::to_string(rec).context("serializing record for hot store")?;
            encoded.push(Entry {
                source: rec.source,
                bytes: rec.raw_size_estimate,
                blob: blob.into(),
            });
        }
        let n = encoded.len();
        {
            let mut g = self.inner.lock().expect("hot store mutex poisoned");
            for e in encoded {
                g.push(e);
            }
            g.dirty = true;
        }
        self.publish_gauges();
        Ok(n)
    }

    pub fn append(&self, record: Record) -> Result<()> {
        self.append_batch(vec![record]).map(|_| ())
    }

    /// Up to `n` oldest records, FIFO order, without removing them.
    pub fn peek_oldest(&self, n: usize) -> Result<Vec<Record>> {
        self.peek_range(0, n)
    }

    /// Up to `n` records starting `skip` entries from the head.
    pub fn peek_range(&self, skip: usize, n: usize) -> Result<Vec<Record>> {
        let blobs: Vec<Arc<str>> = {
            let g = self.inner.lock().expect("hot store mutex poisoned");
            g.queue
                .iter()
                .skip(skip)
                .take(n)
                .map(|e| e.blob.clone())
                .collect()
        };
        blobs
            .iter()
            .map(|b| serde_json::from_str(b).context("decoding hot store entry"))
            .collect()
    }

    /// Remove up to `n` oldest records and return them in FIFO order.
    /// Only the exporter calls this, after its warm file is durable.
    pub fn pop_oldest(&self, n: usize) -> Result<Vec<Record>> {
        let popped: Vec<Entry> = {
            let mut g = self.inner.lock().expect("hot store mutex poisoned");
            let take = n.min(g.queue.len());
            let mut out = Vec::with_capacity(take);
            for _ in 0..take {
                if let Some(e) = g.pop() {
                    out.push(e);
                }
            }
            if !out.is_empty() {
                g.dirty = true;
            }
            out
        };
        self.publish_gauges();
        popped
            .iter()
            .map(|e| serde_json::from_str(&e.blob).context("decoding popped hot store entry"))
            .collect()
    }

    pub fn length(&self) -> usize {
        self.inner
            .lock()
            .expect("hot store mutex poisoned")
            .queue
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    /// Sum of `raw_size_estimate` over all held records.
    pub fn approx_memory_bytes(&self) -> u64 {
        self.inner.lock().expect("hot store mutex poisoned").bytes
    }

    pub fn source_count(&self, source: SourceKind) -> usize {
        self.inner
            .lock()
            .expect("hot store mutex poisoned")
            .per_source
            .get(&source)
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Rewrite the snapshot if anything changed since the last flush.
    /// No-op for in-memory stores.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let _gate = self.flush_gate.lock().expect("hot store flush gate poisoned");
        let blobs: Vec<Arc<str>> = {
            let mut g = self.inner.lock().expect("hot store mutex poisoned");
            if !g.dirty {
                return Ok(());
            }
            g.dirty = false;
            g.queue.iter().map(|e| e.blob.clone()).collect()
        };
        let written = write_snapshot(path, blobs.iter().map(|b| &**b))
            .with_context(|| format!("writing hot store snapshot {}", path.display()));
        if written.is_err() {
            self.inner.lock().expect("hot store mutex poisoned").dirty = true;
        }
        written
    }

    /// [`flush`](Self::flush) on the blocking pool.
    pub async fn flush_blocking(self: &Arc<Self>) -> Result<()> {
        if self.snapshot_path.is_none() {
            return Ok(());
        }
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.flush())
            .await
            .context("hot store flush task")?
    }

    fn publish_gauges(&self) {
        let (len, bytes) = {
            let g = self.inner.lock().expect("hot store mutex poisoned");
            (g.queue.len(), g.bytes)
        };
        gauge!("hot_store_len").set(len as f64);
        gauge!("hot_store_bytes").set(bytes as f64);
    }
}

fn write_snapshot<'a>(path: &Path, blobs: impl Iterator<Item = &'a str>) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    let tmp = path.with_extension("jsonl.tmp");
    let f = fs::File::create(&tmp)?;
    let mut w = BufWriter::new(f);
    for b in blobs {
        w.write_all(b.as_bytes())?;
        w.write_all(b"\n")?;
    }
    let f = w.into_inner().map_err(|e| e.into_error())?;
    f.sync_all()?;
    fs::rename(tmp, path)?;
    Ok(())
}
