//! 📦 Common data structures: the building blocks of jlx
//!
//! ---
//!
//! 🎬 COLD OPEN, INT. DATA CENTER, 3:47 AM
//!
//! A cursor blinks. Somewhere, an index with eleven million documents waits to be
//! poured into a text file one line at a time. Each document will ride a `HitBatch`
//! out of the cluster, through a queue, past a writer, and onto a disk that has
//! opinions about free space. None of them know what's coming next. Relatable.
//!
//! ---
//!
//! 🧠 Knowledge graph:
//! - `Hit`: one document as the cluster returned it: `_id`, `_index`, `_source`, `sort`.
//! - `HitBatch`: one page of hits plus the sort key of the last one. Pooled.
//! - `BatchPool`: the free list. Checkout always resets. No ghosts from a prior page.
//! - `DumpLine` / `RestoreLine`: the NDJSON wire shapes, one per direction.
//!
//! ⚠️ `sort` is pagination plumbing. It never leaves the process. `DumpLine` doesn't even
//! have a field for it, so the writer can't leak it even if it wanted to.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::value::RawValue;

/// 🎯 A singular `Hit`: one document, one destiny.
///
/// `source` stays a `RawValue`: we never parse the payload, we just carry the bytes.
/// It's an `Option` because an index with `_source` disabled still has documents,
/// they're just... shy. They serialize as `null`.
#[derive(Debug, Clone, Deserialize)]
pub struct Hit {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(rename = "_source", default)]
    pub source: Option<Box<RawValue>>,
    /// 🔄 The sort values the cluster attached. Only meaningful while paginating.
    #[serde(default)]
    pub sort: Vec<Value>,
}

/// 📡 One line of dump output. Borrowed from a `Hit`, minus the sort key.
#[derive(Debug, Serialize)]
pub struct DumpLine<'a> {
    #[serde(rename = "_id")]
    pub id: &'a str,
    #[serde(rename = "_index")]
    pub index: &'a str,
    #[serde(rename = "_source")]
    pub source: Option<&'a RawValue>,
}

impl<'a> From<&'a Hit> for DumpLine<'a> {
    fn from(hit: &'a Hit) -> Self {
        Self {
            id: &hit.id,
            index: &hit.index,
            source: hit.source.as_deref(),
        }
    }
}

/// 📥 One line of restore input. Anything beyond these three fields is ignored.
#[derive(Debug, Deserialize)]
pub struct RestoreLine {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    #[serde(rename = "_index", default)]
    pub index: Option<String>,
    #[serde(rename = "_source")]
    pub source: Box<RawValue>,
}

/// 🧵 Appends one NDJSON line for `hit` to `out`. Newline included. Sort key excluded.
///
/// A `_source` that was indexed pretty-printed comes back with its line breaks intact, so
/// those get compacted first. Everything else goes out byte-for-byte.
pub fn encode_line(hit: &Hit, out: &mut Vec<u8>) -> Result<()> {
    let compacted = match hit.source.as_deref() {
        Some(raw) if memchr::memchr2(b'\n', b'\r', raw.get().as_bytes()).is_some() => Some(compact(raw)?),
        _ => None,
    };
    let mut line = DumpLine::from(hit);
    if let Some(compacted) = compacted.as_deref() {
        line.source = Some(compacted);
    }
    serde_json::to_writer(&mut *out, &line).with_context(|| {
        format!(
            "💀 Document '{}' from '{}' refused to become a line of JSON.",
            hit.id, hit.index
        )
    })?;
    out.push(b'\n');
    Ok(())
}

/// 🗜️ Drops the whitespace between tokens. Whitespace inside strings stays put, and a raw
/// newline can only ever be between tokens in valid JSON.
fn compact(raw: &RawValue) -> Result<Box<RawValue>> {
    let mut compacted = String::with_capacity(raw.get().len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in raw.get().chars() {
        if in_string {
            compacted.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            ' ' | '\t' | '\n' | '\r' => {}
            '"' => {
                in_string = true;
                compacted.push(ch);
            }
            _ => compacted.push(ch),
        }
    }
    RawValue::from_string(compacted).context("💀 a multi-line _source didn't survive compaction")
}

/// 📦 A `HitBatch`: one page of hits, because one hit is never enough.
///
/// Batches are only born inside [`BatchPool::checkout`], which hands out either a brand new
/// buffer or a recycled one that has been wiped clean. You cannot build one any other way.
/// That's the whole hygiene story: the type won't let you skip the reset.
#[derive(Debug)]
pub struct HitBatch {
    slot: usize,
    /// The page, in the order the cluster returned it.
    pub hits: Vec<Hit>,
    /// Sort key of the last hit, i.e. where the next page starts.
    pub last_sort: Vec<Value>,
    /// 1-based page counter, stamped by the exporter.
    pub page_number: u64,
}

impl HitBatch {
    fn fresh(slot: usize) -> Self {
        Self {
            slot,
            hits: Vec::new(),
            last_sort: Vec::new(),
            page_number: 0,
        }
    }

    /// 🗑️ Overwrites every field except the slot id. Capacity survives, contents don't.
    fn reset(&mut self) {
        self.hits.clear();
        self.last_sort.clear();
        self.page_number = 0;
    }

    /// Which pool slot this buffer belongs to. Stable across reuse.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// 📊 Rough payload size, for progress accounting.
    pub fn source_bytes(&self) -> usize {
        self.hits
            .iter()
            .map(|hit| hit.source.as_ref().map_or(4, |raw| raw.get().len()))
            .sum()
    }
}

/// ♻️ The batch free list.
///
/// Cloning the pool clones the handle, not the buffers: producer checks out, consumer
/// gives back, everyone shares one list. Buffers beyond `max_idle` are dropped on return
/// so a burst can't pin memory forever.
#[derive(Debug, Clone)]
pub struct BatchPool {
    free: Arc<Mutex<Vec<HitBatch>>>,
    next_slot: Arc<AtomicUsize>,
    max_idle: usize,
}

impl BatchPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            free: Arc::new(Mutex::new(Vec::with_capacity(max_idle))),
            next_slot: Arc::new(AtomicUsize::new(0)),
            max_idle: max_idle.max(1),
        }
    }

    /// 🎟️ Hands out a clean batch. Recycled if possible, fresh otherwise. Always empty.
    pub fn checkout(&self) -> HitBatch {
        let recycled = self
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();
        match recycled {
            Some(mut batch) => {
                batch.reset();
                batch
            }
            None => HitBatch::fresh(self.next_slot.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// 🔙 Returns a batch to the free list once the writer is done with it.
    pub fn give_back(&self, batch: HitBatch) {
        let mut free = self
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if free.len() < self.max_idle {
            free.push(batch);
        }
    }

    /// How many buffers have ever been allocated.
    pub fn allocated(&self) -> usize {
        self.next_slot.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
pub(crate) fn test_hit(id: &str, index: &str, source: &str, sort: Vec<Value>) -> Hit {
    Hit {
        id: id.to_string(),
        index: index.to_string(),
        source: Some(RawValue::from_string(source.to_string()).expect("💀 test source must be JSON")),
        sort,
    }
}
