//! The record store: cache, interning, read path, and commit entry point.
//!
//! A [`RecordStore`] owns three consistent views of every record — the
//! in-memory cache, the primary record hash, and the secondary tag indexes —
//! plus the canonical interned [`Ref`] per id and the monotone version
//! counter.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Callers                                │
//! │        reads (lock-free)            commits (async)             │
//! └───────────────┬────────────────────────────┬────────────────────┘
//!                 │                            │ mpsc
//!                 ▼                            ▼
//!        ┌─────────────────┐          ┌─────────────────┐
//!        │  cache / index  │◄─────────│   write actor   │
//!        │  (DashMap)      │  apply   │   (1 thread)    │
//!        └─────────────────┘          └────────┬────────┘
//!                                              │ MULTI/EXEC
//!                                              ▼
//!                                     ┌─────────────────┐
//!                                     │   ConnPool      │
//!                                     └─────────────────┘
//! ```
//!
//! Readers take cache entries atomically and get records by value; they may
//! race a commit and see the pre- or post-commit record, never a torn one.
//! All mutation funnels through the single write actor, which gives commits
//! a total order and keeps the version counter monotone.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::FolioConfig;
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::his::HistoryStore;
use crate::pool::ConnPool;
use crate::trio;
use crate::types::{Dict, Diff, ReadOpts, Ref, TagVal, DEFAULT_READ_LIMIT};
use crate::writer::{self, WriteRequest};

// =============================================================================
// Storage keys
// =============================================================================

pub(crate) const META_VERSION: &str = "meta:version";
pub(crate) const IDX_ALL: &str = "idx:all";

pub(crate) fn rec_key(id: &str) -> String {
    format!("rec:{}", id)
}

pub(crate) fn tag_key(name: &str) -> String {
    format!("idx:tag:{}", name)
}

pub(crate) fn his_key(id: &str) -> String {
    format!("his:{}", id)
}

/// Size of the write actor's mailbox; sends back-pressure once full.
const WRITE_CHANNEL_SIZE: usize = 256;

// =============================================================================
// Shared state
// =============================================================================

pub(crate) struct StoreInner {
    pub(crate) config: Arc<FolioConfig>,
    /// Authoritative working set: every non-destroyed record, trash included.
    pub(crate) cache: DashMap<Ref, Dict>,
    /// Canonical ref per id string.
    pub(crate) interned: DashMap<String, Ref>,
    /// In-memory mirror of the `idx:tag:{name}` sets.
    pub(crate) indexes: DashMap<String, HashSet<Ref>>,
    pub(crate) cur_ver: AtomicU64,
    pub(crate) pool: Arc<ConnPool>,
    write_tx: mpsc::Sender<WriteRequest>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    load_errors: AtomicU64,
}

impl StoreInner {
    /// Returns the canonical ref for an id, creating it if absent.
    ///
    /// A relative id (no `:` qualifier) is absolutized with the configured
    /// id prefix first.
    pub(crate) fn intern_ref(&self, id: &str) -> Ref {
        let key: String = match &self.config.id_prefix {
            Some(prefix) if !id.contains(':') => format!("{}{}", prefix, id),
            _ => id.to_string(),
        };
        if let Some(existing) = self.interned.get(&key) {
            return existing.value().clone();
        }
        let fresh = Ref::new(key.clone());
        self.interned.entry(key).or_insert(fresh).value().clone()
    }

    /// Replaces every nested ref with its canonical interned instance.
    pub(crate) fn normalize_refs(&self, dict: Dict) -> Dict {
        dict.iter()
            .map(|(name, val)| (name.to_string(), self.normalize_val(val.clone())))
            .collect()
    }

    fn normalize_val(&self, val: TagVal) -> TagVal {
        match val {
            TagVal::Ref(r) => TagVal::Ref(self.intern_ref(r.id())),
            TagVal::Dict(d) => TagVal::Dict(self.normalize_refs(d)),
            TagVal::List(items) => {
                TagVal::List(items.into_iter().map(|v| self.normalize_val(v)).collect())
            }
            other => other,
        }
    }

    /// Adds a record's tags to the in-memory index mirror.
    pub(crate) fn index_add(&self, id: &Ref, rec: &Dict) {
        for tag in rec.indexable_tags() {
            self.indexes
                .entry(tag.to_string())
                .or_default()
                .insert(id.clone());
        }
    }

    /// Removes a record's tags from the in-memory index mirror.
    pub(crate) fn index_remove(&self, id: &Ref, rec: &Dict) {
        for tag in rec.indexable_tags() {
            if let Some(mut members) = self.indexes.get_mut(tag) {
                members.remove(id);
            }
        }
    }
}

// =============================================================================
// RecordStore
// =============================================================================

/// The main store handle.
///
/// Cheap to clone; all clones share the same cache, pool, and write actor.
#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<StoreInner>,
}

impl RecordStore {
    /// Opens the store: connects, loads the full record set into the cache,
    /// and starts the write actor.
    ///
    /// Records that fail to decode are counted, logged, and dropped from the
    /// cache for this session; they remain in storage untouched.
    pub fn open(config: FolioConfig) -> Result<RecordStore> {
        let config = Arc::new(config);
        let pool = Arc::new(ConnPool::new(Arc::clone(&config)));

        // One bulk round-trip: version counter, the all-records set, then a
        // pipelined read of every record's encoding.
        let (ver, raw) = pool.with_conn(|c| {
            let ver = c
                .get(META_VERSION)?
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(1);
            let ids = c.smembers(IDX_ALL)?;
            c.pipeline_begin();
            for id in &ids {
                c.hget(&rec_key(id), "trio")?;
            }
            let replies = c.pipeline_end()?;
            Ok((ver, ids.into_iter().zip(replies).collect::<Vec<_>>()))
        })?;

        let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_SIZE);
        let inner = Arc::new(StoreInner {
            config: Arc::clone(&config),
            cache: DashMap::new(),
            interned: DashMap::new(),
            indexes: DashMap::new(),
            cur_ver: AtomicU64::new(ver.max(1)),
            pool,
            write_tx,
            writer_handle: Mutex::new(None),
            load_errors: AtomicU64::new(0),
        });

        let mut loaded = 0usize;
        for (id, reply) in raw {
            let bytes = match reply.into_bulk() {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    warn!(store = %config.name, id = %id, "record hash missing trio field");
                    inner.load_errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(e) => {
                    warn!(store = %config.name, id = %id, error = %e, "unreadable record reply");
                    inner.load_errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            let text = match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(store = %config.name, id = %id, "record encoding is not utf-8");
                    inner.load_errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            match trio::decode(&text) {
                Ok(dict) => {
                    let rec_ref = inner.intern_ref(&id);
                    let mut rec = inner.normalize_refs(dict);
                    rec.insert("id", TagVal::Ref(rec_ref.clone()));
                    inner.index_add(&rec_ref, &rec);
                    inner.cache.insert(rec_ref, rec);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(store = %config.name, id = %id, error = %e, "failed to decode record");
                    inner.load_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let handle = writer::spawn(Arc::clone(&inner), write_rx);
        *inner.writer_handle.lock().expect("writer handle mutex") = Some(handle);

        info!(
            store = %config.name,
            endpoint = %config.endpoint,
            recs = loaded,
            load_errors = inner.load_errors.load(Ordering::Relaxed),
            version = inner.cur_ver.load(Ordering::Relaxed),
            "record store open"
        );

        Ok(RecordStore { inner })
    }

    /// The store's diagnostic name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// The current version counter. Advances by exactly one per commit
    /// batch containing at least one non-transient diff.
    pub fn cur_ver(&self) -> u64 {
        self.inner.cur_ver.load(Ordering::Acquire)
    }

    /// Records dropped during startup because they failed to decode.
    pub fn load_error_count(&self) -> u64 {
        self.inner.load_errors.load(Ordering::Relaxed)
    }

    /// Returns the canonical interned ref for an id.
    ///
    /// Any two equal id strings yield the same shared instance for the
    /// lifetime of the store.
    pub fn intern_ref(&self, id: &str) -> Ref {
        self.inner.intern_ref(id)
    }

    /// The history collaborator for this store.
    pub fn his(&self) -> HistoryStore {
        HistoryStore::new(Arc::clone(&self.inner))
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Reads a record by id; soft-deleted records read as absent.
    pub fn read_by_id(&self, id: &Ref) -> Result<Dict> {
        self.read_by_id_opt(id)
            .ok_or_else(|| Error::UnknownRec(id.id().to_string()))
    }

    /// Reads a record by id, returning `None` when missing or trashed.
    pub fn read_by_id_opt(&self, id: &Ref) -> Option<Dict> {
        let interned = self.inner.intern_ref(id.id());
        let rec = self.inner.cache.get(&interned)?.value().clone();
        if rec.is_trash() {
            None
        } else {
            Some(rec)
        }
    }

    /// Batched read: a parallel list of records; the first unresolved id is
    /// reported in the error.
    pub fn read_by_ids(&self, ids: &[Ref]) -> Result<Vec<Dict>> {
        let mut recs = Vec::with_capacity(ids.len());
        let mut first_missing: Option<&Ref> = None;
        for id in ids {
            match self.read_by_id_opt(id) {
                Some(rec) => recs.push(rec),
                None => {
                    first_missing.get_or_insert(id);
                }
            }
        }
        match first_missing {
            None => Ok(recs),
            Some(id) => Err(Error::UnknownRec(id.id().to_string())),
        }
    }

    /// Query: all records matching the filter.
    ///
    /// Candidates come from the tag index when the filter is a bare
    /// identifier, otherwise the whole cache is scanned. Soft-deleted
    /// records are suppressed unless `opts.trash` is set; results are capped
    /// at `opts.limit` (default 10 000) and optionally sorted by display
    /// string.
    pub fn read_all(&self, filter: &Filter, opts: &ReadOpts) -> Vec<Dict> {
        let mut recs = Vec::new();
        self.read_each_while(filter, opts, |rec| {
            recs.push(rec.clone());
            None::<()>
        });
        if opts.sort {
            recs.sort_by_key(|rec| rec.dis().to_lowercase());
        }
        recs
    }

    /// Query: count only.
    pub fn read_count(&self, filter: &Filter, opts: &ReadOpts) -> usize {
        let mut count = 0usize;
        self.read_each_while(filter, opts, |_| {
            count += 1;
            None::<()>
        });
        count
    }

    /// Streaming query with early exit: `f` returns `Some` to stop, and that
    /// value is returned.
    pub fn read_each_while<T>(
        &self,
        filter: &Filter,
        opts: &ReadOpts,
        mut f: impl FnMut(&Dict) -> Option<T>,
    ) -> Option<T> {
        let limit = opts.limit.unwrap_or(DEFAULT_READ_LIMIT);
        let mut matched = 0usize;

        let mut visit = |rec: Dict| -> Option<Option<T>> {
            if !opts.trash && rec.is_trash() {
                return None;
            }
            if !filter.matches(&rec) {
                return None;
            }
            matched += 1;
            if let Some(out) = f(&rec) {
                return Some(Some(out));
            }
            if matched >= limit {
                return Some(None);
            }
            None
        };

        if let Some(tag) = filter.index_tag() {
            // Snapshot the candidate ids so no index shard lock is held
            // while the callback runs.
            let ids: Vec<Ref> = match self.inner.indexes.get(tag) {
                Some(members) => members.iter().cloned().collect(),
                None => Vec::new(),
            };
            for id in ids {
                let rec = match self.inner.cache.get(&id) {
                    Some(entry) => entry.value().clone(),
                    None => continue,
                };
                if let Some(out) = visit(rec) {
                    return out;
                }
            }
        } else {
            let ids: Vec<Ref> = self.inner.cache.iter().map(|e| e.key().clone()).collect();
            for id in ids {
                let rec = match self.inner.cache.get(&id) {
                    Some(entry) => entry.value().clone(),
                    None => continue,
                };
                if let Some(out) = visit(rec) {
                    return out;
                }
            }
        }
        None
    }

    // =========================================================================
    // Write path
    // =========================================================================

    /// Commits a batch of diffs atomically and returns the post-commit
    /// record per diff (the last known record for removes).
    ///
    /// The batch either persists whole or not at all; the cache is untouched
    /// until persistence succeeds. The returned future resolves when the
    /// write actor has finished the batch.
    pub async fn commit(&self, diffs: Vec<Diff>) -> Result<Vec<Dict>> {
        self.commit_cx(diffs, None).await
    }

    /// [`commit`](Self::commit) with a caller context label passed to hooks.
    pub async fn commit_cx(&self, diffs: Vec<Diff>, cx: Option<String>) -> Result<Vec<Dict>> {
        if diffs.is_empty() {
            return Ok(Vec::new());
        }
        writer::validate(&diffs)?;

        let (response_tx, response_rx) = oneshot::channel();
        self.inner
            .write_tx
            .send(WriteRequest::Commit {
                diffs,
                cx,
                response: response_tx,
            })
            .await
            .map_err(|_| Error::Commit("write actor has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Commit("write actor dropped response".to_string()))?
    }

    /// Commits a single diff.
    pub async fn commit_one(&self, diff: Diff) -> Result<Dict> {
        let mut recs = self.commit(vec![diff]).await?;
        recs.pop()
            .ok_or_else(|| Error::Commit("commit returned no record".to_string()))
    }

    // =========================================================================
    // Display resolution
    // =========================================================================

    /// Recomputes every record's display string and patches it into the
    /// interned refs.
    ///
    /// `dis` wins; otherwise a `disMacro` pattern is expanded with `$tag` /
    /// `${tag}` substitution (ref-valued tags recurse into the target
    /// record's display); otherwise `name`, otherwise the id. Expansion is
    /// memoized per pass and cycle-safe: each id is seeded with its own id
    /// string before recursion, and the computed result overwrites the seed.
    pub fn sync_dis(&self) {
        let ids: Vec<String> = self
            .inner
            .cache
            .iter()
            .map(|entry| entry.key().id().to_string())
            .collect();

        let mut memo: HashMap<String, String> = HashMap::new();
        for id in &ids {
            resolve_dis(&self.inner, id, &mut memo);
        }
        for (id, dis) in memo {
            if let Some(entry) = self.inner.interned.get(&id) {
                entry.value().set_dis(dis);
            }
        }
    }

    // =========================================================================
    // Unsupported surfaces
    // =========================================================================

    /// Backups run through the platform's file subsystem, not this engine.
    pub fn backup(&self) -> Result<()> {
        Err(Error::Unsupported("backup"))
    }

    /// Rewriting the id prefix of every stored record is not supported.
    pub fn rename_id_prefix(&self, _new_prefix: &str) -> Result<()> {
        Err(Error::Unsupported("id prefix rename"))
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stops the write actor and closes the pool. Commits submitted after
    /// close fail; reads keep serving the final cache state.
    pub async fn close(&self) {
        let _ = self.inner.write_tx.send(WriteRequest::Shutdown).await;
        let handle = self
            .inner
            .writer_handle
            .lock()
            .expect("writer handle mutex")
            .take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        self.inner.pool.close();
        info!(store = %self.inner.config.name, "record store closed");
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("name", &self.inner.config.name)
            .field("recs", &self.inner.cache.len())
            .field("ver", &self.cur_ver())
            .finish()
    }
}

// =============================================================================
// Display macro expansion
// =============================================================================

fn resolve_dis(inner: &StoreInner, id: &str, memo: &mut HashMap<String, String>) -> String {
    if let Some(done) = memo.get(id) {
        return done.clone();
    }
    // Seed with the id string so a macro cycle terminates with the default.
    memo.insert(id.to_string(), id.to_string());

    let rec = {
        let interned = match inner.interned.get(id) {
            Some(entry) => entry.value().clone(),
            None => return id.to_string(),
        };
        inner.cache.get(&interned).map(|entry| entry.value().clone())
    };

    let dis = match rec {
        None => id.to_string(),
        Some(rec) => {
            if let Some(s) = rec.get("dis").and_then(TagVal::as_str) {
                s.to_string()
            } else if let Some(pattern) = rec.get("disMacro").and_then(TagVal::as_str) {
                expand_dis_macro(pattern, &rec, inner, memo)
            } else if let Some(s) = rec.get("name").and_then(TagVal::as_str) {
                s.to_string()
            } else {
                id.to_string()
            }
        }
    };

    memo.insert(id.to_string(), dis.clone());
    dis
}

/// Expands `$tag` / `${tag}` references against the record's own tags.
fn expand_dis_macro(
    pattern: &str,
    rec: &Dict,
    inner: &StoreInner,
    memo: &mut HashMap<String, String>,
) -> String {
    let mut out = String::with_capacity(pattern.len());
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '$' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        i += 1;

        let (name, literal): (String, String) = if chars.get(i) == Some(&'{') {
            let start = i + 1;
            let mut end = start;
            while end < chars.len() && chars[end] != '}' {
                end += 1;
            }
            let name: String = chars[start..end].iter().collect();
            let literal = format!("${{{}}}", name);
            i = (end + 1).min(chars.len());
            (name, literal)
        } else {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let name: String = chars[start..i].iter().collect();
            let literal = format!("${}", name);
            (name, literal)
        };

        match rec.get(&name) {
            Some(TagVal::Ref(target)) => out.push_str(&resolve_dis(inner, target.id(), memo)),
            Some(val) => out.push_str(&val.dis()),
            None => out.push_str(&literal),
        }
    }
    out
}
