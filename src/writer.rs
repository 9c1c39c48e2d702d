//! The write actor: one thread owning the commit pipeline.
//!
//! Every mutation funnels through a single mailbox consumed by a dedicated
//! OS thread, which serializes commits, keeps the version counter monotone,
//! and is the only mutator of the cache and index mirror. Callers enqueue a
//! batch and await a oneshot reply.
//!
//! ## Commit procedure
//!
//! 1. Per-diff preparation: intern the id, look up the pre-commit record,
//!    check add/exists and the optimistic `mod` comparison.
//! 2. Stamp `new_mod = max(now, old_mod + 1 tick)` — strictly increasing
//!    even under clock slip.
//! 3. Materialize the new record: apply changes (remove-sentinel deletes),
//!    set `id`, set `mod` unless transient, intern nested refs.
//! 4. Pre-commit hooks; any error aborts the batch before storage is
//!    touched.
//! 5. Atomic persist (skipped when every diff is transient): one
//!    transaction covering record hashes, the all-records set, tag-index
//!    deltas, and the version counter. An aborted transaction surfaces as
//!    [`Error::ConcurrentChange`] with no cache effect.
//! 6. Cache apply and a single version-counter increment for the batch.
//! 7. Post-commit hooks; failures are logged, never rolled back.
//!
//! Hooks run on this thread: a hook that submits a commit synchronously
//! would deadlock the mailbox.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::CommitEvent;
use crate::error::{Error, Result};
use crate::store::{rec_key, tag_key, StoreInner, IDX_ALL, META_VERSION};
use crate::trio;
use crate::types::{is_never_tag, is_tag_name, to_millis, Dict, Diff, Ref, TagVal, MOD_TICK};
use crate::wire::WireClient;

// =============================================================================
// Requests
// =============================================================================

pub(crate) enum WriteRequest {
    Commit {
        diffs: Vec<Diff>,
        cx: Option<String>,
        response: oneshot::Sender<Result<Vec<Dict>>>,
    },
    Shutdown,
}

// =============================================================================
// Validation (caller's thread)
// =============================================================================

/// Rejects structurally illegal diffs before they reach the actor.
pub(crate) fn validate(diffs: &[Diff]) -> Result<()> {
    for diff in diffs {
        if diff.is_transient() && (diff.is_add() || diff.is_remove()) {
            return Err(Error::Commit(
                "transient diff cannot add or remove".to_string(),
            ));
        }
        if diff.is_add() && !Ref::is_valid_id(diff.id.id()) {
            return Err(Error::Commit(format!(
                "invalid rec id '{}'",
                diff.id.id()
            )));
        }
        for (name, _) in diff.changes.iter() {
            if name == "id" || name == "mod" {
                return Err(Error::Commit(format!(
                    "cannot set reserved tag '{}'",
                    name
                )));
            }
            if is_never_tag(name) {
                return Err(Error::Commit(format!(
                    "cannot set transient summary tag '{}'",
                    name
                )));
            }
            if !is_tag_name(name) {
                return Err(Error::Commit(format!("invalid tag name '{}'", name)));
            }
        }
    }
    Ok(())
}

// =============================================================================
// Actor
// =============================================================================

/// Spawns the write actor on a dedicated thread.
pub(crate) fn spawn(
    inner: Arc<StoreInner>,
    rx: mpsc::Receiver<WriteRequest>,
) -> JoinHandle<()> {
    let name = format!("{}-writer", inner.config.name);
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to create writer runtime");
            rt.block_on(run_writer(inner, rx));
        })
        .expect("failed to spawn writer thread")
}

async fn run_writer(inner: Arc<StoreInner>, mut rx: mpsc::Receiver<WriteRequest>) {
    while let Some(request) = rx.recv().await {
        match request {
            WriteRequest::Commit {
                diffs,
                cx,
                response,
            } => {
                let result = execute_commit(&inner, diffs, &cx);
                let _ = response.send(result);
            }
            WriteRequest::Shutdown => break,
        }
    }
    debug!(store = %inner.config.name, "write actor stopped");
}

// =============================================================================
// Commit pipeline
// =============================================================================

struct Prepared {
    /// Interned target id.
    id: Ref,
    diff: Diff,
    old: Option<Dict>,
    new: Dict,
}

fn execute_commit(
    inner: &StoreInner,
    diffs: Vec<Diff>,
    cx: &Option<String>,
) -> Result<Vec<Dict>> {
    // ---- prepare ----------------------------------------------------------
    let mut prepared = Vec::with_capacity(diffs.len());
    for diff in diffs {
        let id = inner.intern_ref(diff.id.id());
        let old = inner.cache.get(&id).map(|entry| entry.value().clone());

        if diff.is_add() {
            if old.is_some() {
                return Err(Error::AlreadyExists(id));
            }
        } else {
            let old_rec = match &old {
                Some(rec) => rec,
                None if diff.is_remove() => {
                    return Err(Error::Commit(format!(
                        "remove of nonexistent rec '{}'",
                        id.id()
                    )));
                }
                None => return Err(Error::UnknownRec(id.id().to_string())),
            };
            if !diff.is_force() {
                let actual = old_rec.mod_time();
                if actual != diff.old_mod {
                    return Err(Error::ConcurrentChange {
                        id: id.id().to_string(),
                        expected: diff.old_mod,
                        actual,
                    });
                }
            }
        }

        let new = if diff.is_remove() {
            // Kept only for hooks and the commit result.
            old.clone().unwrap_or_default()
        } else {
            materialize(inner, &id, old.as_ref(), &diff)
        };

        prepared.push(Prepared { id, diff, old, new });
    }

    // ---- pre-commit hooks -------------------------------------------------
    if let Some(hook) = &inner.config.hooks.pre_commit {
        for p in &prepared {
            hook(&CommitEvent {
                diff: p.diff.clone(),
                old_rec: p.old.clone(),
                cx: cx.clone(),
            })?;
        }
    }

    // ---- atomic persist ---------------------------------------------------
    let any_persistent = prepared.iter().any(|p| !p.diff.is_transient());
    if any_persistent {
        let new_ver = inner.cur_ver.load(Ordering::Acquire) + 1;
        inner.pool.with_conn(|c| {
            c.begin()?;
            if let Err(e) = queue_batch(c, &prepared, new_ver) {
                let _ = c.rollback();
                return Err(e);
            }
            match c.commit()? {
                Some(_) => Ok(()),
                None => Err(Error::ConcurrentChange {
                    id: prepared
                        .first()
                        .map(|p| p.id.id().to_string())
                        .unwrap_or_default(),
                    expected: None,
                    actual: None,
                }),
            }
        })?;
    }

    // ---- cache apply ------------------------------------------------------
    for p in &prepared {
        if let Some(old) = &p.old {
            inner.index_remove(&p.id, old);
        }
        if p.diff.is_remove() {
            inner.cache.remove(&p.id);
        } else {
            inner.index_add(&p.id, &p.new);
            inner.cache.insert(p.id.clone(), p.new.clone());
        }
    }
    if any_persistent {
        inner.cur_ver.fetch_add(1, Ordering::AcqRel);
    }

    // ---- post-commit hooks ------------------------------------------------
    if let Some(hook) = &inner.config.hooks.post_commit {
        for p in &prepared {
            let event = CommitEvent {
                diff: p.diff.clone(),
                old_rec: p.old.clone(),
                cx: cx.clone(),
            };
            if let Err(e) = hook(&event) {
                warn!(
                    store = %inner.config.name,
                    id = %p.id.id(),
                    error = %e,
                    "post-commit hook failed"
                );
            }
        }
    }

    Ok(prepared.into_iter().map(|p| p.new).collect())
}

/// Builds the post-commit record for an add or update diff.
fn materialize(inner: &StoreInner, id: &Ref, old: Option<&Dict>, diff: &Diff) -> Dict {
    let mut rec = old.cloned().unwrap_or_default();
    for (name, val) in diff.changes.iter() {
        if val.is_remove() {
            rec.remove(name);
        } else {
            rec.insert(name, val.clone());
        }
    }
    rec.insert("id", TagVal::Ref(id.clone()));
    if !diff.is_transient() {
        let now = to_millis(Utc::now());
        let tick = chrono::Duration::milliseconds(MOD_TICK.as_millis() as i64);
        let new_mod = match old.and_then(Dict::mod_time) {
            Some(old_mod) => now.max(old_mod + tick),
            None => now,
        };
        rec.insert("mod", TagVal::DateTime(new_mod.with_timezone(&chrono_tz::UTC)));
    }
    inner.normalize_refs(rec)
}

/// Strips the cache-only history summary tags from the persisted form.
fn persistable(rec: &Dict) -> Dict {
    rec.iter()
        .filter(|&(name, _)| !is_never_tag(name))
        .map(|(name, val)| (name.to_string(), val.clone()))
        .collect()
}

/// Queues the storage operations for one batch inside an open transaction.
fn queue_batch(c: &mut WireClient, prepared: &[Prepared], new_ver: u64) -> Result<()> {
    for p in prepared {
        if p.diff.is_transient() {
            continue;
        }
        let id = p.id.id();
        if p.diff.is_remove() {
            c.del(&rec_key(id))?;
            c.srem(IDX_ALL, id)?;
            if let Some(old) = &p.old {
                for tag in old.indexable_tags() {
                    c.srem(&tag_key(tag), id)?;
                }
            }
        } else {
            let encoded = trio::encode(&persistable(&p.new));
            c.hset(&rec_key(id), "trio", encoded.as_bytes())?;
            let stamp = p
                .new
                .mod_time()
                .map(|m| m.timestamp_millis())
                .unwrap_or_default()
                .to_string();
            c.hset(&rec_key(id), "mod", stamp.as_bytes())?;
            c.sadd(IDX_ALL, id)?;
            for tag in p.new.indexable_tags() {
                let added = p.old.as_ref().map_or(true, |old| !old.has(tag));
                if added {
                    c.sadd(&tag_key(tag), id)?;
                }
            }
            if let Some(old) = &p.old {
                for tag in old.indexable_tags() {
                    if !p.new.has(tag) {
                        c.srem(&tag_key(tag), id)?;
                    }
                }
            }
        }
    }
    c.set(META_VERSION, new_ver.to_string().as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_transient_add_and_remove() {
        let add = Diff::add(Ref::new("a"), Dict::new().set_marker("site")).transient();
        assert!(matches!(validate(&[add]), Err(Error::Commit(_))));

        let old = Dict::new().set("id", Ref::new("a"));
        let remove = Diff::remove(&old).unwrap().transient();
        assert!(matches!(validate(&[remove]), Err(Error::Commit(_))));
    }

    #[test]
    fn test_validate_rejects_reserved_tags() {
        let old = Dict::new().set("id", Ref::new("a"));

        let set_id = Diff::update(&old, Dict::new().set("id", Ref::new("b"))).unwrap();
        assert!(validate(&[set_id]).is_err());

        let set_mod = Diff::update(
            &old,
            Dict::new().set("mod", Utc::now().with_timezone(&chrono_tz::UTC)),
        )
        .unwrap();
        assert!(validate(&[set_mod]).is_err());

        let set_summary = Diff::update(&old, Dict::new().set("hisSize", 5.0)).unwrap();
        assert!(validate(&[set_summary]).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_names_and_ids() {
        let bad_id = Diff::add(Ref::new("has space"), Dict::new());
        assert!(validate(&[bad_id]).is_err());

        let old = Dict::new().set("id", Ref::new("a"));
        let bad_tag = Diff::update(&old, Dict::new().set("Bad", 1.0)).unwrap();
        assert!(validate(&[bad_tag]).is_err());
    }

    #[test]
    fn test_validate_accepts_normal_batch() {
        let add = Diff::add(
            Ref::new("a"),
            Dict::new().set_marker("site").set("dis", "A"),
        );
        let old = Dict::new().set("id", Ref::new("b"));
        let update = Diff::update(&old, Dict::new().set("gone", TagVal::Remove)).unwrap();
        assert!(validate(&[add, update]).is_ok());
    }
}
