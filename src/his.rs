//! Per-record time-series storage.
//!
//! Each historized point owns one sorted set keyed `his:{id}`, scored by the
//! UTC timestamp in whole milliseconds and valued by the encoded item dict.
//! Timestamps are unique per record; a write at an existing timestamp
//! overwrites the stored value (delete-then-add, since sorted-set members
//! are keyed by value, not score).
//!
//! History operations may run from any thread: each call borrows its own
//! pooled session and never shares a connection with the commit pipeline —
//! history writes land outside commit transactions, and ordering against
//! commits on the same record is not guaranteed. Callers needing a barrier
//! submit a no-op transient commit; callers needing serial appends
//! serialize externally.
//!
//! After a write (and after a full span-less read) the host record's
//! transient summary tags `hisSize`, `hisStart(+Val)`, `hisEnd(+Val)` are
//! patched directly into the cache using the host's *current* `tz` tag, so
//! a retagged timezone reflows the summaries on the next full read. This is
//! a deliberate non-diff cache write — the summary tags are never persisted
//! and never participate in commit semantics.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, warn};

use crate::config::HisWriteEvent;
use crate::error::{Error, Result};
use crate::filter::his_write_check;
use crate::store::{his_key, StoreInner};
use crate::trio;
use crate::types::{
    Dict, HisItem, HisReadOpts, HisWriteOpts, HisWriteResult, Number, Ref, Span, TagVal,
};

/// Time-series collaborator of a record store.
///
/// Obtained via [`RecordStore::his`](crate::store::RecordStore::his); cheap
/// to clone.
#[derive(Clone)]
pub struct HistoryStore {
    inner: Arc<StoreInner>,
}

impl HistoryStore {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        HistoryStore { inner }
    }

    // =========================================================================
    // Read
    // =========================================================================

    /// Emits history items in ascending timestamp order; returns how many
    /// were emitted.
    ///
    /// Without a span, every item is emitted up to `opts.limit` (items after
    /// now are skipped when `opts.clip_future` is set), and the host
    /// record's summary tags are refreshed in the cache as a side effect of
    /// the read.
    ///
    /// With a span, emission is the single latest item strictly before
    /// `span.start` (if any), then every item in `[span.start, span.end)`,
    /// then up to two items at or after `span.end` — the continuity policy
    /// trend windows expect across boundaries.
    ///
    /// Per item, the timestamp is converted to the host's current timezone,
    /// and a unitless number picks up the host's `unit` tag.
    pub fn read(
        &self,
        id: &Ref,
        span: Option<Span>,
        opts: &HisReadOpts,
        mut emit: impl FnMut(HisItem),
    ) -> Result<usize> {
        let (host_ref, host) = self.host(id)?;
        let tz = host.tz();
        let unit = host
            .get("unit")
            .and_then(TagVal::as_str)
            .map(|u| u.to_string());
        let key = his_key(host_ref.id());

        match span {
            None => {
                let members = self
                    .inner
                    .pool
                    .with_conn(|c| c.zrange_by_score(&key, "-inf", "+inf", None))?;
                let mut items = Vec::with_capacity(members.len());
                for member in members {
                    items.push(decode_item(member)?);
                }

                let first = items.first().cloned();
                let last = items.last().cloned();
                let total = items.len();

                let now = Utc::now();
                let limit = opts.limit.unwrap_or(usize::MAX);
                let mut count = 0usize;
                for item in items {
                    if opts.clip_future && item.ts.with_timezone(&Utc) > now {
                        continue;
                    }
                    if count >= limit {
                        break;
                    }
                    emit(convert(item, tz, &unit));
                    count += 1;
                }

                self.apply_summary(&host_ref, total, first, last, tz);
                Ok(count)
            }
            Some(span) => {
                let start = span.start_ms();
                let end = span.end_ms();
                let (prev, window, next) = self.inner.pool.with_conn(|c| {
                    let prev = c.zrev_range_by_score(
                        &key,
                        &format!("({}", start),
                        "-inf",
                        Some((0, 1)),
                    )?;
                    let window =
                        c.zrange_by_score(&key, &start.to_string(), &format!("({}", end), None)?;
                    let next =
                        c.zrange_by_score(&key, &end.to_string(), "+inf", Some((0, 2)))?;
                    Ok((prev, window, next))
                })?;

                let mut count = 0usize;
                for member in prev
                    .into_iter()
                    .rev()
                    .chain(window.into_iter())
                    .chain(next.into_iter())
                {
                    emit(convert(decode_item(member)?, tz, &unit));
                    count += 1;
                }
                Ok(count)
            }
        }
    }

    /// Convenience wrapper collecting a read into a vec.
    pub fn read_all(
        &self,
        id: &Ref,
        span: Option<Span>,
        opts: &HisReadOpts,
    ) -> Result<Vec<HisItem>> {
        let mut items = Vec::new();
        self.read(id, span, opts, |item| items.push(item))?;
        Ok(items)
    }

    // =========================================================================
    // Write
    // =========================================================================

    /// Appends or overwrites items; see [`write_cx`](Self::write_cx).
    pub fn write(
        &self,
        id: &Ref,
        items: &[HisItem],
        opts: &HisWriteOpts,
    ) -> Result<HisWriteResult> {
        self.write_cx(id, items, opts, None)
    }

    /// Appends or overwrites items on a historized point.
    ///
    /// Items are validated against the host's value-kind constraints first.
    /// `opts.clear_all` deletes the whole series before writing;
    /// `opts.clear` deletes the score range `[start ms, end ms − 1]`. An
    /// item whose value is the remove sentinel deletes any item at exactly
    /// that timestamp; every other item lands last-write-wins at its
    /// millisecond score.
    ///
    /// The write is not transactional: it fails as a whole even if some
    /// items were already queued, and the only observable guarantee is that
    /// the host's summary tags reflect the post-write set. The bounding
    /// span of the result covers the written items, end-exclusive.
    pub fn write_cx(
        &self,
        id: &Ref,
        items: &[HisItem],
        opts: &HisWriteOpts,
        cx: Option<String>,
    ) -> Result<HisWriteResult> {
        let (host_ref, host) = self.host(id)?;
        for item in items {
            his_write_check(&host, item)?;
        }

        let key = his_key(host_ref.id());
        let mut count = 0usize;
        let mut min_ts: Option<DateTime<Utc>> = None;
        let mut max_ts: Option<DateTime<Utc>> = None;

        let (size, first, last) = self.inner.pool.with_conn(|c| {
            if opts.clear_all {
                c.del(&key)?;
            }
            if let Some(clear) = &opts.clear {
                c.zrem_range_by_score(
                    &key,
                    &clear.start_ms().to_string(),
                    &(clear.end_ms() - 1).to_string(),
                )?;
            }

            for item in items {
                let ts_ms = item.ts_ms();
                c.zrem_range_by_score(&key, &ts_ms.to_string(), &ts_ms.to_string())?;
                if item.val.is_remove() {
                    continue;
                }
                let encoded = encode_item(item);
                c.zadd(&key, ts_ms, encoded.as_bytes())?;
                count += 1;
                let ts_utc = item.ts.with_timezone(&Utc);
                min_ts = Some(min_ts.map_or(ts_utc, |m| m.min(ts_utc)));
                max_ts = Some(max_ts.map_or(ts_utc, |m| m.max(ts_utc)));
            }

            let size = c.zcard(&key)? as usize;
            let first = c
                .zrange_by_score(&key, "-inf", "+inf", Some((0, 1)))?
                .pop()
                .map(decode_item)
                .transpose()?;
            let last = c
                .zrev_range_by_score(&key, "+inf", "-inf", Some((0, 1)))?
                .pop()
                .map(decode_item)
                .transpose()?;
            Ok((size, first, last))
        })?;

        let tz = host.tz();
        self.apply_summary(&host_ref, size, first, last, tz);

        let result = HisWriteResult {
            count,
            span: min_ts.zip(max_ts).map(|(min, max)| {
                Span::new(min, max + chrono::Duration::milliseconds(1))
            }),
        };

        debug!(
            store = %self.inner.config.name,
            id = %host_ref.id(),
            count = result.count,
            size,
            "history write"
        );

        if let Some(hook) = &self.inner.config.hooks.post_his_write {
            let rec = self
                .inner
                .cache
                .get(&host_ref)
                .map(|entry| entry.value().clone())
                .unwrap_or(host);
            let event = HisWriteEvent {
                rec,
                result: result.clone(),
                cx,
            };
            if let Err(e) = hook(&event) {
                warn!(
                    store = %self.inner.config.name,
                    id = %host_ref.id(),
                    error = %e,
                    "post-history-write hook failed"
                );
            }
        }

        Ok(result)
    }

    // =========================================================================
    // Host gate and summary tags
    // =========================================================================

    /// Looks up the host record and checks its history configuration.
    fn host(&self, id: &Ref) -> Result<(Ref, Dict)> {
        let interned = self.inner.intern_ref(id.id());
        let rec = self
            .inner
            .cache
            .get(&interned)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownRec(interned.id().to_string()))?;

        let fail = |reason: &str| Error::HisConfig {
            id: interned.id().to_string(),
            reason: reason.to_string(),
        };
        if !rec.has("point") {
            return Err(fail("missing point marker"));
        }
        if !rec.has("his") {
            return Err(fail("missing his marker"));
        }
        if rec.has("aux") {
            return Err(fail("aux point is not historized"));
        }
        if rec.is_trash() {
            return Err(fail("rec is trash"));
        }
        Ok((interned, rec))
    }

    /// Patches the host's transient summary tags directly into the cache.
    fn apply_summary(
        &self,
        host_ref: &Ref,
        size: usize,
        first: Option<HisItem>,
        last: Option<HisItem>,
        tz: Tz,
    ) {
        if let Some(mut entry) = self.inner.cache.get_mut(host_ref) {
            let rec = entry.value_mut();
            rec.insert("hisSize", TagVal::Num(Number::new(size as f64)));
            match first {
                Some(item) => {
                    rec.insert("hisStart", TagVal::DateTime(item.ts.with_timezone(&tz)));
                    rec.insert("hisStartVal", item.val);
                }
                None => {
                    rec.remove("hisStart");
                    rec.remove("hisStartVal");
                }
            }
            match last {
                Some(item) => {
                    rec.insert("hisEnd", TagVal::DateTime(item.ts.with_timezone(&tz)));
                    rec.insert("hisEndVal", item.val);
                }
                None => {
                    rec.remove("hisEnd");
                    rec.remove("hisEndVal");
                }
            }
        }
    }
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("store", &self.inner.config.name)
            .finish()
    }
}

// =============================================================================
// Item codec
// =============================================================================

fn encode_item(item: &HisItem) -> String {
    trio::encode(&Dict::new().set("ts", item.ts).set("val", item.val.clone()))
}

fn decode_item(member: Vec<u8>) -> Result<HisItem> {
    let text = String::from_utf8(member).map_err(|_| Error::Encoding {
        line: 0,
        msg: "history item is not utf-8".to_string(),
    })?;
    let dict = trio::decode(&text)?;
    let ts = dict
        .get("ts")
        .and_then(TagVal::as_datetime)
        .copied()
        .ok_or_else(|| Error::Encoding {
            line: 0,
            msg: "history item missing ts".to_string(),
        })?;
    let val = dict.get("val").cloned().ok_or_else(|| Error::Encoding {
        line: 0,
        msg: "history item missing val".to_string(),
    })?;
    Ok(HisItem { ts, val })
}

/// Rezones an item into the host timezone and attaches the host unit to
/// unitless numbers.
fn convert(item: HisItem, tz: Tz, unit: &Option<String>) -> HisItem {
    let ts = item.ts.with_timezone(&tz);
    let val = match item.val {
        TagVal::Num(n) if n.unit.is_none() => match unit {
            Some(u) => TagVal::Num(Number::with_unit(n.val, u.clone())),
            None => TagVal::Num(n),
        },
        other => other,
    };
    HisItem { ts, val }
}
