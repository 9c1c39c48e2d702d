//! Domain types for the folio engine.
//!
//! Records are dictionaries of named tags ([`Dict`]), identified by interned
//! references ([`Ref`]) and mutated through declarative change descriptions
//! ([`Diff`]). Historized points carry time-stamped samples ([`HisItem`])
//! addressed by half-open time ranges ([`Span`]).
//!
//! ## Invariants
//!
//! - A record's `id` tag always equals its cache key.
//! - `mod` is stamped by the commit pipeline and is strictly increasing per
//!   record across non-transient commits.
//! - `Ref` equality, ordering, and hashing use the id string only; the
//!   display slot is presentation state and never participates in identity.
//! - [`TagVal::Remove`] appears only inside diff change sets, never in a
//!   stored record.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

// =============================================================================
// Ref
// =============================================================================

/// An opaque, immutable record identifier.
///
/// Refs are interned: a [`RecordStore`](crate::store::RecordStore) guarantees
/// one shared instance per id string, so clones are cheap pointer copies.
/// Each ref carries a mutable display-string slot that display resolution
/// patches out-of-band; equality and hashing ignore it.
#[derive(Clone)]
pub struct Ref(Arc<RefInner>);

struct RefInner {
    id: String,
    dis: RwLock<Option<String>>,
}

impl Ref {
    /// Creates a new, un-interned ref.
    ///
    /// Most callers should obtain refs from the store (which interns them);
    /// this constructor exists for building diffs and tests.
    pub fn new(id: impl Into<String>) -> Self {
        Ref(Arc::new(RefInner {
            id: id.into(),
            dis: RwLock::new(None),
        }))
    }

    /// The id string.
    pub fn id(&self) -> &str {
        &self.0.id
    }

    /// The display string: the patched slot if set, otherwise the id.
    pub fn dis(&self) -> String {
        match self.0.dis.read() {
            Ok(guard) => guard.clone().unwrap_or_else(|| self.0.id.clone()),
            Err(_) => self.0.id.clone(),
        }
    }

    /// Patches the display slot in place.
    ///
    /// Used by display resolution; all holders of this interned instance
    /// observe the new string.
    pub fn set_dis(&self, dis: impl Into<String>) {
        if let Ok(mut guard) = self.0.dis.write() {
            *guard = Some(dis.into());
        }
    }

    /// True when the id has no `prefix:` qualifier.
    pub fn is_relative(&self) -> bool {
        !self.0.id.contains(':')
    }

    /// True when every character is legal in a ref id.
    pub fn is_valid_id(id: &str) -> bool {
        !id.is_empty()
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b':' | b'-' | b'.' | b'~'))
    }
}

impl PartialEq for Ref {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Ref {}

impl Hash for Ref {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl PartialOrd for Ref {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ref {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.id.cmp(&other.0.id)
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0.id)
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dis())
    }
}

// =============================================================================
// Scalar payloads
// =============================================================================

/// A number with an optional unit symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct Number {
    pub val: f64,
    pub unit: Option<String>,
}

impl Number {
    pub fn new(val: f64) -> Self {
        Number { val, unit: None }
    }

    pub fn with_unit(val: f64, unit: impl Into<String>) -> Self {
        Number {
            val,
            unit: Some(unit.into()),
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.unit {
            Some(unit) => write!(f, "{}{}", self.val, unit),
            None => write!(f, "{}", self.val),
        }
    }
}

/// A geographic coordinate in decimal degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct Coord {
    pub lat: f64,
    pub lng: f64,
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C({},{})", self.lat, self.lng)
    }
}

// =============================================================================
// TagVal
// =============================================================================

/// A tag value: the tagged union of every kind a record may store.
///
/// [`TagVal::Remove`] is the diff-only sentinel that deletes a tag; it never
/// appears in a stored record.
#[derive(Debug, Clone, PartialEq)]
pub enum TagVal {
    Marker,
    Remove,
    Bool(bool),
    Num(Number),
    Str(String),
    DateTime(DateTime<Tz>),
    Date(NaiveDate),
    Time(NaiveTime),
    Ref(Ref),
    Uri(String),
    Coord(Coord),
    Bytes(Vec<u8>),
    Dict(Dict),
    List(Vec<TagVal>),
}

impl TagVal {
    pub fn is_marker(&self) -> bool {
        matches!(self, TagVal::Marker)
    }

    pub fn is_remove(&self) -> bool {
        matches!(self, TagVal::Remove)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagVal::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<&Number> {
        match self {
            TagVal::Num(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_ref_val(&self) -> Option<&Ref> {
        match self {
            TagVal::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<&DateTime<Tz>> {
        match self {
            TagVal::DateTime(dt) => Some(dt),
            _ => None,
        }
    }

    /// Kind name used by history value-kind checks.
    pub fn kind_name(&self) -> &'static str {
        match self {
            TagVal::Marker => "Marker",
            TagVal::Remove => "Remove",
            TagVal::Bool(_) => "Bool",
            TagVal::Num(_) => "Number",
            TagVal::Str(_) => "Str",
            TagVal::DateTime(_) => "DateTime",
            TagVal::Date(_) => "Date",
            TagVal::Time(_) => "Time",
            TagVal::Ref(_) => "Ref",
            TagVal::Uri(_) => "Uri",
            TagVal::Coord(_) => "Coord",
            TagVal::Bytes(_) => "Bin",
            TagVal::Dict(_) => "Dict",
            TagVal::List(_) => "List",
        }
    }

    /// A display rendering used by macro expansion and sorting.
    pub fn dis(&self) -> String {
        match self {
            TagVal::Marker => String::from("\u{2713}"),
            TagVal::Remove => String::from("remove"),
            TagVal::Bool(b) => b.to_string(),
            TagVal::Num(n) => n.to_string(),
            TagVal::Str(s) => s.clone(),
            TagVal::DateTime(dt) => dt.to_rfc3339(),
            TagVal::Date(d) => d.to_string(),
            TagVal::Time(t) => t.to_string(),
            TagVal::Ref(r) => r.dis(),
            TagVal::Uri(u) => u.clone(),
            TagVal::Coord(c) => c.to_string(),
            TagVal::Bytes(b) => format!("Bin({} bytes)", b.len()),
            TagVal::Dict(_) => String::from("{..}"),
            TagVal::List(items) => format!("[{} items]", items.len()),
        }
    }
}

impl From<bool> for TagVal {
    fn from(b: bool) -> Self {
        TagVal::Bool(b)
    }
}

impl From<f64> for TagVal {
    fn from(n: f64) -> Self {
        TagVal::Num(Number::new(n))
    }
}

impl From<&str> for TagVal {
    fn from(s: &str) -> Self {
        TagVal::Str(s.to_string())
    }
}

impl From<String> for TagVal {
    fn from(s: String) -> Self {
        TagVal::Str(s)
    }
}

impl From<Number> for TagVal {
    fn from(n: Number) -> Self {
        TagVal::Num(n)
    }
}

impl From<Ref> for TagVal {
    fn from(r: Ref) -> Self {
        TagVal::Ref(r)
    }
}

impl From<DateTime<Tz>> for TagVal {
    fn from(dt: DateTime<Tz>) -> Self {
        TagVal::DateTime(dt)
    }
}

// =============================================================================
// Dict
// =============================================================================

/// Reserved summary tags maintained by the history subsystem.
///
/// These live only in the cache, are never persisted, and are rejected in
/// diff change sets.
pub const NEVER_TAGS: &[&str] = &["hisSize", "hisStart", "hisStartVal", "hisEnd", "hisEndVal"];

/// True for tags that may not appear in a diff change set.
pub fn is_never_tag(name: &str) -> bool {
    NEVER_TAGS.contains(&name)
}

/// True for a legal tag name: lowercase letter, then letters/digits/underscore.
pub fn is_tag_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_lowercase() => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// An ordered mapping from tag name to [`TagVal`].
///
/// The unit of storage, indexing, and diffing. Dicts are value types: reads
/// return them by value and the cache replaces them wholesale, so a caller
/// never observes a half-mutated record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dict {
    tags: BTreeMap<String, TagVal>,
}

impl Dict {
    pub fn new() -> Self {
        Dict::default()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&TagVal> {
        self.tags.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    /// Builder-style insert.
    pub fn set(mut self, name: impl Into<String>, val: impl Into<TagVal>) -> Self {
        self.tags.insert(name.into(), val.into());
        self
    }

    /// Builder-style marker insert.
    pub fn set_marker(self, name: impl Into<String>) -> Self {
        self.set(name, TagVal::Marker)
    }

    pub fn insert(&mut self, name: impl Into<String>, val: impl Into<TagVal>) {
        self.tags.insert(name.into(), val.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<TagVal> {
        self.tags.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TagVal)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Tag names excluding the distinguished `id` and `mod` tags and the
    /// cache-only history summary tags.
    ///
    /// These are exactly the names maintained in the secondary tag indexes.
    pub fn indexable_tags(&self) -> impl Iterator<Item = &str> {
        self.tags
            .keys()
            .map(|k| k.as_str())
            .filter(|k| *k != "id" && *k != "mod" && !is_never_tag(k))
    }

    /// The `id` tag, when present and a ref.
    pub fn id(&self) -> Option<&Ref> {
        self.get("id").and_then(TagVal::as_ref_val)
    }

    /// The `mod` stamp in UTC, when present.
    pub fn mod_time(&self) -> Option<DateTime<Utc>> {
        self.get("mod")
            .and_then(TagVal::as_datetime)
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// True when the record is soft-deleted.
    pub fn is_trash(&self) -> bool {
        self.has("trash")
    }

    /// The record's display string: `dis`, else `name`, else the id string,
    /// else empty. Macro expansion happens in display resolution, not here.
    pub fn dis(&self) -> String {
        if let Some(s) = self.get("dis").and_then(TagVal::as_str) {
            return s.to_string();
        }
        if let Some(s) = self.get("name").and_then(TagVal::as_str) {
            return s.to_string();
        }
        match self.id() {
            Some(r) => r.id().to_string(),
            None => String::new(),
        }
    }

    /// The record's timezone per its `tz` tag, defaulting to UTC.
    pub fn tz(&self) -> Tz {
        self.get("tz")
            .and_then(TagVal::as_str)
            .and_then(tz_by_name)
            .unwrap_or(chrono_tz::UTC)
    }
}

impl FromIterator<(String, TagVal)> for Dict {
    fn from_iter<I: IntoIterator<Item = (String, TagVal)>>(iter: I) -> Self {
        Dict {
            tags: iter.into_iter().collect(),
        }
    }
}

// =============================================================================
// Timezone resolution
// =============================================================================

/// Resolves a timezone by short city name (`New_York`) or full IANA name
/// (`America/New_York`).
pub fn tz_by_name(name: &str) -> Option<Tz> {
    if let Ok(tz) = name.parse::<Tz>() {
        return Some(tz);
    }
    chrono_tz::TZ_VARIANTS
        .iter()
        .copied()
        .find(|tz| tz.name().rsplit('/').next() == Some(name))
}

/// The short city name of a timezone (`America/New_York` → `New_York`).
pub fn tz_short_name(tz: Tz) -> &'static str {
    tz.name().rsplit('/').next().unwrap_or(tz.name())
}

// =============================================================================
// Span
// =============================================================================

/// A half-open time interval `[start, end)` with millisecond resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Span {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Span {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Span { start, end }
    }

    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_ms(&self) -> i64 {
        self.end.timestamp_millis()
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

// =============================================================================
// HisItem
// =============================================================================

/// A single time-stamped sample of a historized point.
///
/// Timestamps are unique per record; writing an item at an existing
/// timestamp overwrites the stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct HisItem {
    pub ts: DateTime<Tz>,
    pub val: TagVal,
}

impl HisItem {
    pub fn new(ts: DateTime<Tz>, val: impl Into<TagVal>) -> Self {
        HisItem {
            ts,
            val: val.into(),
        }
    }

    pub fn ts_ms(&self) -> i64 {
        self.ts.timestamp_millis()
    }
}

// =============================================================================
// Diff
// =============================================================================

/// A declarative change to one record.
///
/// Built with [`Diff::add`], [`Diff::update`], or [`Diff::remove`], then
/// optionally flagged [`transient`](Diff::transient) or
/// [`force`](Diff::force). A change-set value of [`TagVal::Remove`] deletes
/// that tag; everything else replaces it.
///
/// A non-force update carries the `mod` the caller last read; the commit
/// pipeline rejects the diff with [`Error::ConcurrentChange`] when the
/// record has moved on since.
///
/// [`Error::ConcurrentChange`]: crate::error::Error::ConcurrentChange
#[derive(Debug, Clone)]
pub struct Diff {
    pub id: Ref,
    pub old_mod: Option<DateTime<Utc>>,
    pub changes: Dict,
    is_add: bool,
    is_remove: bool,
    is_transient: bool,
    is_force: bool,
}

impl Diff {
    /// Creates a record. The id is assigned by the caller; `mod` is stamped
    /// by the commit pipeline.
    pub fn add(id: Ref, changes: Dict) -> Self {
        Diff {
            id,
            old_mod: None,
            changes,
            is_add: true,
            is_remove: false,
            is_transient: false,
            is_force: false,
        }
    }

    /// Updates an existing record, carrying its current `mod` for the
    /// concurrency check.
    ///
    /// Fails with `Error::Commit` when `old` has no `id` tag.
    pub fn update(old: &Dict, changes: Dict) -> crate::error::Result<Self> {
        let id = old
            .id()
            .cloned()
            .ok_or_else(|| crate::error::Error::Commit("update target has no id tag".into()))?;
        Ok(Diff {
            id,
            old_mod: old.mod_time(),
            changes,
            is_add: false,
            is_remove: false,
            is_transient: false,
            is_force: false,
        })
    }

    /// Destroys an existing record.
    pub fn remove(old: &Dict) -> crate::error::Result<Self> {
        let id = old
            .id()
            .cloned()
            .ok_or_else(|| crate::error::Error::Commit("remove target has no id tag".into()))?;
        Ok(Diff {
            id,
            old_mod: old.mod_time(),
            changes: Dict::new(),
            is_add: false,
            is_remove: true,
            is_transient: false,
            is_force: false,
        })
    }

    /// Marks the diff cache-only: not persisted, `mod` not advanced, version
    /// counter untouched. May not combine with add or remove.
    pub fn transient(mut self) -> Self {
        self.is_transient = true;
        self
    }

    /// Skips the optimistic-concurrency check.
    pub fn force(mut self) -> Self {
        self.is_force = true;
        self
    }

    pub fn is_add(&self) -> bool {
        self.is_add
    }

    pub fn is_remove(&self) -> bool {
        self.is_remove
    }

    pub fn is_transient(&self) -> bool {
        self.is_transient
    }

    pub fn is_force(&self) -> bool {
        self.is_force
    }
}

// =============================================================================
// Read / history options
// =============================================================================

/// Default cap on query results.
pub const DEFAULT_READ_LIMIT: usize = 10_000;

/// Options for the query read path.
#[derive(Debug, Clone, Default)]
pub struct ReadOpts {
    /// Maximum results; defaults to [`DEFAULT_READ_LIMIT`].
    pub limit: Option<usize>,
    /// Include soft-deleted records.
    pub trash: bool,
    /// Sort results by display string (case-insensitive).
    pub sort: bool,
}

impl ReadOpts {
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn trash(mut self) -> Self {
        self.trash = true;
        self
    }

    pub fn sort(mut self) -> Self {
        self.sort = true;
        self
    }
}

/// Options for history reads.
#[derive(Debug, Clone, Default)]
pub struct HisReadOpts {
    /// Maximum items emitted on a span-less read.
    pub limit: Option<usize>,
    /// Skip items stamped after now.
    pub clip_future: bool,
}

/// Options for history writes.
#[derive(Debug, Clone, Default)]
pub struct HisWriteOpts {
    /// Delete the record's entire series before writing.
    pub clear_all: bool,
    /// Delete the score range `[start ms, end ms − 1]` before writing: the
    /// end millisecond is excluded, matching a half-open span at millisecond
    /// resolution.
    pub clear: Option<Span>,
}

/// Summary of a completed history write.
#[derive(Debug, Clone, PartialEq)]
pub struct HisWriteResult {
    /// Items written (removals excluded).
    pub count: usize,
    /// Bounding span of the written items.
    pub span: Option<Span>,
}

// =============================================================================
// Misc
// =============================================================================

/// One tick of the `mod` clock: commits stamp
/// `new_mod = max(now, old_mod + tick)` so stamps stay strictly increasing
/// even when the wall clock slips backwards.
pub const MOD_TICK: Duration = Duration::from_millis(1);

/// Truncates a UTC instant to whole milliseconds, the resolution of stored
/// stamps and history scores.
pub fn to_millis(dt: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(dt.timestamp_millis())
        .single()
        .unwrap_or(dt)
}
