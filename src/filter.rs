//! Adapter over the platform's tag-predicate filters.
//!
//! The filter language itself is parsed elsewhere in the platform; the
//! engine consumes a compiled predicate plus its source pattern. The pattern
//! text drives the query planner's only optimization: a pattern that is one
//! bare tag name maps the candidate set to that tag's index, everything else
//! falls back to a full cache scan. [`Filter::index_tag`] is the seam where
//! an AST-based planner (conjunction → index intersection, indexed value
//! equality) would plug in.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{Dict, HisItem, TagVal};

/// A compiled tag predicate paired with its source pattern.
///
/// Cheap to clone; the predicate is shared.
#[derive(Clone)]
pub struct Filter {
    pattern: String,
    pred: Arc<dyn Fn(&Dict) -> bool + Send + Sync>,
}

impl Filter {
    /// Wraps an externally compiled predicate.
    pub fn new(
        pattern: impl Into<String>,
        pred: impl Fn(&Dict) -> bool + Send + Sync + 'static,
    ) -> Self {
        Filter {
            pattern: pattern.into(),
            pred: Arc::new(pred),
        }
    }

    /// The `has(tag)` predicate: matches records carrying the tag.
    pub fn has(tag: impl Into<String>) -> Self {
        let tag = tag.into();
        let name = tag.clone();
        Filter {
            pattern: tag,
            pred: Arc::new(move |rec| rec.has(&name)),
        }
    }

    /// Evaluates the predicate against a record.
    pub fn matches(&self, rec: &Dict) -> bool {
        (self.pred)(rec)
    }

    /// The source pattern text.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Planner probe: returns the tag name when the pattern's surface form
    /// is a single identifier (no spaces, operators, or parentheses), which
    /// maps the candidate set to `idx:tag:{name}`.
    ///
    /// Detection is textual by design; an AST-based rewrite must re-derive
    /// the same eligible set.
    pub(crate) fn index_tag(&self) -> Option<&str> {
        let p = self.pattern.trim();
        if crate::types::is_tag_name(p) {
            Some(p)
        } else {
            None
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter").field("pattern", &self.pattern).finish()
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pattern)
    }
}

// =============================================================================
// History write checks
// =============================================================================

/// Validates one history item against its host point's configuration.
///
/// - Composite values (dict, list, bytes) are never historized.
/// - A `kind` tag on the host pins the value kind (`Number`, `Bool`, `Str`).
/// - Item timestamps must carry the host's timezone; the score is the UTC
///   instant, so a mismatched zone means the caller sampled against the
///   wrong clock.
/// - The remove sentinel is always accepted (it deletes the item at that
///   timestamp).
pub fn his_write_check(host: &Dict, item: &HisItem) -> Result<()> {
    let id = host.id().map(|r| r.id().to_string()).unwrap_or_default();

    if item.val.is_remove() {
        return Ok(());
    }

    match item.val {
        TagVal::Dict(_) | TagVal::List(_) | TagVal::Bytes(_) | TagVal::Marker => {
            return Err(Error::HisConfig {
                id,
                reason: format!("unsupported history value kind {}", item.val.kind_name()),
            });
        }
        _ => {}
    }

    if let Some(kind) = host.get("kind").and_then(TagVal::as_str) {
        if kind != item.val.kind_name() {
            return Err(Error::HisConfig {
                id,
                reason: format!(
                    "item kind {} does not match point kind {}",
                    item.val.kind_name(),
                    kind
                ),
            });
        }
    }

    let host_tz = host.tz();
    if item.ts.timezone() != host_tz {
        return Err(Error::HisConfig {
            id,
            reason: format!(
                "item timezone {} does not match point timezone {}",
                item.ts.timezone().name(),
                host_tz.name()
            ),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Number, Ref};
    use chrono::TimeZone;

    #[test]
    fn test_has_filter() {
        let f = Filter::has("site");
        assert!(f.matches(&Dict::new().set_marker("site")));
        assert!(!f.matches(&Dict::new().set_marker("equip")));
    }

    #[test]
    fn test_index_tag_shapes() {
        assert_eq!(Filter::has("site").index_tag(), Some("site"));
        assert_eq!(Filter::new("  geoCity ", |_| true).index_tag(), Some("geoCity"));

        // Anything beyond one bare identifier scans the cache.
        for pattern in [
            "site and equip",
            "not site",
            "(site)",
            "dis == \"A\"",
            "siteRef->dis",
            "",
        ] {
            let f = Filter::new(pattern, |_| true);
            assert_eq!(f.index_tag(), None, "pattern {:?}", pattern);
        }
    }

    #[test]
    fn test_custom_predicate() {
        let f = Filter::new("area > 1000", |rec| {
            rec.get("area")
                .and_then(TagVal::as_num)
                .map(|n| n.val > 1000.0)
                .unwrap_or(false)
        });
        assert!(f.matches(&Dict::new().set("area", 2000.0)));
        assert!(!f.matches(&Dict::new().set("area", 500.0)));
        assert_eq!(f.index_tag(), None);
    }

    fn point(kind: Option<&str>, tz: &str) -> Dict {
        let mut d = Dict::new()
            .set("id", Ref::new("p-1"))
            .set_marker("point")
            .set_marker("his")
            .set("tz", tz);
        if let Some(k) = kind {
            d.insert("kind", k);
        }
        d
    }

    #[test]
    fn test_his_write_check_kind() {
        let tz = chrono_tz::UTC;
        let ts = tz.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let host = point(Some("Number"), "UTC");
        assert!(his_write_check(&host, &HisItem::new(ts, Number::new(1.0))).is_ok());
        assert!(his_write_check(&host, &HisItem::new(ts, "text")).is_err());
        assert!(his_write_check(&host, &HisItem::new(ts, TagVal::Remove)).is_ok());

        let untyped = point(None, "UTC");
        assert!(his_write_check(&untyped, &HisItem::new(ts, true)).is_ok());
        assert!(his_write_check(&untyped, &HisItem::new(ts, TagVal::Marker)).is_err());
        assert!(
            his_write_check(&untyped, &HisItem::new(ts, TagVal::Dict(Dict::new()))).is_err()
        );
    }

    #[test]
    fn test_his_write_check_timezone() {
        let ny = chrono_tz::America::New_York;
        let ts = ny.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let host = point(None, "New_York");
        assert!(his_write_check(&host, &HisItem::new(ts, 1.0)).is_ok());

        let wrong = point(None, "Chicago");
        assert!(his_write_check(&wrong, &HisItem::new(ts, 1.0)).is_err());
    }
}
