//! Content-unit diffing
//!
//! Pure comparison between what the store already knows and what the source
//! just returned. Invalid scraped records are rejected here, at the
//! boundary, so the rest of the system only ever sees fully-shaped units.

use std::collections::HashSet;

use tracing::warn;

use crate::models::{ContentUnit, ScrapedUnit};

/// New-unit count at or above which a single batch notification is emitted
/// instead of per-unit notifications. Product constant; do not retune.
pub const BATCH_THRESHOLD: usize = 3;

/// Units present in `scraped` but absent from `existing`
///
/// Membership is tested by source id in O(1); the scraped order is
/// preserved and neither input is mutated.
pub fn find_new(existing: &HashSet<String>, scraped: &[ContentUnit]) -> Vec<ContentUnit> {
    scraped
        .iter()
        .filter(|unit| !existing.contains(&unit.source_id))
        .cloned()
        .collect()
}

/// Whether the new units should be announced as one combined batch
pub fn should_batch(new_units: &[ContentUnit]) -> bool {
    new_units.len() >= BATCH_THRESHOLD
}

/// Promote a raw scraped record to a [`ContentUnit`]
///
/// Requires source id, sequence number, display label, and url. Returns
/// `None` for malformed records; the caller drops them and continues, a bad
/// record never fails the whole diff.
pub fn validate(item_id: i64, raw: &ScrapedUnit) -> Option<ContentUnit> {
    let missing = |field: &str| {
        warn!(
            item_id,
            source_id = raw.source_id.as_deref().unwrap_or("<none>"),
            field,
            "dropping malformed scraped unit"
        );
        None::<ContentUnit>
    };

    let source_id = match raw.source_id.as_deref() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => return missing("source_id"),
    };
    let Some(number) = raw.number else {
        return missing("number");
    };
    let label = match raw.label.as_deref() {
        Some(label) if !label.is_empty() => label.to_string(),
        _ => return missing("label"),
    };
    let url = match raw.url.as_deref() {
        Some(url) if !url.is_empty() => url.to_string(),
        _ => return missing("url"),
    };

    Some(ContentUnit {
        item_id,
        source_id,
        number,
        label,
        title: raw.title.clone(),
        url,
        published_at: raw.published_at,
        views: raw.views.unwrap_or(0),
    })
}

/// Validate a whole scraped batch, dropping malformed records
pub fn validate_batch(item_id: i64, raw: &[ScrapedUnit]) -> Vec<ContentUnit> {
    raw.iter()
        .filter_map(|unit| validate(item_id, unit))
        .collect()
}
