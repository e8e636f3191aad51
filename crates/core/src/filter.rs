//! Filtered queue listings.
//!
//! Filters narrow what is shown, never what is ranked: every row carries the entry's position
//! in the whole queue, computed once for the snapshot.

use crate::entry::{PriorityTier, WaitlistEntry};
use crate::ordering::{Position, RankedQueue};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryFilter {
    /// Match any of these specialty refs. Empty matches all.
    pub specialties: Vec<String>,
    pub procedures: Vec<String>,
    pub physicians: Vec<String>,
    pub priority_tier: Option<PriorityTier>,
    /// `None` matches both active and inactive entries.
    pub active: Option<bool>,
    pub has_judicial_order: Option<bool>,
    /// Inclusive lower bound on the entry date.
    pub entered_from: Option<NaiveDate>,
    /// Inclusive upper bound on the entry date.
    pub entered_to: Option<NaiveDate>,
    /// Case-insensitive substring of the patient ref.
    pub patient_ref_contains: Option<String>,
}

impl EntryFilter {
    pub fn matches(&self, entry: &WaitlistEntry) -> bool {
        fn any_of(wanted: &[String], value: Option<&str>) -> bool {
            wanted.is_empty() || value.is_some_and(|v| wanted.iter().any(|w| w.trim() == v))
        }

        let entered_on = entry.entered_at.date_naive();

        any_of(&self.specialties, Some(entry.specialty_ref.as_str()))
            && any_of(&self.procedures, Some(entry.procedure_ref.as_str()))
            && any_of(&self.physicians, entry.physician_ref.as_ref().map(|r| r.as_str()))
            && self.priority_tier.is_none_or(|t| t == entry.priority_tier)
            && self.active.is_none_or(|a| a == entry.active)
            && self
                .has_judicial_order
                .is_none_or(|j| j == entry.has_judicial_order)
            && self.entered_from.is_none_or(|from| entered_on >= from)
            && self.entered_to.is_none_or(|to| entered_on <= to)
            && self.patient_ref_contains.as_deref().is_none_or(|needle| {
                entry
                    .patient_ref
                    .as_str()
                    .to_lowercase()
                    .contains(&needle.trim().to_lowercase())
            })
    }
}

/// One line of a queue listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueRow {
    pub position: Option<Position>,
    pub entry: WaitlistEntry,
}

/// Lists the entries of `snapshot` that match `filter`.
///
/// Active entries come first in queue order, then inactive entries by entry date.
pub fn list_queue(snapshot: &[WaitlistEntry], filter: &EntryFilter) -> Vec<QueueRow> {
    let ranked = RankedQueue::from_snapshot(snapshot);

    let mut rows: Vec<QueueRow> = snapshot
        .iter()
        .filter(|entry| filter.matches(entry))
        .map(|entry| QueueRow {
            position: ranked.position_of(entry.id),
            entry: entry.clone(),
        })
        .collect();

    rows.sort_by(|a, b| match (a.position, b.position) {
        (Some(pa), Some(pb)) => pa.cmp(&pb),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => (a.entry.entered_at, a.entry.id).cmp(&(b.entry.entered_at, b.entry.id)),
    });
    rows
}
