//! Queue ordering and position assignment.
//!
//! Positions are never stored. Every query ranks the snapshot it is given, so a position always
//! reflects the entries' current tier, judicial flag and active state. The cost is one
//! `O(n log n)` sort per query; use [`QueueOrderer::bulk_positions`] (or keep a [`RankedQueue`])
//! when positions are needed for many entries at once.
//!
//! ## Ordering
//!
//! Active entries are sorted ascending by the composite key `(tier, entered_at, id)`:
//!
//! | Tier | Rank | Condition |
//! |---|---|---|
//! | [`QueueTier::Judicial`] | 0 | `has_judicial_order` |
//! | [`QueueTier::Oncological`] | 1 | `priority_tier == Oncological` |
//! | [`QueueTier::Flagged`] | 2 | `priority_tier == Flagged` |
//! | [`QueueTier::Default`] | 3 | everything else |
//!
//! The id tie-break makes the order total even when two entries share a timestamp.
//! Inactive entries never receive a position.

use crate::entry::{EntryId, PriorityTier, WaitlistEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;

/// Coarse priority bucket; the primary sort key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueTier {
    Judicial = 0,
    Oncological = 1,
    Flagged = 2,
    Default = 3,
}

impl QueueTier {
    pub fn of(entry: &WaitlistEntry) -> Self {
        if entry.has_judicial_order {
            return QueueTier::Judicial;
        }
        match entry.priority_tier {
            PriorityTier::Oncological => QueueTier::Oncological,
            PriorityTier::Flagged => QueueTier::Flagged,
            PriorityTier::None => QueueTier::Default,
        }
    }

    pub fn rank(&self) -> u8 {
        *self as u8
    }
}

/// 1-based place of an active entry in the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(NonZeroUsize);

impl Position {
    fn from_index(index: usize) -> Self {
        Self(NonZeroUsize::MIN.saturating_add(index))
    }

    pub fn get(&self) -> usize {
        self.0.get()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    tier: QueueTier,
    entered_at: DateTime<Utc>,
    id: EntryId,
}

impl QueueKey {
    fn of(entry: &WaitlistEntry) -> Self {
        Self {
            tier: QueueTier::of(entry),
            entered_at: entry.entered_at,
            id: entry.id,
        }
    }
}

/// Stateless ranking over explicit snapshots.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueOrderer;

impl QueueOrderer {
    /// Returns the ids of the active entries in `snapshot`, best first.
    ///
    /// Inactive entries in the input are skipped, so a full store dump may be passed as well
    /// as an active-only snapshot. Deterministic for a fixed snapshot regardless of input order.
    pub fn rank(snapshot: &[WaitlistEntry]) -> Vec<EntryId> {
        let mut keys: Vec<QueueKey> = snapshot
            .iter()
            .filter(|entry| entry.active)
            .map(QueueKey::of)
            .collect();
        // Keys are unique per id, so an unstable sort is still deterministic.
        keys.sort_unstable();
        tracing::debug!(entries = keys.len(), "ranked waitlist snapshot");
        keys.into_iter().map(|key| key.id).collect()
    }

    /// Position of `id` within `snapshot`, or `None` if it is inactive or absent.
    ///
    /// Ranks the whole snapshot on every call. Do not call this per row of a list.
    pub fn position_of(id: EntryId, snapshot: &[WaitlistEntry]) -> Option<Position> {
        Self::rank(snapshot)
            .iter()
            .position(|ranked| *ranked == id)
            .map(Position::from_index)
    }

    /// Positions of every active entry in `snapshot`, from a single ranking pass.
    pub fn bulk_positions(snapshot: &[WaitlistEntry]) -> HashMap<EntryId, Position> {
        RankedQueue::from_snapshot(snapshot).positions
    }
}

/// One ranking of one snapshot, with position lookups.
#[derive(Clone, Debug, Default)]
pub struct RankedQueue {
    order: Vec<EntryId>,
    positions: HashMap<EntryId, Position>,
}

impl RankedQueue {
    pub fn from_snapshot(snapshot: &[WaitlistEntry]) -> Self {
        let order = QueueOrderer::rank(snapshot);
        let positions = order
            .iter()
            .enumerate()
            .map(|(index, id)| (*id, Position::from_index(index)))
            .collect();
        Self { order, positions }
    }

    pub fn order(&self) -> &[EntryId] {
        &self.order
    }

    pub fn position_of(&self, id: EntryId) -> Option<Position> {
        self.positions.get(&id).copied()
    }

    pub fn positions(&self) -> &HashMap<EntryId, Position> {
        &self.positions
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::entry::{ExitReason, Ref, WaitlistStatus};
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    pub(crate) fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap() + Duration::days(n)
    }

    pub(crate) fn entry(id: u64, entered_at: DateTime<Utc>, tier: PriorityTier, judicial: bool) -> WaitlistEntry {
        WaitlistEntry {
            id: EntryId(id),
            patient_ref: Ref::new(format!("patient:{id}")).unwrap(),
            procedure_ref: Ref::new("procedure:0408").unwrap(),
            specialty_ref: Ref::new("specialty:ORT").unwrap(),
            physician_ref: None,
            secondary_procedure_ref: None,
            secondary_specialty_ref: None,
            entered_at,
            priority_tier: tier,
            priority_justification: (tier != PriorityTier::None).then(|| "clinical".to_string()),
            has_judicial_order: judicial,
            judicial_case_number: None,
            judicial_description: None,
            status: WaitlistStatus::DocumentsPending,
            notes: None,
            next_contact_date: None,
            active: true,
            exit_reason: None,
            exit_note: None,
            version: 1,
        }
    }

    fn deactivated(mut e: WaitlistEntry) -> WaitlistEntry {
        e.active = false;
        e.exit_reason = Some(ExitReason::SurgeryPerformed);
        e
    }

    fn ids(raw: &[u64]) -> Vec<EntryId> {
        raw.iter().copied().map(EntryId).collect()
    }

    fn scenario_one() -> Vec<WaitlistEntry> {
        vec![
            entry(1, day(1), PriorityTier::None, false),
            entry(2, day(2), PriorityTier::Oncological, false),
            entry(3, day(3), PriorityTier::None, true),
        ]
    }

    #[test]
    fn test_judicial_then_oncological_then_default() {
        let snapshot = scenario_one();
        assert_eq!(QueueOrderer::rank(&snapshot), ids(&[3, 2, 1]));

        let positions = QueueOrderer::bulk_positions(&snapshot);
        assert_eq!(positions[&EntryId(3)].get(), 1);
        assert_eq!(positions[&EntryId(2)].get(), 2);
        assert_eq!(positions[&EntryId(1)].get(), 3);
    }

    #[test]
    fn test_deactivated_entry_loses_position() {
        let mut snapshot = scenario_one();
        snapshot[0] = deactivated(snapshot[0].clone());

        assert_eq!(QueueOrderer::rank(&snapshot), ids(&[3, 2]));
        assert_eq!(QueueOrderer::position_of(EntryId(1), &snapshot), None);
        assert_eq!(QueueOrderer::position_of(EntryId(2), &snapshot).map(|p| p.get()), Some(2));
        assert_eq!(QueueOrderer::position_of(EntryId(3), &snapshot).map(|p| p.get()), Some(1));
    }

    #[test]
    fn test_identical_timestamps_break_ties_by_id() {
        let snapshot = vec![
            entry(9, day(4), PriorityTier::Flagged, false),
            entry(5, day(4), PriorityTier::Flagged, false),
        ];
        assert_eq!(QueueOrderer::rank(&snapshot), ids(&[5, 9]));
    }

    #[test]
    fn test_empty_snapshot() {
        assert!(QueueOrderer::rank(&[]).is_empty());
        assert!(QueueOrderer::bulk_positions(&[]).is_empty());
        assert_eq!(QueueOrderer::position_of(EntryId(1), &[]), None);
    }

    #[test]
    fn test_single_entry_is_first() {
        let snapshot = vec![entry(42, day(10), PriorityTier::None, false)];
        assert_eq!(QueueOrderer::position_of(EntryId(42), &snapshot).map(|p| p.get()), Some(1));
    }

    #[test]
    fn test_flagged_ranks_between_oncological_and_default() {
        let snapshot = vec![
            entry(1, day(0), PriorityTier::None, false),
            entry(2, day(5), PriorityTier::Flagged, false),
            entry(3, day(9), PriorityTier::Oncological, false),
        ];
        assert_eq!(QueueOrderer::rank(&snapshot), ids(&[3, 2, 1]));
    }

    #[test]
    fn test_judicial_order_overrides_tier() {
        let e = entry(1, day(0), PriorityTier::Flagged, true);
        assert_eq!(QueueTier::of(&e), QueueTier::Judicial);
        assert_eq!(QueueTier::of(&e).rank(), 0);
    }

    #[test]
    fn test_ranked_queue_lookups() {
        let queue = RankedQueue::from_snapshot(&scenario_one());
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.order(), ids(&[3, 2, 1]).as_slice());
        assert_eq!(queue.position_of(EntryId(2)).map(|p| p.to_string()), Some("2".into()));
        assert_eq!(queue.position_of(EntryId(99)), None);
    }

    fn arb_entry() -> impl Strategy<Value = WaitlistEntry> {
        (
            1u64..500,
            0i64..30,
            prop_oneof![
                Just(PriorityTier::None),
                Just(PriorityTier::Flagged),
                Just(PriorityTier::Oncological)
            ],
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(id, d, tier, judicial, active)| {
                let e = entry(id, day(d), tier, judicial);
                if active {
                    e
                } else {
                    deactivated(e)
                }
            })
    }

    fn arb_snapshot() -> impl Strategy<Value = Vec<WaitlistEntry>> {
        prop::collection::vec(arb_entry(), 0..40).prop_map(|mut entries| {
            entries.sort_by_key(|e| e.id);
            entries.dedup_by_key(|e| e.id);
            entries
        })
    }

    proptest! {
        #[test]
        fn prop_rank_is_total_and_deterministic(snapshot in arb_snapshot()) {
            let first = QueueOrderer::rank(&snapshot);
            let mut reversed = snapshot.clone();
            reversed.reverse();

            prop_assert_eq!(&first, &QueueOrderer::rank(&snapshot));
            prop_assert_eq!(&first, &QueueOrderer::rank(&reversed));

            let active = snapshot.iter().filter(|e| e.active).count();
            prop_assert_eq!(first.len(), active);
            for e in snapshot.iter().filter(|e| e.active) {
                prop_assert_eq!(first.iter().filter(|id| **id == e.id).count(), 1);
            }
        }

        #[test]
        fn prop_judicial_entries_come_first(snapshot in arb_snapshot()) {
            let positions = QueueOrderer::bulk_positions(&snapshot);
            let active: Vec<_> = snapshot.iter().filter(|e| e.active).collect();
            for judicial in active.iter().filter(|e| e.has_judicial_order) {
                for other in active.iter().filter(|e| !e.has_judicial_order) {
                    prop_assert!(positions[&judicial.id] < positions[&other.id]);
                }
            }
        }

        #[test]
        fn prop_fifo_within_tier(snapshot in arb_snapshot()) {
            let positions = QueueOrderer::bulk_positions(&snapshot);
            let active: Vec<_> = snapshot.iter().filter(|e| e.active).collect();
            for a in &active {
                for b in &active {
                    if QueueTier::of(a) == QueueTier::of(b) && a.entered_at < b.entered_at {
                        prop_assert!(positions[&a.id] < positions[&b.id]);
                    }
                }
            }
        }

        #[test]
        fn prop_position_matches_rank_index(snapshot in arb_snapshot()) {
            let order = QueueOrderer::rank(&snapshot);
            for e in &snapshot {
                let position = QueueOrderer::position_of(e.id, &snapshot);
                if e.active {
                    let index = order.iter().position(|id| *id == e.id).unwrap();
                    prop_assert_eq!(position.map(|p| p.get()), Some(index + 1));
                } else {
                    prop_assert_eq!(position, None);
                }
            }
        }

        #[test]
        fn prop_deactivation_shifts_lower_entries_up_by_one(snapshot in arb_snapshot(), pick in any::<prop::sample::Index>()) {
            let active_ids: Vec<EntryId> = snapshot.iter().filter(|e| e.active).map(|e| e.id).collect();
            prop_assume!(!active_ids.is_empty());
            let removed = active_ids[pick.index(active_ids.len())];

            let before = QueueOrderer::bulk_positions(&snapshot);
            let after_snapshot: Vec<WaitlistEntry> = snapshot
                .iter()
                .cloned()
                .map(|e| if e.id == removed { deactivated(e) } else { e })
                .collect();
            let after = QueueOrderer::bulk_positions(&after_snapshot);

            prop_assert!(!after.contains_key(&removed));
            let removed_at = before[&removed].get();
            for (id, pos) in &before {
                if *id == removed {
                    continue;
                }
                let expected = if pos.get() > removed_at { pos.get() - 1 } else { pos.get() };
                prop_assert_eq!(after[id].get(), expected);
            }
        }
    }
}
