//! Ranked leaderboard view derivation
//!
//! Pure state + math, no I/O: the ranker task owns a `LeaderboardState` and
//! re-derives the ranked view from full current state on every change. Owners
//! are kept in first-observed order so that ties resolve the same way on every
//! recomputation (stable sort), including after a full snapshot reload.

use std::collections::HashMap;
use tally_common::api::{RankDirection, RankMovement, RankedEntry};

use crate::db::CounterRecord;

#[derive(Debug, Clone)]
struct Slot {
    owner_id: String,
    display_name: Option<String>,
    value: u64,
}

/// All observed counters, in first-observed order
#[derive(Debug, Default)]
pub struct LeaderboardState {
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
}

impl LeaderboardState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a snapshot load (records already in first-observed order)
    pub fn from_records(records: &[CounterRecord]) -> Self {
        let mut state = Self::new();
        for record in records {
            state.apply(
                &record.owner_id,
                record.display_name.as_deref(),
                record.value.max(0) as u64,
            );
        }
        state
    }

    /// Apply one change-feed event: update the single changed record, or
    /// append a newly observed owner.
    ///
    /// Values never move backwards: redelivered events (the feed is
    /// at-least-once) cannot undo a newer value already applied.
    pub fn apply(&mut self, owner_id: &str, display_name: Option<&str>, value: u64) {
        match self.index.get(owner_id) {
            Some(&i) => {
                let slot = &mut self.slots[i];
                slot.value = slot.value.max(value);
                if let Some(name) = display_name {
                    slot.display_name = Some(name.to_string());
                }
            }
            None => {
                self.index.insert(owner_id.to_string(), self.slots.len());
                self.slots.push(Slot {
                    owner_id: owner_id.to_string(),
                    display_name: display_name.map(str::to_string),
                    value,
                });
            }
        }
    }

    /// Derive the ranked view: value descending, dense 1-based ranks, ties in
    /// first-observed order.
    pub fn ranked(&self) -> Vec<RankedEntry> {
        let mut ordered: Vec<&Slot> = self.slots.iter().collect();
        // sort_by is stable, so equal values keep first-observed order
        ordered.sort_by(|a, b| b.value.cmp(&a.value));

        let mut entries = Vec::with_capacity(ordered.len());
        let mut rank = 0u32;
        let mut previous_value = None;
        for slot in ordered {
            if previous_value != Some(slot.value) {
                rank += 1;
                previous_value = Some(slot.value);
            }
            entries.push(RankedEntry {
                id: slot.owner_id.clone(),
                display_name: slot
                    .display_name
                    .clone()
                    .unwrap_or_else(|| slot.owner_id.clone()),
                value: slot.value,
                rank,
            });
        }
        entries
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Diff two consecutive ranked views into up/down movement hints
///
/// Owners appearing for the first time produce no movement; observers render
/// them from the full entry list.
pub fn diff_movements(old: &[RankedEntry], new: &[RankedEntry]) -> Vec<RankMovement> {
    let old_ranks: HashMap<&str, u32> = old.iter().map(|e| (e.id.as_str(), e.rank)).collect();

    new.iter()
        .filter_map(|entry| {
            let previous = *old_ranks.get(entry.id.as_str())?;
            if entry.rank < previous {
                Some(RankMovement {
                    id: entry.id.clone(),
                    direction: RankDirection::Up,
                })
            } else if entry.rank > previous {
                Some(RankMovement {
                    id: entry.id.clone(),
                    direction: RankDirection::Down,
                })
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_of(values: &[(&str, u64)]) -> LeaderboardState {
        let mut state = LeaderboardState::new();
        for (owner, value) in values {
            state.apply(owner, None, *value);
        }
        state
    }

    #[test]
    fn ranks_are_dense_and_one_based() {
        let state = state_of(&[("a", 10), ("b", 30), ("c", 20)]);
        let ranked = state.ranked();

        let ids: Vec<&str> = ranked.iter().map(|e| e.id.as_str()).collect();
        let ranks: Vec<u32> = ranked.iter().map(|e| e.rank).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert_eq!(ranks, vec![1, 2, 3]);
    }

    #[test]
    fn recomputation_is_deterministic() {
        let state = state_of(&[("a", 5), ("b", 9), ("c", 1)]);
        assert_eq!(state.ranked(), state.ranked());
    }

    #[test]
    fn ties_share_a_dense_rank_in_first_observed_order() {
        let state = state_of(&[("a", 10), ("b", 20), ("c", 10), ("d", 5)]);
        let ranked = state.ranked();

        let ids: Vec<&str> = ranked.iter().map(|e| e.id.as_str()).collect();
        let ranks: Vec<u32> = ranked.iter().map(|e| e.rank).collect();
        // a ties c at 10; a was observed first so it stays ahead
        assert_eq!(ids, vec!["b", "a", "c", "d"]);
        assert_eq!(ranks, vec![1, 2, 2, 3]);
    }

    #[test]
    fn introducing_a_tie_keeps_previous_relative_order() {
        let mut state = state_of(&[("a", 10), ("b", 8)]);
        let before = state.ranked();
        assert_eq!(before[0].id, "a");

        // b climbs to tie a; a keeps the earlier slot
        state.apply("b", None, 10);
        let after = state.ranked();
        assert_eq!(after[0].id, "a");
        assert_eq!(after[1].id, "b");
        assert_eq!(after[0].rank, 1);
        assert_eq!(after[1].rank, 1);
    }

    #[test]
    fn redelivered_stale_event_cannot_regress_a_value() {
        let mut state = state_of(&[("a", 10)]);
        state.apply("a", None, 7);
        assert_eq!(state.ranked()[0].value, 10);
    }

    #[test]
    fn movements_report_direction_changes_only() {
        let mut state = state_of(&[("a", 30), ("b", 20), ("c", 10)]);
        let before = state.ranked();

        state.apply("c", None, 25);
        let after = state.ranked();

        let movements = diff_movements(&before, &after);
        assert_eq!(movements.len(), 2);
        assert!(movements
            .iter()
            .any(|m| m.id == "c" && m.direction == RankDirection::Up));
        assert!(movements
            .iter()
            .any(|m| m.id == "b" && m.direction == RankDirection::Down));
    }

    #[test]
    fn new_entrants_produce_no_movement() {
        let mut state = state_of(&[("a", 30)]);
        let before = state.ranked();

        state.apply("b", None, 40);
        let after = state.ranked();

        let movements = diff_movements(&before, &after);
        assert_eq!(movements.len(), 1);
        assert_eq!(movements[0].id, "a");
        assert_eq!(movements[0].direction, RankDirection::Down);
    }

    #[test]
    fn display_name_falls_back_to_owner_id() {
        let mut state = LeaderboardState::new();
        state.apply("u1", None, 3);
        state.apply("u2", Some("Beatrice"), 4);

        let ranked = state.ranked();
        assert_eq!(ranked[0].display_name, "Beatrice");
        assert_eq!(ranked[1].display_name, "u1");
    }
}
