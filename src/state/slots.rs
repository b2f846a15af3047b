//! Pure slot operations and the partial-update type the store applies.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::{RoleWorkerState, Slot};

/// Address of one slot within a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotRef {
    pub role: String,
    pub level: String,
    pub index: usize,
}

impl std::fmt::Display for SlotRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.role, self.level, self.index)
    }
}

/// Field-level change to one slot. `None` leaves a field untouched; for the
/// nullable fields `Some(None)` clears it.
///
/// `session_key` can be set but never cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPatch {
    pub active: Option<bool>,
    pub issue_id: Option<Option<String>>,
    pub session_key: Option<String>,
    pub start_time: Option<Option<DateTime<Utc>>>,
    pub previous_label: Option<Option<String>>,
    pub bump_task_count: bool,
}

impl SlotPatch {
    /// Release a slot. `session_key` and `previous_label` are left alone.
    pub fn deactivate() -> Self {
        Self {
            active: Some(false),
            issue_id: Some(None),
            start_time: Some(None),
            ..Self::default()
        }
    }

    fn apply(&self, slot: &mut Slot) {
        if let Some(active) = self.active {
            slot.active = active;
        }
        if let Some(issue_id) = &self.issue_id {
            slot.issue_id = issue_id.clone();
        }
        if let Some(key) = &self.session_key {
            slot.session_key = Some(key.clone());
        }
        if let Some(start) = self.start_time {
            slot.start_time = start;
        }
        if let Some(label) = &self.previous_label {
            slot.previous_label = label.clone();
        }
        if self.bump_task_count {
            slot.task_count = Some(slot.task_count.unwrap_or(0).saturating_add(1));
        }
    }
}

/// Partial update for one role: level → slot index → patch. Slots and levels
/// that are not mentioned are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleUpdate {
    pub levels: BTreeMap<String, BTreeMap<usize, SlotPatch>>,
}

impl RoleUpdate {
    pub fn slot(level: &str, index: usize, patch: SlotPatch) -> Self {
        let mut update = Self::default();
        update
            .levels
            .entry(level.to_string())
            .or_default()
            .insert(index, patch);
        update
    }
}

impl RoleWorkerState {
    pub fn slots(&self, level: &str) -> &[Slot] {
        self.levels.get(level).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Lowest-indexed inactive slot at `level`, considering only indices
    /// below `max_workers` when given.
    pub fn find_free_slot(&self, level: &str, max_workers: Option<usize>) -> Option<usize> {
        let slots = self.slots(level);
        let bound = max_workers.map_or(slots.len(), |max| max.min(slots.len()));
        slots[..bound].iter().position(|s| !s.active)
    }

    /// `(level, index)` of the active slot holding `issue_id`.
    pub fn find_slot_by_issue(&self, issue_id: &str) -> Option<(String, usize)> {
        self.levels.iter().find_map(|(level, slots)| {
            slots
                .iter()
                .position(|s| s.holds(issue_id))
                .map(|index| (level.clone(), index))
        })
    }

    pub fn active_count(&self) -> usize {
        self.levels.values().flatten().filter(|s| s.active).count()
    }

    /// Bring each level named in `desired` to its target length. Growing
    /// appends empty slots; shrinking pops trailing idle slots and stops at the
    /// first active one, so a running worker is never dropped. Levels not in
    /// `desired` are left alone. Returns whether anything changed.
    pub fn reconcile_slots(&mut self, desired: &BTreeMap<String, usize>) -> bool {
        let mut changed = false;
        for (level, &want) in desired {
            let slots = self.levels.entry(level.clone()).or_default();
            while slots.len() < want {
                slots.push(Slot::default());
                changed = true;
            }
            while slots.len() > want && slots.last().is_some_and(|s| !s.active) {
                slots.pop();
                changed = true;
            }
        }
        changed
    }

    /// Merge `update` key by key, growing slot arrays when an index is past
    /// the end.
    pub fn apply(&mut self, update: &RoleUpdate) {
        for (level, patches) in &update.levels {
            let slots = self.levels.entry(level.clone()).or_default();
            for (&index, patch) in patches {
                if slots.len() <= index {
                    slots.resize_with(index + 1, Slot::default);
                }
                patch.apply(&mut slots[index]);
            }
        }
    }
}
