//! Line-by-line variable history for tracked executions.
//!
//! The tracker owns append-only sequences of [`Snapshot`]s and [`Change`]s
//! plus a last-seen serialized form per variable. It never retains references
//! to the runtime values themselves — only their bounded string forms — which
//! decouples its lifetime from user-constructed objects and keeps expensive
//! custom `repr` implementations from running twice.
//!
//! Both sequences are capped; the oldest entry is evicted once a cap is hit.
//! All state sits behind a single internal mutex so a tracker can be shared
//! between the worker and the caller.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use crate::serialize::redact_if_sensitive;
use crate::types::{Change, SerializedValue, Snapshot, MAX_CHANGES, MAX_SNAPSHOTS};

struct TrackerInner {
    snapshots: VecDeque<Snapshot>,
    changes: VecDeque<Change>,
    /// name → last serialized preview, for change detection.
    previous: HashMap<String, String>,
}

/// Bounded recorder of variable state across line executions.
pub struct VariableTracker {
    inner: Mutex<TrackerInner>,
    max_snapshots: usize,
    max_changes: usize,
}

impl Default for VariableTracker {
    fn default() -> Self {
        Self::new(MAX_SNAPSHOTS, MAX_CHANGES)
    }
}

impl VariableTracker {
    pub fn new(max_snapshots: usize, max_changes: usize) -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                snapshots: VecDeque::new(),
                changes: VecDeque::new(),
                previous: HashMap::new(),
            }),
            max_snapshots: max_snapshots.max(1),
            max_changes: max_changes.max(1),
        }
    }

    /// Record the state of `variables` after `line` executed.
    ///
    /// Underscore-prefixed names are skipped. Every recorded value is redacted
    /// by name before storage; if a variable's serialized form differs from
    /// its previous one, a [`Change`] is appended as well.
    pub fn track(&self, line: u32, variables: &[(String, SerializedValue)], at_ns: u64) {
        let mut inner = self.inner.lock().expect("VariableTracker mutex poisoned");

        for (name, value) in variables {
            if name.starts_with('_') {
                continue;
            }

            let preview = redact_if_sensitive(name, value.preview.clone());

            if inner.snapshots.len() >= self.max_snapshots {
                inner.snapshots.pop_front();
            }
            inner.snapshots.push_back(Snapshot {
                line,
                name: name.clone(),
                value: preview.clone(),
                type_name: value.type_name.clone(),
                at_ns,
            });

            if let Some(old) = inner.previous.get(name) {
                if *old != preview {
                    let change = Change {
                        line,
                        name: name.clone(),
                        old: old.clone(),
                        new: preview.clone(),
                        new_type: value.type_name.clone(),
                    };
                    if inner.changes.len() >= self.max_changes {
                        inner.changes.pop_front();
                    }
                    inner.changes.push_back(change);
                }
            }

            inner.previous.insert(name.clone(), preview);
        }
    }

    /// All snapshots recorded so far, oldest first.
    pub fn snapshots(&self) -> Vec<Snapshot> {
        let inner = self.inner.lock().expect("VariableTracker mutex poisoned");
        inner.snapshots.iter().cloned().collect()
    }

    /// All changes recorded so far, oldest first.
    pub fn changes(&self) -> Vec<Change> {
        let inner = self.inner.lock().expect("VariableTracker mutex poisoned");
        inner.changes.iter().cloned().collect()
    }

    /// All snapshots of one variable, oldest first.
    pub fn history(&self, name: &str) -> Vec<Snapshot> {
        let inner = self.inner.lock().expect("VariableTracker mutex poisoned");
        inner
            .snapshots
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }

    /// The variables recorded at a given line, name → serialized value.
    pub fn variables_at_line(&self, line: u32) -> BTreeMap<String, String> {
        let inner = self.inner.lock().expect("VariableTracker mutex poisoned");
        inner
            .snapshots
            .iter()
            .filter(|s| s.line == line)
            .map(|s| (s.name.clone(), s.value.clone()))
            .collect()
    }

    /// Changes grouped by variable name.
    pub fn changes_summary(&self) -> BTreeMap<String, Vec<Change>> {
        let inner = self.inner.lock().expect("VariableTracker mutex poisoned");
        let mut summary: BTreeMap<String, Vec<Change>> = BTreeMap::new();
        for change in &inner.changes {
            summary
                .entry(change.name.clone())
                .or_default()
                .push(change.clone());
        }
        summary
    }

    /// Consume the tracker, yielding `(snapshots, changes)`.
    pub fn into_parts(self) -> (Vec<Snapshot>, Vec<Change>) {
        let inner = self
            .inner
            .into_inner()
            .expect("VariableTracker mutex poisoned");
        (
            inner.snapshots.into_iter().collect(),
            inner.changes.into_iter().collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::REDACTED;

    fn scalar(type_name: &str, preview: &str) -> SerializedValue {
        SerializedValue::scalar(type_name, preview)
    }

    fn int_var(name: &str, value: i64) -> (String, SerializedValue) {
        (name.to_string(), scalar("int", &value.to_string()))
    }

    #[test]
    fn test_track_records_snapshot() {
        let tracker = VariableTracker::default();
        tracker.track(1, &[int_var("x", 10)], 100);

        let snaps = tracker.snapshots();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].name, "x");
        assert_eq!(snaps[0].value, "10");
        assert_eq!(snaps[0].line, 1);
        assert_eq!(snaps[0].at_ns, 100);
    }

    #[test]
    fn test_change_emitted_when_serialized_form_differs() {
        let tracker = VariableTracker::default();
        tracker.track(1, &[int_var("x", 10)], 0);
        tracker.track(2, &[int_var("x", 15)], 1);

        let changes = tracker.changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].line, 2);
        assert_eq!(changes[0].old, "10");
        assert_eq!(changes[0].new, "15");
        assert_eq!(changes[0].new_type, "int");
    }

    #[test]
    fn test_no_change_when_value_unchanged() {
        let tracker = VariableTracker::default();
        tracker.track(1, &[int_var("x", 10)], 0);
        tracker.track(2, &[int_var("x", 10)], 1);
        assert!(tracker.changes().is_empty());
    }

    #[test]
    fn test_every_consecutive_distinct_pair_has_matching_change() {
        let tracker = VariableTracker::default();
        let values = [1i64, 1, 2, 3, 3, 4];
        for (i, v) in values.iter().enumerate() {
            tracker.track(i as u32 + 1, &[int_var("x", *v)], i as u64);
        }

        let snaps = tracker.history("x");
        let changes = tracker.changes();
        let mut expected = Vec::new();
        for pair in snaps.windows(2) {
            if pair[0].value != pair[1].value {
                expected.push((pair[0].value.clone(), pair[1].value.clone()));
            }
        }
        let actual: Vec<_> = changes
            .iter()
            .map(|c| (c.old.clone(), c.new.clone()))
            .collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_underscore_names_skipped() {
        let tracker = VariableTracker::default();
        tracker.track(1, &[int_var("_hidden", 1), int_var("visible", 2)], 0);
        let snaps = tracker.snapshots();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].name, "visible");
    }

    #[test]
    fn test_secret_names_redacted() {
        let tracker = VariableTracker::default();
        tracker.track(
            1,
            &[("api_token".to_string(), scalar("str", "'abc123'"))],
            0,
        );
        let snaps = tracker.snapshots();
        assert_eq!(snaps[0].value, REDACTED);
    }

    #[test]
    fn test_snapshot_cap_evicts_oldest() {
        let tracker = VariableTracker::new(3, 10);
        for i in 0..5 {
            tracker.track(i + 1, &[int_var("x", i as i64)], i as u64);
        }
        let snaps = tracker.snapshots();
        assert_eq!(snaps.len(), 3);
        // Lines 1 and 2 were evicted.
        assert_eq!(snaps[0].line, 3);
        assert_eq!(snaps[2].line, 5);
    }

    #[test]
    fn test_change_cap_evicts_oldest() {
        let tracker = VariableTracker::new(100, 2);
        for i in 0..5 {
            tracker.track(i + 1, &[int_var("x", i as i64)], i as u64);
        }
        let changes = tracker.changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].old, "2");
        assert_eq!(changes[1].old, "3");
    }

    #[test]
    fn test_variables_at_line() {
        let tracker = VariableTracker::default();
        tracker.track(1, &[int_var("x", 1), int_var("y", 2)], 0);
        tracker.track(2, &[int_var("x", 3)], 1);

        let at_one = tracker.variables_at_line(1);
        assert_eq!(at_one.len(), 2);
        assert_eq!(at_one["x"], "1");
        assert_eq!(at_one["y"], "2");

        let at_two = tracker.variables_at_line(2);
        assert_eq!(at_two.len(), 1);
        assert_eq!(at_two["x"], "3");
    }

    #[test]
    fn test_changes_summary_groups_by_name() {
        let tracker = VariableTracker::default();
        tracker.track(1, &[int_var("x", 1), int_var("y", 9)], 0);
        tracker.track(2, &[int_var("x", 2), int_var("y", 9)], 1);
        tracker.track(3, &[int_var("x", 3), int_var("y", 8)], 2);

        let summary = tracker.changes_summary();
        assert_eq!(summary["x"].len(), 2);
        assert_eq!(summary["y"].len(), 1);
    }

    #[test]
    fn test_into_parts_returns_everything() {
        let tracker = VariableTracker::default();
        tracker.track(1, &[int_var("x", 1)], 0);
        tracker.track(2, &[int_var("x", 2)], 1);
        let (snapshots, changes) = tracker.into_parts();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn test_concurrent_tracking_no_panic() {
        use std::sync::Arc;
        use std::thread;

        let tracker = Arc::new(VariableTracker::default());
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    for i in 0..50u32 {
                        tracker.track(i, &[int_var(&format!("v{t}"), i as i64)], i as u64);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("tracker thread panicked");
        }
        assert_eq!(tracker.snapshots().len(), 200);
    }
}
