use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use super::histogram::{Histogram, MergeError};
use super::NamedObject;

/// Outcome of a `merge_all` pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MergeReport {
    /// Objects folded into their primary.
    pub merged: usize,
    /// Objects dropped because their shape did not match.
    pub dropped: Vec<MergeError>,
}

/// Keyed accumulation of histograms by name.
///
/// Each name owns one primary accumulator, created on first sighting.
/// Further objects of the same name queue in `pending` until the next
/// `merge_all`, so that a merge runs once per round instead of per object.
#[derive(Debug, Default)]
pub struct AggregationStore {
    primaries: BTreeMap<String, Histogram>,
    pending: HashMap<String, Vec<Histogram>>,
}

impl AggregationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an object and returns the pending backlog for its name.
    pub fn add_object(&mut self, object: NamedObject) -> usize {
        let NamedObject { name, payload, .. } = object;

        if !self.primaries.contains_key(&name) {
            self.primaries.insert(name, payload);
            return 0;
        }

        let queue = self.pending.entry(name).or_default();
        queue.push(payload);
        queue.len()
    }

    /// Folds every pending object into its primary and clears the queues.
    pub fn merge_all(&mut self) -> MergeReport {
        let mut report = MergeReport::default();

        for (name, queue) in self.pending.drain() {
            let Some(primary) = self.primaries.get_mut(&name) else {
                // Unreachable through add_object; nothing to merge into.
                continue;
            };

            for object in queue {
                match primary.merge(&object) {
                    Ok(()) => report.merged += 1,
                    Err(e) => {
                        warn!(error = %e, "dropping object that does not match its accumulator");
                        report.dropped.push(e);
                    }
                }
            }
        }

        if report.merged > 0 || !report.dropped.is_empty() {
            debug!(
                merged = report.merged,
                dropped = report.dropped.len(),
                groups = self.primaries.len(),
                "merged pending objects",
            );
        }

        report
    }

    /// Merges, hands out all accumulators and resets the store.
    pub fn snapshot_and_reset(&mut self) -> (BTreeMap<String, Histogram>, MergeReport) {
        let report = self.merge_all();
        (std::mem::take(&mut self.primaries), report)
    }

    /// Drops all accumulated state without merging. Returns the group count.
    pub fn discard(&mut self) -> usize {
        let groups = self.primaries.len();
        self.primaries.clear();
        self.pending.clear();
        groups
    }

    /// Number of groups (distinct names).
    pub fn len(&self) -> usize {
        self.primaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primaries.is_empty()
    }

    /// Pending backlog for `name`, or `None` if the name has no queue yet.
    pub fn pending_len(&self, name: &str) -> Option<usize> {
        self.pending.get(name).map(Vec::len)
    }

    /// Current accumulator for `name`, pending objects not included.
    pub fn primary(&self, name: &str) -> Option<&Histogram> {
        self.primaries.get(name)
    }
}
