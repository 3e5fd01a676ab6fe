//! Folding an attempt's outcomes into per-question counter deltas.

use std::collections::BTreeMap;
use std::collections::btree_map;

use crate::model::{AttemptRecord, QuestionId, ResultItem, StatDelta};

/// Per-question deltas derived from one attempt.
///
/// Keys are kept ordered so that splitting the set into store-sized chunks
/// is deterministic for a given record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaSet {
    deltas: BTreeMap<QuestionId, StatDelta>,
}

impl DeltaSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a single outcome.
    pub fn record(&mut self, item: &ResultItem) {
        match self.deltas.entry(item.question_id.clone()) {
            btree_map::Entry::Occupied(mut entry) => entry.get_mut().record(item.is_correct),
            btree_map::Entry::Vacant(entry) => {
                entry.insert(StatDelta::single(item.is_correct));
            }
        }
    }

    #[must_use]
    pub fn get(&self, question_id: &QuestionId) -> Option<StatDelta> {
        self.deltas.get(question_id).copied()
    }

    /// Number of distinct questions touched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&QuestionId, StatDelta)> {
        self.deltas.iter().map(|(id, delta)| (id, *delta))
    }

    /// Split into consecutive groups of at most `size` entries, in key order.
    ///
    /// A `size` of zero is treated as one.
    #[must_use]
    pub fn chunks(&self, size: usize) -> Vec<Vec<(QuestionId, StatDelta)>> {
        let entries: Vec<_> = self
            .deltas
            .iter()
            .map(|(id, delta)| (id.clone(), *delta))
            .collect();
        entries.chunks(size.max(1)).map(<[_]>::to_vec).collect()
    }
}

impl<'a> FromIterator<&'a ResultItem> for DeltaSet {
    fn from_iter<I: IntoIterator<Item = &'a ResultItem>>(iter: I) -> Self {
        let mut set = Self::new();
        for item in iter {
            set.record(item);
        }
        set
    }
}

/// Compute the counter deltas for one attempt. Pure; no I/O.
#[must_use]
pub fn aggregate(record: &AttemptRecord) -> DeltaSet {
    record.results().iter().collect()
}
