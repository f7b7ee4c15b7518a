//! Identity-based message deduplication.
//!
//! Two layers compose here:
//! - [`deduplicate`] collapses repeats inside one sequence (a fetch, or the
//!   orchestrator's accumulated buffer).
//! - [`Deduplicator`] remembers every id admitted over the process lifetime
//!   and rejects redeliveries in later cycles.

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::data::UniqueMessage;
use crate::types::ClassificationId;

/// Keep one message per `classification_id`, preserving first-seen order.
///
/// Idempotent: applying it to its own output returns the same sequence.
pub fn deduplicate<I>(messages: I) -> Vec<UniqueMessage>
where
    I: IntoIterator<Item = UniqueMessage>,
{
    let mut by_id: IndexMap<ClassificationId, UniqueMessage> = IndexMap::new();
    for message in messages {
        by_id.entry(message.classification_id()).or_insert(message);
    }
    by_id.into_values().collect()
}

/// Result of admitting a sequence through a [`Deduplicator`].
#[derive(Debug, Default)]
pub struct Admission {
    /// Messages whose ids had never been seen before.
    pub accepted: Vec<UniqueMessage>,
    /// Ids rejected because an earlier call already admitted them.
    pub repeated: Vec<ClassificationId>,
}

/// Process-lifetime registry of admitted classification ids.
///
/// The set only grows; ids are never pruned.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: HashSet<ClassificationId>,
}

impl Deduplicator {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when `id` was admitted by an earlier call.
    pub fn has_seen(&self, id: ClassificationId) -> bool {
        self.seen.contains(&id)
    }

    /// Record `ids` as seen without admitting messages.
    pub fn mark_seen<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = ClassificationId>,
    {
        self.seen.extend(ids);
    }

    /// Split `messages` into never-seen messages and repeats of earlier calls.
    ///
    /// Repeats within `messages` itself are collapsed first, so a message
    /// duplicated inside one call is accepted once rather than reported.
    pub fn admit<I>(&mut self, messages: I) -> Admission
    where
        I: IntoIterator<Item = UniqueMessage>,
    {
        let mut admission = Admission::default();
        let unique = deduplicate(messages);
        for message in &unique {
            if self.seen.contains(&message.classification_id()) {
                admission.repeated.push(message.classification_id());
            }
        }
        for message in unique {
            if self.seen.insert(message.classification_id()) {
                admission.accepted.push(message);
            }
        }
        admission
    }

    /// Number of distinct ids seen so far.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Returns `true` when no id has been seen.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(id: i64, tag: &str) -> UniqueMessage {
        UniqueMessage::new(json!({"classification_id": id, "tag": tag})).unwrap()
    }

    fn ids(messages: &[UniqueMessage]) -> Vec<ClassificationId> {
        messages.iter().map(UniqueMessage::classification_id).collect()
    }

    #[test]
    fn deduplicate_keeps_one_per_id_and_is_idempotent() {
        let input = vec![msg(3, "a"), msg(1, "b"), msg(3, "c"), msg(2, "d"), msg(1, "e")];
        let once = deduplicate(input);
        assert_eq!(ids(&once), vec![3, 1, 2]);
        assert_eq!(once[0].message()["tag"], "a");
        let twice = deduplicate(once.clone());
        assert_eq!(ids(&twice), ids(&once));
    }

    #[test]
    fn deduplicate_is_order_independent_as_a_set() {
        let forward = deduplicate(vec![msg(1, "a"), msg(2, "b"), msg(1, "c")]);
        let backward = deduplicate(vec![msg(1, "c"), msg(2, "b"), msg(1, "a")]);
        let mut left = ids(&forward);
        let mut right = ids(&backward);
        left.sort();
        right.sort();
        assert_eq!(left, right);
    }

    #[test]
    fn admit_rejects_ids_from_prior_calls() {
        let mut dedup = Deduplicator::new();
        let first = dedup.admit(vec![msg(1, "a"), msg(2, "b"), msg(2, "b")]);
        assert_eq!(ids(&first.accepted), vec![1, 2]);
        assert!(first.repeated.is_empty());

        let second = dedup.admit(vec![msg(2, "b"), msg(3, "c")]);
        assert_eq!(ids(&second.accepted), vec![3]);
        assert_eq!(second.repeated, vec![2]);
        assert_eq!(dedup.len(), 3);
        assert!(dedup.has_seen(1));
    }

    #[test]
    fn mark_seen_suppresses_later_admission() {
        let mut dedup = Deduplicator::new();
        assert!(dedup.is_empty());
        dedup.mark_seen([7]);
        let admission = dedup.admit(vec![msg(7, "x")]);
        assert!(admission.accepted.is_empty());
        assert_eq!(admission.repeated, vec![7]);
    }
}
