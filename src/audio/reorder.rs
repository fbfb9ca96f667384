//! # Chunk Reorder Buffer
//!
//! Restores per-utterance order of audio fragments that arrive (or finish
//! decoding) out of order.
//!
//! ## Ordering rules:
//! - Nothing of an utterance is released until its fragment 0 is registered
//! - After that, fragments are released strictly as 0, 1, 2, ... with no gaps
//! - A new utterance id starting at index 0 becomes the current utterance;
//!   fragments of other ids are held under their own state
//! - Stale or duplicate indices (below the next expected index) are held and
//!   never replayed
//!
//! The buffer is generic over the fragment payload so ordering can be driven
//! with plain values.

use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, warn};

/// Ordering state of one utterance.
#[derive(Debug)]
struct ReorderState<T> {
    slots: BTreeMap<u32, T>,
    next_expected_index: u32,
    started: bool,
}

impl<T> ReorderState<T> {
    fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            next_expected_index: 0,
            started: false,
        }
    }

    /// Release every consecutively available slot starting at the next index.
    fn drain_ready(&mut self, released: &mut Vec<T>) {
        while let Some(fragment) = self.slots.remove(&self.next_expected_index) {
            released.push(fragment);
            self.next_expected_index += 1;
        }
    }

    /// Keep at most `limit` held slots, dropping stale ones first and then
    /// the slot furthest ahead of playback.
    fn enforce_limit(&mut self, limit: usize, utterance_id: &str) {
        while self.slots.len() > limit {
            let stale = self
                .slots
                .keys()
                .next()
                .copied()
                .filter(|&index| self.started && index < self.next_expected_index);
            let victim = match stale.or_else(|| self.slots.keys().next_back().copied()) {
                Some(index) => index,
                None => break,
            };
            self.slots.remove(&victim);
            warn!(
                utterance_id,
                fragment_index = victim,
                "Reorder buffer full, dropped held fragment"
            );
        }
    }
}

/// Per-utterance reorder buffer keyed by utterance id.
#[derive(Debug)]
pub struct ChunkReorderBuffer<T> {
    states: HashMap<String, ReorderState<T>>,
    /// Utterance ids in first-seen order, for bounded retention
    order: VecDeque<String>,
    current: Option<String>,
    max_tracked_utterances: usize,
    max_held_fragments: usize,
}

impl<T> ChunkReorderBuffer<T> {
    pub fn new(max_tracked_utterances: usize, max_held_fragments: usize) -> Self {
        Self {
            states: HashMap::new(),
            order: VecDeque::new(),
            current: None,
            max_tracked_utterances: max_tracked_utterances.max(1),
            max_held_fragments: max_held_fragments.max(1),
        }
    }

    /// Register a fragment and return the fragments now playable, in order.
    pub fn register(&mut self, utterance_id: &str, fragment_index: u32, fragment: T) -> Vec<T> {
        let mut released = Vec::new();
        let is_current = self.current.as_deref() == Some(utterance_id);

        if !self.states.contains_key(utterance_id) {
            self.track(utterance_id);
        }
        let state = self
            .states
            .entry(utterance_id.to_string())
            .or_insert_with(ReorderState::new);

        if is_current {
            if fragment_index == state.next_expected_index {
                released.push(fragment);
                state.next_expected_index += 1;
                state.drain_ready(&mut released);
            } else {
                state.slots.insert(fragment_index, fragment);
            }
        } else if fragment_index == 0 {
            // Switching utterances: expectation restarts at 0 for the new id
            state.slots.remove(&0);
            state.started = true;
            state.next_expected_index = 1;
            released.push(fragment);
            state.drain_ready(&mut released);
            self.current = Some(utterance_id.to_string());
            debug!(utterance_id, "Utterance became current");
        } else {
            state.slots.insert(fragment_index, fragment);
        }

        if let Some(state) = self.states.get_mut(utterance_id) {
            state.enforce_limit(self.max_held_fragments, utterance_id);
        }

        released
    }

    /// Forget all per-utterance state.
    pub fn reset(&mut self) {
        self.states.clear();
        self.order.clear();
        self.current = None;
    }

    /// The utterance whose fragments are currently being released.
    pub fn current_utterance(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Number of fragments held across all utterances.
    pub fn held_count(&self) -> usize {
        self.states.values().map(|state| state.slots.len()).sum()
    }

    pub fn tracked_utterances(&self) -> usize {
        self.states.len()
    }

    fn track(&mut self, utterance_id: &str) {
        self.order.push_back(utterance_id.to_string());
        while self.order.len() > self.max_tracked_utterances {
            // Evict the oldest utterance that is neither playing nor just added
            let candidates = self.order.len() - 1;
            let position = self
                .order
                .iter()
                .take(candidates)
                .position(|id| self.current.as_deref() != Some(id.as_str()));
            let Some(position) = position else { break };
            if let Some(evicted) = self.order.remove(position) {
                if let Some(state) = self.states.remove(&evicted) {
                    warn!(
                        utterance_id = %evicted,
                        held = state.slots.len(),
                        "Evicted reorder state of an old utterance"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn buffer() -> ChunkReorderBuffer<u32> {
        ChunkReorderBuffer::new(16, 256)
    }

    #[test]
    fn test_out_of_order_fragments_are_released_in_order() {
        let mut buffer = buffer();
        assert_eq!(buffer.register("x", 0, 0), vec![0]);
        assert!(buffer.register("x", 2, 2).is_empty());
        assert_eq!(buffer.register("x", 1, 1), vec![1, 2]);
        assert_eq!(buffer.held_count(), 0);
    }

    #[test]
    fn test_nothing_released_before_index_zero() {
        let mut buffer = buffer();
        assert!(buffer.register("x", 3, 3).is_empty());
        assert!(buffer.register("x", 1, 1).is_empty());
        assert!(buffer.register("x", 2, 2).is_empty());
        assert_eq!(buffer.register("x", 0, 0), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_other_utterance_is_held_until_its_start() {
        let mut buffer = buffer();
        assert!(buffer.register("x", 2, 102).is_empty());
        assert_eq!(buffer.register("y", 0, 200), vec![200]);
        assert_eq!(buffer.current_utterance(), Some("y"));
        assert_eq!(buffer.held_count(), 1);

        // x resumes only once its own fragment 0 shows up
        assert_eq!(buffer.register("x", 0, 100), vec![100]);
        assert_eq!(buffer.register("x", 1, 101), vec![101, 102]);
    }

    #[test]
    fn test_reset_gives_fresh_state() {
        let mut buffer = buffer();
        buffer.register("x", 0, 0);
        buffer.register("x", 1, 1);
        buffer.register("x", 5, 5);
        buffer.reset();

        assert_eq!(buffer.current_utterance(), None);
        assert_eq!(buffer.held_count(), 0);
        assert!(buffer.register("x", 2, 2).is_empty());
        assert_eq!(buffer.register("x", 0, 0), vec![0]);
    }

    #[test]
    fn test_duplicates_are_never_replayed() {
        let mut buffer = buffer();
        assert_eq!(buffer.register("x", 0, 0), vec![0]);
        assert_eq!(buffer.register("x", 1, 1), vec![1]);
        assert!(buffer.register("x", 1, 1).is_empty());
        assert!(buffer.register("x", 0, 0).is_empty());
        assert_eq!(buffer.register("x", 2, 2), vec![2]);
    }

    #[test]
    fn test_held_fragments_are_capped() {
        let mut buffer = ChunkReorderBuffer::new(4, 3);
        for index in 1..=5 {
            assert!(buffer.register("x", index, index).is_empty());
        }
        // The furthest-ahead fragments are the ones dropped
        assert_eq!(buffer.held_count(), 3);
        assert_eq!(buffer.register("x", 0, 0), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_stale_fragments_are_evicted_first() {
        let mut buffer = ChunkReorderBuffer::new(4, 2);
        buffer.register("x", 0, 0);
        buffer.register("x", 1, 1);
        assert!(buffer.register("x", 0, 0).is_empty());
        assert!(buffer.register("x", 5, 5).is_empty());
        assert!(buffer.register("x", 4, 4).is_empty());
        // The stale duplicate of 0 went first, so 4 and 5 survive
        assert_eq!(buffer.held_count(), 2);
        assert!(buffer.register("x", 3, 3).is_empty());
        assert_eq!(buffer.register("x", 2, 2), vec![2, 3, 4]);
    }

    #[test]
    fn test_tracked_utterances_are_bounded() {
        let mut buffer = ChunkReorderBuffer::new(2, 16);
        buffer.register("a", 0, 0);
        buffer.register("b", 1, 1);
        buffer.register("c", 1, 1);
        assert_eq!(buffer.tracked_utterances(), 2);
        // The current utterance survives eviction
        assert_eq!(buffer.current_utterance(), Some("a"));
        assert_eq!(buffer.register("a", 1, 1), vec![1]);
    }

    proptest! {
        #[test]
        fn prop_any_arrival_order_replays_in_order(
            order in (1usize..=20).prop_flat_map(|n| Just((0..n as u32).collect::<Vec<_>>()).prop_shuffle())
        ) {
            let mut buffer = ChunkReorderBuffer::new(16, 256);
            let mut released = Vec::new();
            for index in &order {
                released.extend(buffer.register("utt", *index, *index));
            }
            let expected: Vec<u32> = (0..order.len() as u32).collect();
            prop_assert_eq!(released, expected);
        }
    }
}
