use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::PathfinderError;


/// A label and a stop id, the unit of work of the labeling loop.
#[derive(Clone, Copy, Debug)]
pub struct LabelStop {
    pub label: f64,
    pub stop_id: i32,
}

// Reverse the ordering so the binary heap where this is used acts as a min-heap;
// ties go to the lower stop id.
impl Ord for LabelStop {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.label.total_cmp(&self.label) {
            Ordering::Equal => other.stop_id.cmp(&self.stop_id),
            ord => ord,
        }
    }
}

impl PartialOrd for LabelStop {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        return Some(self.cmp(other));
    }
}

impl PartialEq for LabelStop {
    fn eq(&self, other: &Self) -> bool {
        return self.cmp(other) == Ordering::Equal;
    }
}

impl Eq for LabelStop {}


struct LabelCount {
    // lowest label for this stop among the heap entries (the only valid one)
    label: f64,
    // is this stop still waiting to be processed?
    valid: bool,
    // number of instances of this stop in the heap, valid and invalid
    instances: i32,
}

/// A min-priority queue of (label, stop) pairs in which each stop id has at most
/// one *active* entry at a time.
///
/// Re-labeling a stop with a better label leaves the old heap entry behind as a
/// tombstone; `pop_top` skips tombstones lazily.  This keeps pushes cheap while
/// guaranteeing a stop marked for processing is processed once, at its lowest
/// label.
pub struct LabelStopQueue {
    heap: BinaryHeap<LabelStop>,
    label_count: HashMap<i32, LabelCount>,
    valid_count: usize,
}

impl LabelStopQueue {
    pub fn new() -> LabelStopQueue {
        return LabelStopQueue {
            heap: BinaryHeap::new(),
            label_count: HashMap::new(),
            valid_count: 0,
        };
    }

    pub fn push(&mut self, label_stop: LabelStop) {
        match self.label_count.get_mut(&label_stop.stop_id) {
            None => {
                // the stop is not in here, no problem
                self.heap.push(label_stop);
                self.label_count.insert(label_stop.stop_id, LabelCount {
                    label: label_stop.label,
                    valid: true,
                    instances: 1,
                });
                self.valid_count += 1;
            }
            Some(lc) if !lc.valid => {
                // all valid instances were already popped, so it's as if it's not here
                self.heap.push(label_stop);
                lc.label = label_stop.label;
                lc.valid = true;
                lc.instances += 1;
                self.valid_count += 1;
            }
            Some(lc) => {
                // in the queue and valid; only a strictly lower label displaces it
                if label_stop.label < lc.label {
                    self.heap.push(label_stop);
                    lc.label = label_stop.label;
                    lc.instances += 1;
                    // the displaced entry becomes a tombstone; no new valid count
                }
            }
        }
    }

    /// Pop the lowest-label *valid* entry, skipping tombstones.
    pub fn pop_top(&mut self) -> Result<LabelStop, PathfinderError> {
        loop {
            let top = match self.heap.peek() {
                Some(top) => *top,
                None => return Err(PathfinderError::QueueInvariant(
                    "pop_top called with no heap entries left")),
            };
            let lc = match self.label_count.get_mut(&top.stop_id) {
                Some(lc) => lc,
                None => return Err(PathfinderError::QueueInvariant(
                    "popped stop is missing from the label count map")),
            };
            if lc.instances <= 0 {
                return Err(PathfinderError::QueueInvariant(
                    "popped stop has a non-positive instance count"));
            }

            // a tombstone: either the stop was already processed, or this entry
            // carries a label that was later improved on
            if !lc.valid || lc.label != top.label {
                lc.instances -= 1;
                self.heap.pop();
                continue;
            }

            lc.valid = false;
            lc.instances -= 1;
            self.valid_count -= 1;
            self.heap.pop();
            return Ok(top);
        }
    }

    pub fn size(&self) -> usize {
        return self.valid_count;
    }

    pub fn empty(&self) -> bool {
        return self.valid_count == 0;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rand::SeedableRng;
    use rand_isaac::Isaac64Rng;

    #[test]
    fn test_push_pop_single() {
        let mut queue = LabelStopQueue::new();
        queue.push(LabelStop { label: 5.0, stop_id: 3 });
        assert_eq!(queue.size(), 1);
        let top = queue.pop_top().unwrap();
        assert_eq!(top.stop_id, 3);
        assert_eq!(top.label, 5.0);
        assert!(queue.empty());
    }

    #[test]
    fn test_lower_label_wins() {
        let mut queue = LabelStopQueue::new();
        queue.push(LabelStop { label: 5.0, stop_id: 3 });
        queue.push(LabelStop { label: 2.0, stop_id: 3 });
        // a worse label for the same stop is discarded entirely
        queue.push(LabelStop { label: 9.0, stop_id: 3 });
        assert_eq!(queue.size(), 1);
        let top = queue.pop_top().unwrap();
        assert_eq!(top.label, 2.0);
        assert!(queue.empty());
    }

    #[test]
    fn test_repromotion_after_pop() {
        let mut queue = LabelStopQueue::new();
        queue.push(LabelStop { label: 5.0, stop_id: 3 });
        queue.pop_top().unwrap();
        // the stop was processed, so a new push makes it valid again
        queue.push(LabelStop { label: 7.0, stop_id: 3 });
        assert_eq!(queue.size(), 1);
        let top = queue.pop_top().unwrap();
        assert_eq!(top.label, 7.0);
    }

    #[test]
    fn test_tie_breaks_by_stop_id() {
        let mut queue = LabelStopQueue::new();
        queue.push(LabelStop { label: 4.0, stop_id: 9 });
        queue.push(LabelStop { label: 4.0, stop_id: 2 });
        queue.push(LabelStop { label: 4.0, stop_id: 5 });
        assert_eq!(queue.pop_top().unwrap().stop_id, 2);
        assert_eq!(queue.pop_top().unwrap().stop_id, 5);
        assert_eq!(queue.pop_top().unwrap().stop_id, 9);
    }

    #[test]
    fn test_pop_empty_is_invariant_violation() {
        let mut queue = LabelStopQueue::new();
        assert!(queue.pop_top().is_err());
    }

    // popping a randomly scripted queue yields stops in non-decreasing label
    // order, with each stop appearing at most once per promotion
    #[test]
    fn test_random_script_pops_sorted() {
        let mut rng = Isaac64Rng::seed_from_u64(17);
        for _ in 0..20 {
            let mut queue = LabelStopQueue::new();
            let num_pushes = rng.gen_range(1..200);
            for _ in 0..num_pushes {
                let stop_id = rng.gen_range(0..40);
                let label = rng.gen_range(0..1000) as f64 / 10.0;
                queue.push(LabelStop { label, stop_id });
            }

            let mut last_label = f64::NEG_INFINITY;
            let mut num_pops = 0;
            while !queue.empty() {
                let top = queue.pop_top().unwrap();
                assert!(top.label >= last_label);
                last_label = top.label;
                num_pops += 1;
            }
            assert!(num_pops <= 40);
        }
    }
}
