//! One FIFO per priority level.

use std::collections::VecDeque;

use crate::types::{Priority, PRIORITY_LEVELS};

/// Priority-bucketed FIFO queue.
///
/// `push` and `pop` touch a single level; `peek` scans from the highest level
/// down and is O(levels), independent of the number of queued items.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    levels: [VecDeque<T>; PRIORITY_LEVELS],
    len: usize,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        PriorityQueue { levels: std::array::from_fn(|_| VecDeque::new()), len: 0 }
    }

    pub fn push(&mut self, priority: Priority, item: T) {
        self.levels[priority.level()].push_back(item);
        self.len += 1;
    }

    /// Head of the highest non-empty level.
    pub fn peek(&self) -> Option<(Priority, &T)> {
        Priority::ALL
            .iter()
            .rev()
            .find_map(|&p| self.levels[p.level()].front().map(|item| (p, item)))
    }

    pub fn pop(&mut self) -> Option<(Priority, T)> {
        for &p in Priority::ALL.iter().rev() {
            if let Some(item) = self.levels[p.level()].pop_front() {
                self.len -= 1;
                return Some((p, item));
            }
        }
        None
    }

    /// Highest priority with queued items.
    pub fn highest_priority(&self) -> Option<Priority> {
        self.peek().map(|(p, _)| p)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len_at(&self, priority: Priority) -> usize {
        self.levels[priority.level()].len()
    }

    /// Moves `item` from level `from` to the back of level `to`. Returns
    /// `false` when `item` is not queued at `from`.
    pub fn requeue(&mut self, item: &T, from: Priority, to: Priority) -> bool
    where
        T: PartialEq,
    {
        let level = &mut self.levels[from.level()];
        let Some(at) = level.iter().position(|queued| queued == item) else {
            return false;
        };
        if from != to {
            if let Some(item) = level.remove(at) {
                self.levels[to.level()].push_back(item);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_highest_level_first_fifo_within_level() {
        let mut q = PriorityQueue::new();
        q.push(Priority::Low, "low-a");
        q.push(Priority::High, "high-a");
        q.push(Priority::Low, "low-b");
        q.push(Priority::High, "high-b");
        q.push(Priority::Medium, "med");

        let order: Vec<_> = std::iter::from_fn(|| q.pop().map(|(_, v)| v)).collect();
        assert_eq!(order, ["high-a", "high-b", "med", "low-a", "low-b"]);
        assert!(q.is_empty());
    }

    #[test]
    fn peek_does_not_remove() {
        let mut q = PriorityQueue::new();
        assert!(q.peek().is_none());
        q.push(Priority::Min, 1);
        q.push(Priority::Max, 2);
        assert_eq!(q.peek(), Some((Priority::Max, &2)));
        assert_eq!(q.len(), 2);
        assert_eq!(q.highest_priority(), Some(Priority::Max));
        assert_eq!(q.len_at(Priority::Min), 1);
    }

    #[test]
    fn requeue_moves_item_behind_target_level() {
        let mut q = PriorityQueue::new();
        q.push(Priority::Low, 1);
        q.push(Priority::Low, 2);
        q.push(Priority::High, 3);

        assert!(q.requeue(&2, Priority::Low, Priority::High));
        assert!(!q.requeue(&2, Priority::Low, Priority::Max));
        assert_eq!(q.len(), 3);
        assert_eq!(q.len_at(Priority::Low), 1);

        let order: Vec<_> = std::iter::from_fn(|| q.pop()).collect();
        assert_eq!(order, [(Priority::High, 3), (Priority::High, 2), (Priority::Low, 1)]);
    }
}
