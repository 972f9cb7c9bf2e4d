use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use uuid::Uuid;

/// In-memory job queue ordered by priority.
///
/// Higher priority pops first; among equal priorities, earlier pushes pop
/// first. [`push_front`](Self::push_front) places a job ahead of every
/// queued job of the same priority (used for retries).
#[derive(Debug, Default)]
pub struct PriorityJobQueue {
    heap: BinaryHeap<Entry>,
    next_seq: i64,
    next_front_seq: i64,
}

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    priority: u8,
    seq: Reverse<i64>,
    job_id: Uuid,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PriorityJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job_id: Uuid, priority: u8) {
        self.next_seq += 1;
        self.heap.push(Entry {
            priority,
            seq: Reverse(self.next_seq),
            job_id,
        });
    }

    pub fn push_front(&mut self, job_id: Uuid, priority: u8) {
        self.next_front_seq -= 1;
        self.heap.push(Entry {
            priority,
            seq: Reverse(self.next_front_seq),
            job_id,
        });
    }

    pub fn pop(&mut self) -> Option<Uuid> {
        self.heap.pop().map(|e| e.job_id)
    }

    /// Remove a queued job. Returns `false` if it was not queued.
    pub fn remove(&mut self, job_id: Uuid) -> bool {
        let before = self.heap.len();
        self.heap.retain(|e| e.job_id != job_id);
        self.heap.len() != before
    }

    pub fn contains(&self, job_id: Uuid) -> bool {
        self.heap.iter().any(|e| e.job_id == job_id)
    }

    /// Remove and return every queued job id, in pop order.
    pub fn drain(&mut self) -> Vec<Uuid> {
        let mut ids = Vec::with_capacity(self.heap.len());
        while let Some(id) = self.pop() {
            ids.push(id);
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_higher_priority_first() {
        let mut q = PriorityJobQueue::new();
        let (low, high) = (Uuid::new_v4(), Uuid::new_v4());
        q.push(low, 1);
        q.push(high, 9);
        assert_eq!(q.pop(), Some(high));
        assert_eq!(q.pop(), Some(low));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut q = PriorityJobQueue::new();
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            q.push(*id, 5);
        }
        assert_eq!(q.drain(), ids);
    }

    #[test]
    fn test_equal_priority_pops_in_push_order() {
        let mut q = PriorityJobQueue::new();
        let (first, second, third, other) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        q.push(first, 5);
        q.push(other, 2);
        q.push(second, 5);
        q.push(third, 5);
        assert_eq!(q.pop(), Some(first));
        assert_eq!(q.pop(), Some(second));
        assert_eq!(q.pop(), Some(third));
        assert_eq!(q.pop(), Some(other));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_push_front_jumps_same_priority() {
        let mut q = PriorityJobQueue::new();
        let (a, b, retry, urgent) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        q.push(a, 5);
        q.push(b, 5);
        q.push_front(retry, 5);
        q.push(urgent, 8);
        assert_eq!(q.drain(), vec![urgent, retry, a, b]);
    }

    #[test]
    fn test_remove() {
        let mut q = PriorityJobQueue::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        q.push(a, 5);
        q.push(b, 5);
        assert!(q.remove(a));
        assert!(!q.remove(a));
        assert!(!q.contains(a));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop(), Some(b));
        assert!(q.is_empty());
    }
}
