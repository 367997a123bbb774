//! Priority backlog of admitted-but-not-running healing tasks

use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    priority: i32,
    seq: u64,
    task_id: String,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (earlier submission)
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending tasks ordered by priority descending, FIFO within equal priority.
#[derive(Debug, Default)]
pub struct Backlog {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task_id: impl Into<String>, priority: i32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            priority,
            seq,
            task_id: task_id.into(),
        });
    }

    /// Highest-priority, earliest-submitted task
    pub fn pop(&mut self) -> Option<String> {
        self.heap.pop().map(|e| e.task_id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
