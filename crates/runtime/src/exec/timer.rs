//! Deadline heap
//!
//! Min-heap over sleep and mailbox-timeout deadlines, consulted by the
//! scheduler before each dispatch. Entries are lazily invalidated: expiry
//! only acts when the task is still in the matching wait state.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerKind {
    Sleep,
    MbxTimeout { descriptor: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerEntry {
    pub deadline_ms: i64,
    pub pid: u32,
    pub kind: TimerKind,
}

#[derive(Default)]
pub struct TimerHeap {
    heap: BinaryHeap<Reverse<TimerEntry>>,
}

impl TimerHeap {
    pub fn insert(&mut self, entry: TimerEntry) {
        self.heap.push(Reverse(entry));
    }

    /// Pop every entry due at or before `now_ms`.
    pub fn expire(&mut self, now_ms: i64) -> Vec<TimerEntry> {
        let mut out = Vec::new();
        while let Some(Reverse(front)) = self.heap.peek() {
            if front.deadline_ms > now_ms {
                break;
            }
            if let Some(Reverse(e)) = self.heap.pop() {
                out.push(e);
            }
        }
        out
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<i64> {
        self.heap.peek().map(|Reverse(e)| e.deadline_ms)
    }

    pub fn remove_pid(&mut self, pid: u32) {
        let entries: Vec<TimerEntry> = self
            .heap
            .drain()
            .map(|Reverse(e)| e)
            .filter(|e| e.pid != pid)
            .collect();
        for e in entries {
            self.heap.push(Reverse(e));
        }
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
    fn test_expiry_order() {
        let mut h = TimerHeap::default();
        h.insert(TimerEntry { deadline_ms: 30, pid: 2, kind: TimerKind::Sleep });
        h.insert(TimerEntry { deadline_ms: 10, pid: 1, kind: TimerKind::Sleep });
        h.insert(TimerEntry { deadline_ms: 20, pid: 3, kind: TimerKind::MbxTimeout { descriptor: 5 } });

        assert_eq!(h.next_deadline(), Some(10));
        let due = h.expire(25);
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].pid, 1);
        assert_eq!(due[1].pid, 3);
        assert_eq!(h.next_deadline(), Some(30));
    }

    #[test]
    fn test_remove_pid() {
        let mut h = TimerHeap::default();
        h.insert(TimerEntry { deadline_ms: 10, pid: 1, kind: TimerKind::Sleep });
        h.insert(TimerEntry { deadline_ms: 20, pid: 2, kind: TimerKind::Sleep });
        h.remove_pid(1);
        assert_eq!(h.len(), 1);
        assert_eq!(h.next_deadline(), Some(20));
    }
}
