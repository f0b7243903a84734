//! Priority-indexed FIFO run queue.
//!
//! 64 buckets of four priorities each, with a 64-bit presence bitmap so the
//! best bucket falls out of a trailing-zeros count. Ties within a bucket are
//! FIFO; a preempted thread goes back on the head of its bucket so it
//! resumes before queue-mates that never ran.

use alloc::collections::VecDeque;

use crate::kwarn;

use super::table::ThreadId;
use super::types::RQ_NQS;

pub struct RunQueue {
    status: u64,
    buckets: [VecDeque<ThreadId>; RQ_NQS],
}

impl RunQueue {
    pub fn new() -> RunQueue {
        RunQueue {
            status: 0,
            buckets: core::array::from_fn(|_| VecDeque::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status == 0
    }

    pub fn bucket_is_empty(&self, bucket: u8) -> bool {
        self.status & (1 << bucket) == 0
    }

    /// Raw presence bitmap; bit `b` set iff bucket `b` is non-empty.
    pub fn status(&self) -> u64 {
        self.status
    }

    /// Insert at the tail of `bucket`, or at the head when `preempted`.
    pub fn insert(&mut self, bucket: u8, tid: ThreadId, preempted: bool) {
        let queue = &mut self.buckets[bucket as usize];
        if preempted {
            queue.push_front(tid);
        } else {
            queue.push_back(tid);
        }
        self.status |= 1 << bucket;
    }

    /// Remove `tid` from `bucket`. When the bucket drains and `cursor`
    /// currently points at it, the cursor advances to the next bucket so a
    /// rotation in progress keeps draining.
    pub fn remove(&mut self, bucket: u8, tid: ThreadId, cursor: Option<&mut u8>) {
        let queue = &mut self.buckets[bucket as usize];
        match queue.iter().position(|&t| t == tid) {
            Some(index) => {
                queue.remove(index);
            }
            None => {
                kwarn!("runq: thread {} not on bucket {}", tid, bucket);
                return;
            }
        }
        if queue.is_empty() {
            self.status &= !(1 << bucket);
            if let Some(cursor) = cursor {
                if *cursor == bucket {
                    *cursor = (bucket + 1) % RQ_NQS as u8;
                }
            }
        }
    }

    /// Head of the lowest-numbered (best) non-empty bucket.
    pub fn choose(&self) -> Option<ThreadId> {
        if self.status == 0 {
            return None;
        }
        let bucket = self.status.trailing_zeros() as usize;
        self.buckets[bucket].front().copied()
    }

    /// Head of the first non-empty bucket scanning circularly from
    /// `start`; implements the timeshare rotation.
    pub fn choose_from(&self, start: u8) -> Option<(ThreadId, u8)> {
        if self.status == 0 {
            return None;
        }
        // Rotate the bitmap so `start` becomes bit 0, then count.
        let rotated = self.status.rotate_right(start as u32);
        let offset = rotated.trailing_zeros() as u8;
        let bucket = (start + offset) % RQ_NQS as u8;
        self.buckets[bucket as usize].front().copied().map(|tid| (tid, bucket))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|q| q.len()).sum()
    }

    #[cfg(test)]
    pub fn count(&self, tid: ThreadId) -> usize {
        self.buckets
            .iter()
            .map(|q| q.iter().filter(|&&t| t == tid).count())
            .sum()
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        RunQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_tracks_bucket_occupancy() {
        let mut rq = RunQueue::new();
        assert!(rq.is_empty());

        rq.insert(5, 1, false);
        rq.insert(5, 2, false);
        rq.insert(63, 3, false);
        assert_eq!(rq.status(), (1 << 5) | (1 << 63));

        rq.remove(5, 1, None);
        assert_eq!(rq.status(), (1 << 5) | (1 << 63), "bucket 5 still occupied");
        rq.remove(5, 2, None);
        assert_eq!(rq.status(), 1 << 63);
        rq.remove(63, 3, None);
        assert!(rq.is_empty());
    }

    #[test]
    fn choose_returns_the_best_bucket_fifo() {
        let mut rq = RunQueue::new();
        rq.insert(10, 7, false);
        rq.insert(10, 8, false);
        rq.insert(3, 9, false);

        assert_eq!(rq.choose(), Some(9));
        rq.remove(3, 9, None);
        // FIFO within the bucket.
        assert_eq!(rq.choose(), Some(7));
        rq.remove(10, 7, None);
        assert_eq!(rq.choose(), Some(8));
    }

    #[test]
    fn preempted_threads_go_back_on_the_head() {
        let mut rq = RunQueue::new();
        rq.insert(4, 1, false);
        rq.insert(4, 2, true);
        assert_eq!(rq.choose(), Some(2));
    }

    #[test]
    fn choose_from_scans_circularly() {
        let mut rq = RunQueue::new();
        rq.insert(2, 1, false);
        rq.insert(40, 2, false);

        assert_eq!(rq.choose_from(0), Some((1, 2)));
        assert_eq!(rq.choose_from(3), Some((2, 40)));
        // Wraps past 63 back to bucket 2.
        assert_eq!(rq.choose_from(41), Some((1, 2)));
        assert_eq!(rq.choose_from(40), Some((2, 40)));
    }

    #[test]
    fn cursor_advances_only_when_its_bucket_drains() {
        let mut rq = RunQueue::new();
        rq.insert(7, 1, false);
        rq.insert(7, 2, false);
        rq.insert(9, 3, false);

        let mut cursor = 7u8;
        rq.remove(7, 1, Some(&mut cursor));
        assert_eq!(cursor, 7, "bucket not yet empty");
        rq.remove(7, 2, Some(&mut cursor));
        assert_eq!(cursor, 8, "cursor follows the drained bucket");
        rq.remove(9, 3, Some(&mut cursor));
        assert_eq!(cursor, 8, "cursor ignores other buckets");
    }

    #[test]
    fn cursor_wraps_at_the_last_bucket() {
        let mut rq = RunQueue::new();
        rq.insert(63, 1, false);
        let mut cursor = 63u8;
        rq.remove(63, 1, Some(&mut cursor));
        assert_eq!(cursor, 0);
    }

    #[test]
    fn insert_remove_round_trips_exactly() {
        let mut rq = RunQueue::new();
        rq.insert(12, 1, false);
        let before = rq.status();
        rq.insert(20, 2, false);
        rq.remove(20, 2, None);
        assert_eq!(rq.status(), before);
        assert_eq!(rq.len(), 1);
        assert_eq!(rq.choose(), Some(1));
    }
}
