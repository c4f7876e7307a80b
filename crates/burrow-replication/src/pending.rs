//! Tracks in-flight replicated revisions against an ever-increasing local
//! "fake sequence" counter, translating real (possibly opaque) remote
//! sequence values into checkpoint progress. Revisions can complete out of
//! order once dispatch spans multiple concurrent requests; the checkpoint
//! only advances past a contiguous run of completed entries, so a slow
//! request never lets a later one's sequence get checkpointed ahead of it.

use std::collections::VecDeque;

use burrow_core::document::Seq;

struct Entry {
    fake_seq: u64,
    real_seq: Seq,
    done: bool,
}

/// Assigns monotonically increasing local sequence numbers to queued
/// revisions and tracks which have completed.
pub struct PendingSequences {
    next_fake: u64,
    entries: VecDeque<Entry>,
}

impl PendingSequences {
    pub fn new() -> Self {
        Self { next_fake: 0, entries: VecDeque::new() }
    }

    /// Reserve the next fake sequence for a revision tied to `real_seq`.
    pub fn assign(&mut self, real_seq: Seq) -> u64 {
        let fake_seq = self.next_fake;
        self.next_fake += 1;
        self.entries.push_back(Entry { fake_seq, real_seq, done: false });
        fake_seq
    }

    /// Mark a previously assigned fake sequence as complete.
    pub fn complete(&mut self, fake_seq: u64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.fake_seq == fake_seq) {
            entry.done = true;
        }
    }

    /// Drop the contiguous completed prefix and return the highest real
    /// sequence it reached, or `None` if nothing new completed.
    pub fn advance(&mut self) -> Option<Seq> {
        let mut last = None;
        while matches!(self.entries.front(), Some(e) if e.done) {
            last = self.entries.pop_front().map(|e| e.real_seq);
        }
        last
    }

    /// Count of assigned-but-not-yet-completed entries — the downloads
    /// backlog depth `kChangeQueueThreshold` bounds.
    pub fn depth(&self) -> usize {
        self.entries.len()
    }
}

impl Default for PendingSequences {
    fn default() -> Self {
        Self::new()
    }
}
