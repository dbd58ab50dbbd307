//! # Replay Buffer Module
//!
//! Bounded per-session log of terminal output used to bring reconnecting
//! clients back up to date. Each chunk the subprocess produces is stored
//! under a monotonically increasing sequence number; a client that presents
//! the last sequence number it saw receives only what it missed.
//!
//! The buffer cannot be trimmed at an arbitrary byte offset because a cut
//! could land in the middle of a terminal escape sequence and corrupt the
//! replayed screen. Eviction is therefore whole-chunk, and the last chunk is
//! never evicted even when it alone exceeds the limit, so a reconnecting
//! client always has something to resume from.

use std::collections::VecDeque;

/// Default cap on buffered output bytes per session.
pub const DEFAULT_REPLAY_LIMIT: usize = 50_000;

struct Entry {
    seq: u64,
    data: String,
}

/// Bounded log of `(sequence, chunk)` output entries
pub struct ReplayBuffer {
    entries: VecDeque<Entry>,
    total_bytes: usize,
    sequence: u64,
    limit: usize,
}

impl ReplayBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            total_bytes: 0,
            sequence: 0,
            limit,
        }
    }

    /// Append one output chunk, returning its assigned sequence number.
    ///
    /// Evicts whole chunks from the front until the byte total is back under
    /// the limit or only a single entry remains.
    pub fn append(&mut self, data: String) -> u64 {
        self.sequence += 1;
        self.total_bytes += data.len();
        self.entries.push_back(Entry {
            seq: self.sequence,
            data,
        });

        while self.entries.len() > 1 && self.total_bytes > self.limit {
            if let Some(evicted) = self.entries.pop_front() {
                self.total_bytes -= evicted.data.len();
            }
        }

        self.sequence
    }

    /// Concatenation of every chunk with a sequence number strictly greater
    /// than `after` (`-1` means everything), plus the sequence number the
    /// client should resume from: the last stored entry's, or `after`
    /// unchanged when nothing is buffered.
    pub fn replay_since(&self, after: i64) -> (String, i64) {
        let data: String = self
            .entries
            .iter()
            .filter(|entry| entry.seq as i64 > after)
            .map(|entry| entry.data.as_str())
            .collect();

        let latest = self
            .entries
            .back()
            .map(|entry| entry.seq as i64)
            .unwrap_or(after);

        (data, latest)
    }

    /// Drop all entries and restart sequence numbering from zero. Called
    /// exactly when the backing process exits.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
        self.sequence = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_strictly_increasing_without_gaps() {
        let mut buffer = ReplayBuffer::new(DEFAULT_REPLAY_LIMIT);
        for expected in 1..=100u64 {
            assert_eq!(buffer.append("x".to_string()), expected);
        }
    }

    #[test]
    fn eviction_keeps_total_under_limit() {
        let mut buffer = ReplayBuffer::new(10);
        for _ in 0..50 {
            buffer.append("abcd".to_string());
            assert!(buffer.total_bytes() <= 10 || buffer.len() == 1);
        }
        assert!(buffer.total_bytes() <= 10);
    }

    #[test]
    fn oversized_chunk_survives_as_last_entry() {
        let mut buffer = ReplayBuffer::new(10);
        buffer.append("ab".to_string());
        let seq = buffer.append("x".repeat(100));

        // Everything else is evicted, the oversized chunk is not.
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.total_bytes(), 100);
        let (data, latest) = buffer.replay_since(-1);
        assert_eq!(data.len(), 100);
        assert_eq!(latest, seq as i64);
    }

    #[test]
    fn replay_since_returns_only_newer_chunks_in_order() {
        let mut buffer = ReplayBuffer::new(DEFAULT_REPLAY_LIMIT);
        buffer.append("a".to_string());
        buffer.append("b".to_string());
        buffer.append("c".to_string());

        let (data, latest) = buffer.replay_since(1);
        assert_eq!(data, "bc");
        assert_eq!(latest, 3);
    }

    #[test]
    fn replay_since_minus_one_returns_everything() {
        let mut buffer = ReplayBuffer::new(DEFAULT_REPLAY_LIMIT);
        buffer.append("a".to_string());
        buffer.append("b".to_string());

        let (data, latest) = buffer.replay_since(-1);
        assert_eq!(data, "ab");
        assert_eq!(latest, 2);
    }

    #[test]
    fn replay_on_empty_buffer_echoes_client_sequence() {
        let buffer = ReplayBuffer::new(DEFAULT_REPLAY_LIMIT);
        assert_eq!(buffer.replay_since(-1), (String::new(), -1));
        assert_eq!(buffer.replay_since(42), (String::new(), 42));
    }

    #[test]
    fn reset_clears_entries_and_restarts_numbering() {
        let mut buffer = ReplayBuffer::new(DEFAULT_REPLAY_LIMIT);
        buffer.append("a".to_string());
        buffer.append("b".to_string());
        buffer.reset();

        assert!(buffer.is_empty());
        assert_eq!(buffer.replay_since(-1), (String::new(), -1));
        assert_eq!(buffer.append("c".to_string()), 1);
    }
}
