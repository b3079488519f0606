//! Index-addressed raft log with a movable origin
//!
//! `entries[0]` always sits at `start_index` (0 before any compaction, the
//! snapshot index afterwards) and carries the term of that index. Everything
//! before `start_index` lives only in the snapshot.

use super::errors::{Error, Result};
use super::message::LogEntry;

#[derive(Debug, Clone)]
pub struct RaftLog {
    start_index: u64,
    entries: Vec<LogEntry>,
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RaftLog {
    pub fn new() -> Self {
        RaftLog {
            start_index: 0,
            entries: vec![LogEntry::sentinel(0)],
        }
    }

    /// Rebuild a log from its persisted suffix
    pub fn from_parts(start_index: u64, entries: Vec<LogEntry>) -> Result<Self> {
        if entries.is_empty() {
            return Err(Error::Corrupt(format!(
                "no sentinel entry at snapshot index {}",
                start_index
            )));
        }
        Ok(RaftLog {
            start_index,
            entries,
        })
    }

    pub fn snapshot_index(&self) -> u64 {
        self.start_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.entries[0].term
    }

    pub fn last_index(&self) -> u64 {
        self.start_index + self.entries.len() as u64 - 1
    }

    pub fn last_term(&self) -> u64 {
        self.entries[self.entries.len() - 1].term
    }

    /// Entries from the snapshot sentinel onward, as persisted
    pub fn suffix(&self) -> &[LogEntry] {
        &self.entries
    }

    fn offset(&self, index: u64) -> Option<usize> {
        if index < self.start_index || index > self.last_index() {
            return None;
        }
        Some((index - self.start_index) as usize)
    }

    /// Term at `index`, `None` if compacted away or past the end
    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.offset(index).map(|i| self.entries[i].term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        self.offset(index).map(|i| &self.entries[i])
    }

    /// Entries at `index` and after; empty if `index` is past the end.
    /// Callers must not ask for compacted indices.
    pub fn entries_from(&self, index: u64) -> &[LogEntry] {
        debug_assert!(index > self.start_index);
        match self.offset(index) {
            Some(i) => &self.entries[i..],
            None => &[],
        }
    }

    pub fn append(&mut self, entry: LogEntry) -> u64 {
        self.entries.push(entry);
        self.last_index()
    }

    /// Drop every entry at `index` and after. The sentinel is never removed.
    pub fn truncate_from(&mut self, index: u64) {
        if let Some(i) = self.offset(index) {
            self.entries.truncate(i.max(1));
        }
    }

    /// Lowest retained index whose entry has `term`
    pub fn first_index_of_term(&self, term: u64) -> Option<u64> {
        self.entries
            .iter()
            .position(|e| e.term == term)
            .map(|i| self.start_index + i as u64)
    }

    /// Whether a log ending at (`last_index`, `last_term`) is at least as up
    /// to date as this one
    pub fn is_up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        let my_term = self.last_term();
        last_term > my_term || (last_term == my_term && last_index >= self.last_index())
    }

    /// Discard everything before `index`, which becomes the new sentinel.
    /// Returns false when `index` is not strictly inside the retained log.
    pub fn compact_to(&mut self, index: u64) -> bool {
        let Some(i) = self.offset(index) else {
            return false;
        };
        if i == 0 {
            return false;
        }
        let term = self.entries[i].term;
        self.entries.drain(..i);
        self.entries[0] = LogEntry::sentinel(term);
        self.start_index = index;
        true
    }

    /// Move the origin to a snapshot at (`index`, `term`), keeping any
    /// suffix that still agrees with it
    pub fn install_snapshot(&mut self, index: u64, term: u64) {
        if index > self.start_index && self.term_at(index) == Some(term) {
            self.compact_to(index);
            return;
        }
        self.start_index = index;
        self.entries = vec![LogEntry::sentinel(term)];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_terms(terms: &[u64]) -> RaftLog {
        let mut log = RaftLog::new();
        for (i, t) in terms.iter().enumerate() {
            log.append(LogEntry::new(*t, vec![i as u8]));
        }
        log
    }

    #[test]
    fn test_new_log_has_only_sentinel() {
        let log = RaftLog::new();
        assert_eq!(log.snapshot_index(), 0);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), None);
    }

    #[test]
    fn test_append_and_read() {
        let log = log_with_terms(&[1, 1, 2]);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.entry(2).unwrap().command, vec![1]);
        assert_eq!(log.entries_from(2).len(), 2);
        assert!(log.entries_from(4).is_empty());
    }

    #[test]
    fn test_truncate_keeps_sentinel() {
        let mut log = log_with_terms(&[1, 1, 2]);
        log.truncate_from(2);
        assert_eq!(log.last_index(), 1);
        log.truncate_from(0);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.suffix().len(), 1);
    }

    #[test]
    fn test_first_index_of_term() {
        let log = log_with_terms(&[1, 1, 3, 3, 3]);
        assert_eq!(log.first_index_of_term(3), Some(3));
        assert_eq!(log.first_index_of_term(1), Some(1));
        assert_eq!(log.first_index_of_term(2), None);
    }

    #[test]
    fn test_up_to_date_comparison() {
        let log = log_with_terms(&[1, 2, 2]);
        assert!(log.is_up_to_date(1, 3));
        assert!(log.is_up_to_date(3, 2));
        assert!(log.is_up_to_date(5, 2));
        assert!(!log.is_up_to_date(2, 2));
        assert!(!log.is_up_to_date(10, 1));
    }

    #[test]
    fn test_compaction_moves_origin() {
        let mut log = log_with_terms(&[1, 1, 2, 2, 3]);
        assert!(log.compact_to(3));
        assert_eq!(log.snapshot_index(), 3);
        assert_eq!(log.snapshot_term(), 2);
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.term_at(2), None);
        assert_eq!(log.term_at(3), Some(2));
        assert!(log.entry(3).unwrap().command.is_empty());
        assert_eq!(log.entries_from(4).len(), 2);

        // never backwards, never past the end
        assert!(!log.compact_to(2));
        assert!(!log.compact_to(3));
        assert!(!log.compact_to(9));
        assert_eq!(log.snapshot_index(), 3);
    }

    #[test]
    fn test_install_snapshot_keeps_matching_suffix() {
        let mut log = log_with_terms(&[1, 1, 2, 2]);
        log.install_snapshot(2, 1);
        assert_eq!(log.snapshot_index(), 2);
        assert_eq!(log.last_index(), 4);
    }

    #[test]
    fn test_install_snapshot_discards_conflicting_log() {
        let mut log = log_with_terms(&[1, 1, 2]);
        log.install_snapshot(2, 5);
        assert_eq!(log.snapshot_index(), 2);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 5);

        log.install_snapshot(10, 6);
        assert_eq!(log.snapshot_index(), 10);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.term_at(10), Some(6));
    }

    #[test]
    fn test_from_parts_requires_sentinel() {
        assert!(RaftLog::from_parts(4, Vec::new()).is_err());
        let log = RaftLog::from_parts(4, vec![LogEntry::sentinel(2), LogEntry::new(3, vec![9])])
            .unwrap();
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.snapshot_term(), 2);
    }
}
