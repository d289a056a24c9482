//! The replicated log and its single mutation primitive.
//!
//! `append_entries` is the follower's point of truth for forcing its log to
//! match the leader's (section 5.3 of the Raft paper) and the only
//! operation that ever shortens a log:
//!
//! - duplicate delivery leaves the log bit-identical;
//! - the log never has gaps;
//! - the entry before the graft point must carry the term the sender saw
//!   (the log-continuity condition);
//! - an existing entry whose term conflicts with an offered one is deleted
//!   together with everything after it.

use crate::codec::Value;
use crate::error::{RaftError, Result};

/// Election epoch. `-1` is the pre-boot sentinel; real terms start at 0.
pub type Term = i64;

/// Position in the log. `-1` denotes "before the log begins": the legal
/// graft point for seeding an empty log, and the commit index of a node
/// that has committed nothing.
pub type LogIndex = i64;

/// A single `(term, command)` pair. Immutable once committed; before that
/// it may be overwritten by conflict resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub term: Term,
    pub item: Vec<u8>,
}

impl Entry {
    pub fn new(term: Term, item: impl Into<Vec<u8>>) -> Entry {
        Entry {
            term,
            item: item.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut pairs = std::collections::BTreeMap::new();
        pairs.insert(b"item".to_vec(), Value::Str(self.item.clone()));
        pairs.insert(b"term".to_vec(), Value::Int(self.term));
        Value::Dict(pairs)
    }

    pub fn from_value(value: Value) -> Result<Entry> {
        let mut pairs = value.into_dict()?;
        let item = pairs
            .remove(&b"item"[..])
            .ok_or_else(|| RaftError::Malformed("entry missing item".to_string()))?
            .into_str()?;
        let term = pairs
            .remove(&b"term"[..])
            .ok_or_else(|| RaftError::Malformed("entry missing term".to_string()))?
            .into_int()?;
        Ok(Entry { term, item })
    }
}

/// Ordered, dense sequence of entries with monotone non-decreasing terms.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Log {
    entries: Vec<Entry>,
}

impl Log {
    pub fn new() -> Log {
        Log {
            entries: Vec::new(),
        }
    }

    pub fn from_entries(entries: Vec<Entry>) -> Log {
        Log { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Index of the last entry, `-1` when empty.
    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex - 1
    }

    /// Term of the last entry, `-1` when empty.
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|entry| entry.term).unwrap_or(-1)
    }

    pub fn get(&self, index: LogIndex) -> Option<&Entry> {
        if index < 0 {
            return None;
        }
        self.entries.get(index as usize)
    }

    /// Term of the entry at `index`, `-1` when out of range. The sentinel
    /// feeds straight into the wire's `previous_term` field.
    pub fn term_at(&self, index: LogIndex) -> Term {
        self.get(index).map(|entry| entry.term).unwrap_or(-1)
    }

    /// The tail starting at `index`, cloned for shipping to a follower.
    /// Empty when `index` is past the end — the heartbeat form.
    pub fn tail(&self, index: LogIndex) -> Vec<Entry> {
        if index < 0 || index as usize >= self.entries.len() {
            return Vec::new();
        }
        self.entries[index as usize..].to_vec()
    }

    /// Leader-side append of a fresh entry. Never truncates.
    pub fn append(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    /// Graft `entries` after `previous_index`, resolving conflicts in favor
    /// of the sender. Returns false when the graft point is missing or its
    /// term does not match; the sender retries with a smaller
    /// `previous_index` until continuity holds.
    pub fn append_entries(
        &mut self,
        previous_index: LogIndex,
        previous_term: Term,
        entries: &[Entry],
    ) -> bool {
        // A graft point past the end would leave a gap.
        if previous_index >= self.entries.len() as LogIndex {
            return false;
        }

        // The entry at the graft point must carry the term the sender saw.
        // `previous_index = -1` rewrites from the very beginning and has no
        // continuity to check.
        if previous_index >= 0 && self.entries[previous_index as usize].term != previous_term {
            return false;
        }

        // A term mismatch inside the overlap invalidates that entry and all
        // that follow it; there can be only one leader per term, so the
        // offered entry is the truth.
        for (i, entry) in entries.iter().enumerate() {
            let n = (previous_index + 1) as usize + i;
            if n < self.entries.len() && self.entries[n].term != entry.term {
                self.entries.truncate(n);
                break;
            }
        }

        // Keep the prefix already present, append the remainder. Duplicate
        // delivery ends here with nothing to add.
        let present = self.entries.len() - (previous_index + 1) as usize;
        if present < entries.len() {
            self.entries.extend_from_slice(&entries[present..]);
        }

        true
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{entries_of_terms, log_by_identifier, paper_log};
    use super::*;

    #[test]
    fn seeds_an_empty_log_from_before_the_beginning() {
        let mut log = Log::new();
        let entries = entries_of_terms(&[1, 1, 2]);

        assert!(log.append_entries(-1, -1, &entries));
        assert_eq!(log.entries(), &entries[..]);
    }

    #[test]
    fn rejects_a_graft_point_past_the_end() {
        let mut log = log_by_identifier('a');
        let before = log.clone();

        assert!(!log.append_entries(9, 6, &entries_of_terms(&[6])));
        assert_eq!(log, before);
    }

    #[test]
    fn rejects_a_graft_point_with_the_wrong_term() {
        let mut log = log_by_identifier('f');
        let before = log.clone();

        assert!(!log.append_entries(9, 6, &entries_of_terms(&[6])));
        assert_eq!(log, before);
    }

    #[test]
    fn grafts_at_the_first_continuous_point() {
        let mut log = log_by_identifier('a');

        assert!(log.append_entries(8, 6, &entries_of_terms(&[6])));
        assert_eq!(log, paper_log());
    }

    #[test]
    fn empty_entries_are_a_no_op_heartbeat() {
        let mut log = paper_log();
        let before = log.clone();

        assert!(log.append_entries(9, 6, &[]));
        assert_eq!(log, before);

        assert!(log.append_entries(4, 4, &[]));
        assert_eq!(log, before);
    }

    #[test]
    fn truncates_a_divergent_suffix() {
        // Figure 7f: the follower kept eight entries from terms that never
        // won an election. They go, wholesale, at the first conflict.
        let mut log = log_by_identifier('f');
        let offered = paper_log().tail(3);

        assert!(log.append_entries(2, 1, &offered));
        assert_eq!(log, paper_log());
    }

    #[test]
    fn reapplying_a_request_is_idempotent() {
        let mut log = log_by_identifier('b');
        let offered = paper_log().tail(4);

        assert!(log.append_entries(3, 4, &offered));
        let after_first = log.clone();

        assert!(log.append_entries(3, 4, &offered));
        assert_eq!(log, after_first);
        assert_eq!(log, paper_log());
    }

    #[test]
    fn overlapping_graft_keeps_the_common_prefix() {
        let mut log = log_by_identifier('e');

        // Offer entries 2..10 of the leader's log: index 3 conflicts
        // (term 4 vs 4 matches, index 5 conflicts term 4 vs 5).
        let offered = paper_log().tail(2);
        assert!(log.append_entries(1, 1, &offered));
        assert_eq!(log, paper_log());
    }

    #[test]
    fn sentinels_on_an_empty_log() {
        let log = Log::new();
        assert_eq!(log.last_index(), -1);
        assert_eq!(log.last_term(), -1);
        assert_eq!(log.term_at(-1), -1);
        assert_eq!(log.term_at(0), -1);
        assert!(log.tail(0).is_empty());
    }

    #[test]
    fn entry_survives_the_value_round_trip() {
        let entry = Entry::new(6, "6");
        assert_eq!(Entry::from_value(entry.to_value()).unwrap(), entry);
    }
}
