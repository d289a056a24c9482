use std::collections::HashMap;

use crate::config::NodeId;
use crate::log::LogIndex;

/// The leader's per-follower bookkeeping.
///
/// `next_index[p]` is the optimistic guess of where `p`'s log ends and is
/// where the next batch starts; `match_index[p]` is the conservatively
/// confirmed replication point, `None` until `p` first answers. The two
/// never cross: `match_index[p] < next_index[p]` whenever both are known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationProgress {
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, Option<LogIndex>>,
    has_followers: bool,
}

impl ReplicationProgress {
    /// Fresh bookkeeping for a newly elected leader: everyone is assumed
    /// to be at the end of our log, nothing is confirmed except our own
    /// last entry.
    pub fn new(members: &[NodeId], own: NodeId, last_index: LogIndex) -> ReplicationProgress {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for id in members {
            next_index.insert(*id, last_index + 1);
            match_index.insert(*id, None);
        }
        if last_index >= 0 {
            match_index.insert(own, Some(last_index));
        }
        ReplicationProgress {
            next_index,
            match_index,
            has_followers: false,
        }
    }

    pub fn next_index(&self, id: NodeId) -> LogIndex {
        self.next_index.get(&id).copied().unwrap_or(0)
    }

    pub fn match_index(&self, id: NodeId) -> Option<LogIndex> {
        self.match_index.get(&id).copied().flatten()
    }

    /// True when any follower confirmed replication since the last cycle.
    pub fn has_followers(&self) -> bool {
        self.has_followers
    }

    /// A heartbeat fan-out begins a new liveness cycle.
    pub fn start_cycle(&mut self) {
        self.has_followers = false;
    }

    /// A follower confirmed `entries_length` entries sent from its
    /// previous `next_index`. Out-of-order confirmations may arrive from
    /// distinct followers; the `max` keeps the confirmed point monotone.
    pub fn record_success(&mut self, id: NodeId, entries_length: usize) {
        if let Some(next) = self.next_index.get_mut(&id) {
            *next += entries_length as LogIndex;
            let confirmed = *next - 1;
            if confirmed >= 0 {
                let slot = self.match_index.entry(id).or_insert(None);
                if slot.map_or(true, |old| old < confirmed) {
                    *slot = Some(confirmed);
                }
            }
            self.has_followers = true;
        }
    }

    /// A follower rejected the graft point; walk one entry back. The floor
    /// is zero: a retry from there offers the whole log.
    pub fn record_failure(&mut self, id: NodeId) {
        if let Some(next) = self.next_index.get_mut(&id) {
            if *next > 0 {
                *next -= 1;
            }
        }
    }

    /// The leader appended to its own log.
    pub fn advance_own(&mut self, own: NodeId, last_index: LogIndex) {
        self.next_index.insert(own, last_index + 1);
        if last_index >= 0 {
            self.match_index.insert(own, Some(last_index));
        }
    }

    /// The highest index stored on a majority: sort the confirmed points
    /// ascending with the unknowns below them all and read off the entry
    /// at the majority position. `-1` when no index qualifies yet.
    pub fn potential_commit_index(&self, majority: usize) -> LogIndex {
        let mut matched: Vec<LogIndex> = self.match_index.values().filter_map(|m| *m).collect();
        matched.sort_unstable();

        let nulls = self.match_index.len() - matched.len();
        let position = majority as i64 - 1 - nulls as i64;
        if position < 0 || position as usize >= matched.len() {
            return -1;
        }
        matched[position as usize]
    }
}
