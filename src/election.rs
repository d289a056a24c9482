use std::collections::HashMap;

use crate::config::NodeId;

/// The ballot box a candidate keeps for one term. Records who each
/// answering peer voted for; a denial is an explicit `None`, so a repeated
/// answer from the same peer never counts twice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Election {
    candidate: NodeId,
    votes: HashMap<NodeId, Option<NodeId>>,
}

impl Election {
    /// A fresh ballot box with the candidate's own vote already in it.
    pub fn new(candidate: NodeId) -> Election {
        let mut votes = HashMap::new();
        votes.insert(candidate, Some(candidate));
        Election { candidate, votes }
    }

    pub fn record(&mut self, voter: NodeId, granted: bool) {
        let vote = if granted { Some(self.candidate) } else { None };
        self.votes.insert(voter, vote);
    }

    /// Votes cast for the candidate, self-vote included.
    pub fn tally(&self) -> usize {
        self.votes
            .values()
            .filter(|vote| **vote == Some(self.candidate))
            .count()
    }

    pub fn won(&self, majority: usize) -> bool {
        self.tally() >= majority
    }
}
