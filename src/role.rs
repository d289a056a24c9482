//! The role state machine, flattened into one pure function.
//!
//! Every role-related piece of bookkeeping — who to vote for, which
//! tallies to reset, which follower indexes to initialize — is decided
//! here and nowhere else. Handlers feed every term-bearing message through
//! [`enumerate_state_change`] before inspecting their own role, then apply
//! the returned record mechanically.

use crate::error::{RaftError, Result};
use crate::log::Term;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Follower => "FOLLOWER",
            Role::Candidate => "CANDIDATE",
            Role::Leader => "LEADER",
        }
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Role> {
        match bytes {
            b"FOLLOWER" => Ok(Role::Follower),
            b"CANDIDATE" => Ok(Role::Candidate),
            b"LEADER" => Ok(Role::Leader),
            other => Err(RaftError::Malformed(format!(
                "unknown role {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// What a node just observed: a peer speaking in one of the three real
/// roles, or a local event. The local events are fed through the same
/// table so that the transition matrix stays rectangular and total.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    /// A peer message sent from the follower role (responses).
    Follower,
    /// A peer soliciting votes.
    Candidate,
    /// A peer asserting leadership (append requests, heartbeats).
    Leader,
    /// The election timer fired with no suppressing traffic.
    Timeout,
    /// A candidate counted a majority of granted votes.
    Elected,
    /// A leader went a full heartbeat cycle without a live follower.
    QuorumLoss,
}

/// Disposition of one volatile field across a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    /// Keep the current value.
    Leave,
    /// Clear to the role-less default (`None` / `false`).
    Reset,
    /// Install the entering role's fresh value.
    Init,
}

/// The full prescription for one observation: which role to move to, the
/// term to carry forward, and what to do with each volatile field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateChange {
    pub role_change: Option<(Role, Role)>,
    pub current_term: Term,
    pub next_index: Op,
    pub match_index: Op,
    pub voted_for: Op,
    pub current_votes: Op,
    pub has_followers: Op,
    pub commit_index: Op,
}

impl StateChange {
    /// No transition: everything stays, the term is carried through.
    fn leave(term: Term) -> StateChange {
        StateChange {
            role_change: None,
            current_term: term,
            next_index: Op::Leave,
            match_index: Op::Leave,
            voted_for: Op::Leave,
            current_votes: Op::Leave,
            has_followers: Op::Leave,
            commit_index: Op::Leave,
        }
    }

    /// Fall back to follower at `term`, dropping leader and candidate
    /// bookkeeping. `voted_for` is the caller's business: it survives a
    /// same-term demotion but not a term bump.
    fn to_follower(from: Option<Role>, term: Term, voted_for: Op) -> StateChange {
        StateChange {
            role_change: from.map(|role| (role, Role::Follower)),
            current_term: term,
            next_index: Op::Reset,
            match_index: Op::Reset,
            voted_for,
            current_votes: Op::Reset,
            has_followers: Op::Reset,
            commit_index: Op::Leave,
        }
    }
}

/// Decide what `(observation, observed_term)` does to a node currently in
/// `own_role` at `own_term`.
///
/// Peer observations are total: stale or same-term traffic that needs no
/// transition comes back as an all-`Leave` record and the outer handler
/// rejects or answers as the message kind requires. The local events are
/// only legal from the role that emits them; anything else is a
/// programming error.
pub fn enumerate_state_change(
    observation: Observation,
    observed_term: Term,
    own_role: Role,
    own_term: Term,
) -> Result<StateChange> {
    match observation {
        Observation::Timeout => match own_role {
            // The follower heard nothing for a full cycle: stand for
            // election. A candidate in the same position starts the next
            // round. Either way the term advances and the ballot box is
            // fresh, with a vote for ourselves already in it.
            Role::Follower | Role::Candidate => Ok(StateChange {
                role_change: if own_role == Role::Follower {
                    Some((Role::Follower, Role::Candidate))
                } else {
                    None
                },
                current_term: own_term + 1,
                next_index: Op::Reset,
                match_index: Op::Reset,
                voted_for: Op::Init,
                current_votes: Op::Init,
                has_followers: Op::Reset,
                commit_index: Op::Leave,
            }),
            Role::Leader => Err(unsupported(observation, own_role)),
        },

        Observation::Elected => match own_role {
            Role::Candidate => Ok(StateChange {
                role_change: Some((Role::Candidate, Role::Leader)),
                current_term: own_term,
                next_index: Op::Init,
                match_index: Op::Init,
                voted_for: Op::Leave,
                current_votes: Op::Reset,
                has_followers: Op::Init,
                commit_index: Op::Leave,
            }),
            _ => Err(unsupported(observation, own_role)),
        },

        Observation::QuorumLoss => match own_role {
            Role::Leader => Ok(StateChange::to_follower(
                Some(Role::Leader),
                own_term,
                Op::Leave,
            )),
            _ => Err(unsupported(observation, own_role)),
        },

        Observation::Follower | Observation::Candidate | Observation::Leader => {
            Ok(observe_peer(observation, observed_term, own_role, own_term))
        }
    }
}

fn observe_peer(
    observation: Observation,
    observed_term: Term,
    own_role: Role,
    own_term: Term,
) -> StateChange {
    if observed_term > own_term {
        // A newer term always wins: adopt it, fall back to follower and
        // free this term's vote.
        let from = if own_role == Role::Follower {
            None
        } else {
            Some(own_role)
        };
        return StateChange::to_follower(from, observed_term, Op::Reset);
    }

    if observed_term == own_term
        && observation == Observation::Leader
        && own_role == Role::Candidate
    {
        // A leader established itself in the term we are campaigning for;
        // our vote already went to ourselves and stays put.
        return StateChange::to_follower(Some(Role::Candidate), own_term, Op::Leave);
    }

    // Stale or same-term traffic with nothing to do. Two leaders observing
    // each other in one term would land here as well; that cannot arise
    // from a correct cluster and the outer handler answers it with its own
    // term like any other stale request.
    StateChange::leave(own_term)
}

fn unsupported(observation: Observation, role: Role) -> RaftError {
    RaftError::UnsupportedTransition(format!("{:?} while {:?}", observation, role))
}
