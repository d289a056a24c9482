//! The per-node state machine and its single entry point,
//! [`RaftState::handle`]: one incoming message in, zero or more outgoing
//! messages out, state possibly mutated in between.
//!
//! Every term-bearing message is run through the role table first; only
//! then does the handler look at its own role. Durable fields are
//! persisted before any message that reflects them is returned.

use slog::Logger;

use crate::config::{NodeId, RaftConfig};
use crate::election::Election;
use crate::error::{RaftError, Result};
use crate::log::{Entry, Log, LogIndex, Term};
use crate::progress::ReplicationProgress;
use crate::role::{self, Observation, Op, Role, StateChange};
use crate::rpc::Message;
use crate::storage::{DurableState, Storage};

pub struct RaftState {
    id: NodeId,
    config: RaftConfig,
    logger: Logger,
    storage: Box<dyn Storage>,

    log: Log,
    current_term: Term,
    voted_for: Option<NodeId>,
    commit_index: LogIndex,
    role: Role,

    /// Leader-only bookkeeping; `None` in any other role.
    progress: Option<ReplicationProgress>,
    /// Candidate-only ballot box; `None` in any other role.
    election: Option<Election>,

    /// Gate on committing only entries of the current term (section 5.4.2
    /// of the Raft paper). Disabled only by the negative test that
    /// demonstrates the committed-entry loss the rule prevents.
    commit_term_check: bool,
}

impl RaftState {
    /// Build a node from its boot configuration, restoring durable fields
    /// from `storage` when a snapshot exists.
    pub fn new(config: RaftConfig, storage: Box<dyn Storage>, logger: Logger) -> Result<RaftState> {
        config.validate()?;

        let mut storage = storage;
        let (current_term, voted_for, log) = match storage.load()? {
            Some(snapshot) => (
                snapshot.current_term,
                snapshot.voted_for,
                Log::from_entries(snapshot.log),
            ),
            None => (-1, None, Log::new()),
        };
        info!(logger, "starting";
            "term" => current_term,
            "entries" => log.len(),
            "cluster" => config.nodes.len());

        Ok(RaftState {
            id: config.id,
            config,
            logger,
            storage,
            log,
            current_term,
            voted_for,
            commit_index: -1,
            role: Role::Follower,
            progress: None,
            election: None,
            commit_term_check: true,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    /// Leader-only view; `None` outside the leader role.
    pub fn next_index(&self, id: NodeId) -> Option<LogIndex> {
        self.progress.as_ref().map(|p| p.next_index(id))
    }

    pub fn match_index(&self, id: NodeId) -> Option<LogIndex> {
        self.progress.as_ref().and_then(|p| p.match_index(id))
    }

    /// Map one incoming message to the messages it provokes.
    pub fn handle(&mut self, message: Message) -> Result<Vec<Message>> {
        debug!(self.logger, "handling";
            "type" => message.message_type(),
            "source" => message.source());

        match message {
            Message::ClientLogAppend { item, .. } => self.handle_client_log_append(item),
            Message::AppendEntryRequest {
                source,
                current_term,
                previous_index,
                previous_term,
                entries,
                commit_index,
                ..
            } => self.handle_append_entries_request(
                source,
                current_term,
                previous_index,
                previous_term,
                entries,
                commit_index,
            ),
            Message::AppendEntryResponse {
                source,
                current_term,
                success,
                entries_length,
                ..
            } => self.handle_append_entries_response(source, current_term, success, entries_length),
            Message::RequestVoteRequest {
                source,
                current_term,
                last_log_index,
                last_log_term,
                ..
            } => self.handle_request_vote_request(source, current_term, last_log_index, last_log_term),
            Message::RequestVoteResponse {
                source,
                current_term,
                success,
                ..
            } => self.handle_request_vote_response(source, current_term, success),
            Message::UpdateFollowers { followers, .. } => self.handle_update_followers(followers),
            Message::RunElection { followers, .. } => self.handle_run_election(followers),
            Message::RoleChange {
                from_role, to_role, ..
            } => self.handle_role_change(from_role, to_role),
            Message::Text { source, text, .. } => {
                info!(self.logger, "text message"; "source" => source, "text" => text);
                Ok(Vec::new())
            }
        }
    }

    /// The message the election timer produces when it fires without
    /// suppressing traffic. Fed back through [`RaftState::handle`].
    pub fn on_timeout(&self) -> Message {
        match self.role {
            Role::Follower => Message::RoleChange {
                source: self.id,
                target: self.id,
                from_role: Role::Follower,
                to_role: Role::Candidate,
            },
            Role::Candidate => Message::RunElection {
                source: self.id,
                target: self.id,
                followers: self.config.peers(self.id),
            },
            Role::Leader => {
                let live = self
                    .progress
                    .as_ref()
                    .map(ReplicationProgress::has_followers)
                    .unwrap_or(false);
                if live {
                    Message::UpdateFollowers {
                        source: self.id,
                        target: self.id,
                        followers: self.config.peers(self.id),
                    }
                } else {
                    // No follower confirmed anything for a whole cycle:
                    // assume we are partitioned away and step down.
                    Message::RoleChange {
                        source: self.id,
                        target: self.id,
                        from_role: Role::Leader,
                        to_role: Role::Follower,
                    }
                }
            }
        }
    }

    /// Whether this message disables the role change of the current timer
    /// cycle: leader traffic parks a follower, ballots park a candidate.
    pub fn suppresses_timeout(&self, message: &Message) -> bool {
        matches!(
            (self.role, message),
            (Role::Follower, Message::AppendEntryRequest { .. })
                | (Role::Follower, Message::RequestVoteRequest { .. })
                | (Role::Candidate, Message::RequestVoteResponse { .. })
        )
    }

    fn handle_client_log_append(&mut self, item: Vec<u8>) -> Result<Vec<Message>> {
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader);
        }

        self.log.append(Entry::new(self.current_term, item));
        let last = self.log.last_index();
        if let Some(progress) = self.progress.as_mut() {
            progress.advance_own(self.id, last);
        }

        // The entry rides out with the next heartbeat.
        self.persist()?;
        Ok(Vec::new())
    }

    fn handle_append_entries_request(
        &mut self,
        source: NodeId,
        term: Term,
        previous_index: LogIndex,
        previous_term: Term,
        entries: Vec<Entry>,
        leader_commit: LogIndex,
    ) -> Result<Vec<Message>> {
        if !self.known_peer(source) {
            return Ok(Vec::new());
        }

        let dirty = self.observe(Observation::Leader, term)?;

        if self.role != Role::Follower || term < self.current_term {
            // Stale sender; our term in the reply lets it catch up.
            if dirty {
                self.persist()?;
            }
            return Ok(vec![self.append_response(source, false, entries.len())]);
        }

        let success = self
            .log
            .append_entries(previous_index, previous_term, &entries);
        if !success {
            debug!(self.logger, "rejected entries";
                "previous_index" => previous_index,
                "previous_term" => previous_term);
        }

        if leader_commit > self.commit_index {
            let bounded = leader_commit.min(self.log.last_index());
            if bounded > self.commit_index {
                self.commit_index = bounded;
            }
        }

        self.persist()?;
        Ok(vec![self.append_response(source, success, entries.len())])
    }

    fn handle_append_entries_response(
        &mut self,
        source: NodeId,
        term: Term,
        success: bool,
        entries_length: usize,
    ) -> Result<Vec<Message>> {
        if !self.known_peer(source) {
            return Ok(Vec::new());
        }

        let dirty = self.observe(Observation::Follower, term)?;
        if dirty {
            self.persist()?;
        }
        if self.role != Role::Leader || term < self.current_term {
            return Ok(Vec::new());
        }

        if success {
            let potential = match self.progress.as_mut() {
                Some(progress) => {
                    progress.record_success(source, entries_length);
                    progress.potential_commit_index(self.config.majority())
                }
                None => return Ok(Vec::new()),
            };

            if potential > self.commit_index {
                // A leader only commits by counting replicas of its own
                // term; older entries commit with it (section 5.4.2).
                if !self.commit_term_check || self.log.term_at(potential) == self.current_term {
                    debug!(self.logger, "commit advanced"; "commit_index" => potential);
                    self.commit_index = potential;
                }
            }
            Ok(Vec::new())
        } else {
            let next = match self.progress.as_mut() {
                Some(progress) => {
                    progress.record_failure(source);
                    progress.next_index(source)
                }
                None => return Ok(Vec::new()),
            };
            // Walk back one entry and retry immediately.
            Ok(vec![self.append_request(source, next)])
        }
    }

    fn handle_request_vote_request(
        &mut self,
        source: NodeId,
        term: Term,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> Result<Vec<Message>> {
        if !self.known_peer(source) {
            return Ok(Vec::new());
        }

        let dirty = self.observe(Observation::Candidate, term)?;

        if self.role != Role::Follower {
            if dirty {
                self.persist()?;
            }
            return Ok(vec![self.vote_response(source, false)]);
        }

        // The candidate's log must be at least as up to date as ours, and
        // this term's ballot must be open or already theirs.
        let up_to_date = last_log_term > self.log.last_term()
            || (last_log_term == self.log.last_term() && last_log_index >= self.log.last_index());
        let ballot_open = self.voted_for.is_none() || self.voted_for == Some(source);
        let granted = term >= self.current_term && up_to_date && ballot_open;

        if granted {
            info!(self.logger, "vote granted"; "candidate" => source, "term" => self.current_term);
            self.voted_for = Some(source);
        }

        if dirty || granted {
            self.persist()?;
        }
        Ok(vec![self.vote_response(source, granted)])
    }

    fn handle_request_vote_response(
        &mut self,
        source: NodeId,
        term: Term,
        success: bool,
    ) -> Result<Vec<Message>> {
        if !self.known_peer(source) {
            return Ok(Vec::new());
        }

        let dirty = self.observe(Observation::Follower, term)?;
        if dirty {
            self.persist()?;
        }
        if self.role != Role::Candidate || term < self.current_term {
            return Ok(Vec::new());
        }

        let won = match self.election.as_mut() {
            Some(election) => {
                election.record(source, success);
                election.won(self.config.majority())
            }
            None => false,
        };
        if !won {
            return Ok(Vec::new());
        }

        info!(self.logger, "won the election"; "term" => self.current_term);
        self.observe(Observation::Elected, self.current_term)?;
        Ok(self.heartbeat(self.config.peers(self.id)))
    }

    fn handle_update_followers(&mut self, followers: Vec<NodeId>) -> Result<Vec<Message>> {
        if self.role != Role::Leader {
            debug!(self.logger, "dropping heartbeat trigger"; "role" => self.role.as_str());
            return Ok(Vec::new());
        }
        Ok(self.heartbeat(followers))
    }

    fn handle_run_election(&mut self, followers: Vec<NodeId>) -> Result<Vec<Message>> {
        if self.role != Role::Candidate {
            debug!(self.logger, "dropping election trigger"; "role" => self.role.as_str());
            return Ok(Vec::new());
        }

        // The previous round went nowhere: a fresh term, a fresh ballot.
        self.observe(Observation::Timeout, self.current_term)?;
        self.persist()?;
        info!(self.logger, "soliciting votes again"; "term" => self.current_term);
        Ok(self.solicit_votes(followers))
    }

    fn handle_role_change(&mut self, from_role: Role, to_role: Role) -> Result<Vec<Message>> {
        match (from_role, to_role) {
            (Role::Follower, Role::Candidate) => {
                if self.role != Role::Follower {
                    // The timer raced with real traffic; nothing to do.
                    return Ok(Vec::new());
                }
                self.observe(Observation::Timeout, self.current_term)?;
                self.persist()?;
                info!(self.logger, "standing for election"; "term" => self.current_term);
                Ok(self.solicit_votes(self.config.peers(self.id)))
            }
            (Role::Leader, Role::Follower) => {
                if self.role != Role::Leader {
                    return Ok(Vec::new());
                }
                info!(self.logger, "lost quorum, stepping down"; "term" => self.current_term);
                self.observe(Observation::QuorumLoss, self.current_term)?;
                Ok(Vec::new())
            }
            (from, to) => Err(RaftError::UnsupportedTransition(format!(
                "{:?} -> {:?}",
                from, to
            ))),
        }
    }

    /// Run one observation through the role table and apply the outcome.
    /// Returns whether a durable field changed.
    fn observe(&mut self, observation: Observation, observed_term: Term) -> Result<bool> {
        let change =
            role::enumerate_state_change(observation, observed_term, self.role, self.current_term)?;
        Ok(self.apply_state_change(change))
    }

    /// The one place a [`StateChange`] touches the state. The table moves
    /// `match_index` and `has_followers` together with `next_index` (all
    /// three live in the progress record) and never resets `commit_index`.
    fn apply_state_change(&mut self, change: StateChange) -> bool {
        if let Some((from, to)) = change.role_change {
            info!(self.logger, "role change";
                "from" => from.as_str(),
                "to" => to.as_str(),
                "term" => change.current_term);
            self.role = to;
        }

        let mut dirty = change.current_term != self.current_term;
        self.current_term = change.current_term;

        match change.voted_for {
            Op::Leave => {}
            Op::Reset => {
                dirty |= self.voted_for.is_some();
                self.voted_for = None;
            }
            Op::Init => {
                dirty |= self.voted_for != Some(self.id);
                self.voted_for = Some(self.id);
            }
        }

        match change.current_votes {
            Op::Leave => {}
            Op::Reset => self.election = None,
            Op::Init => self.election = Some(Election::new(self.id)),
        }

        match change.next_index {
            Op::Leave => {}
            Op::Reset => self.progress = None,
            Op::Init => {
                self.progress = Some(ReplicationProgress::new(
                    &self.config.member_ids(),
                    self.id,
                    self.log.last_index(),
                ));
            }
        }

        dirty
    }

    fn persist(&mut self) -> Result<()> {
        let snapshot = DurableState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.entries().to_vec(),
        };
        self.storage.persist(&snapshot)
    }

    fn known_peer(&self, source: NodeId) -> bool {
        if self.config.contains(source) {
            return true;
        }
        warn!(self.logger, "message from unknown node"; "source" => source);
        false
    }

    /// Fan an append request out to `followers`, each from its own
    /// `next_index`, and open a fresh liveness cycle.
    fn heartbeat(&mut self, followers: Vec<NodeId>) -> Vec<Message> {
        if let Some(progress) = self.progress.as_mut() {
            progress.start_cycle();
        }

        followers
            .into_iter()
            .filter(|id| *id != self.id && self.config.contains(*id))
            .map(|id| {
                let next = self
                    .progress
                    .as_ref()
                    .map(|p| p.next_index(id))
                    .unwrap_or_else(|| self.log.len() as LogIndex);
                self.append_request(id, next)
            })
            .collect()
    }

    fn solicit_votes(&self, followers: Vec<NodeId>) -> Vec<Message> {
        followers
            .into_iter()
            .filter(|id| *id != self.id && self.config.contains(*id))
            .map(|id| Message::RequestVoteRequest {
                source: self.id,
                target: id,
                current_term: self.current_term,
                last_log_index: self.log.last_index(),
                last_log_term: self.log.last_term(),
            })
            .collect()
    }

    fn append_request(&self, follower: NodeId, next: LogIndex) -> Message {
        Message::AppendEntryRequest {
            source: self.id,
            target: follower,
            current_term: self.current_term,
            previous_index: next - 1,
            previous_term: self.log.term_at(next - 1),
            entries: self.log.tail(next),
            commit_index: self.commit_index,
        }
    }

    fn append_response(&self, target: NodeId, success: bool, entries_length: usize) -> Message {
        Message::AppendEntryResponse {
            source: self.id,
            target,
            current_term: self.current_term,
            success,
            entries_length,
        }
    }

    fn vote_response(&self, target: NodeId, success: bool) -> Message {
        Message::RequestVoteResponse {
            source: self.id,
            target,
            success,
            current_term: self.current_term,
        }
    }
}
