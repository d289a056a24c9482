//! Typed messages and their wire form.
//!
//! Every message travels as a single codec dictionary carrying a
//! `message_type` discriminator plus `source` and `target` node ids.
//! Adding a message kind means touching exactly two places: the variant
//! here and the arm in [`crate::state::RaftState::handle`] — the compiler
//! flags every other match that needs to learn about it.

use std::collections::BTreeMap;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{self, Value};
use crate::config::NodeId;
use crate::error::{RaftError, Result};
use crate::log::{Entry, LogIndex, Term};
use crate::role::Role;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// A client hands a command to the node it believes is the leader.
    ClientLogAppend {
        source: NodeId,
        target: NodeId,
        item: Vec<u8>,
    },
    /// Leader to follower: graft `entries` after `previous_index`. With no
    /// entries this is the heartbeat.
    AppendEntryRequest {
        source: NodeId,
        target: NodeId,
        current_term: Term,
        previous_index: LogIndex,
        previous_term: Term,
        entries: Vec<Entry>,
        commit_index: LogIndex,
    },
    /// Follower to leader: the outcome of one graft attempt.
    AppendEntryResponse {
        source: NodeId,
        target: NodeId,
        current_term: Term,
        success: bool,
        entries_length: usize,
    },
    /// Candidate to peer: a vote solicitation.
    RequestVoteRequest {
        source: NodeId,
        target: NodeId,
        current_term: Term,
        last_log_index: LogIndex,
        last_log_term: Term,
    },
    /// Peer to candidate: the ballot.
    RequestVoteResponse {
        source: NodeId,
        target: NodeId,
        success: bool,
        current_term: Term,
    },
    /// Internal: the leader's timer asks for a heartbeat fan-out.
    UpdateFollowers {
        source: NodeId,
        target: NodeId,
        followers: Vec<NodeId>,
    },
    /// Internal: the candidate's timer asks for another round of votes.
    RunElection {
        source: NodeId,
        target: NodeId,
        followers: Vec<NodeId>,
    },
    /// Internal: a timer-driven transition between two roles.
    RoleChange {
        source: NodeId,
        target: NodeId,
        from_role: Role,
        to_role: Role,
    },
    /// Free-form diagnostic text; logged and otherwise ignored.
    Text {
        source: NodeId,
        target: NodeId,
        text: String,
    },
}

impl Message {
    pub fn source(&self) -> NodeId {
        match self {
            Message::ClientLogAppend { source, .. }
            | Message::AppendEntryRequest { source, .. }
            | Message::AppendEntryResponse { source, .. }
            | Message::RequestVoteRequest { source, .. }
            | Message::RequestVoteResponse { source, .. }
            | Message::UpdateFollowers { source, .. }
            | Message::RunElection { source, .. }
            | Message::RoleChange { source, .. }
            | Message::Text { source, .. } => *source,
        }
    }

    pub fn target(&self) -> NodeId {
        match self {
            Message::ClientLogAppend { target, .. }
            | Message::AppendEntryRequest { target, .. }
            | Message::AppendEntryResponse { target, .. }
            | Message::RequestVoteRequest { target, .. }
            | Message::RequestVoteResponse { target, .. }
            | Message::UpdateFollowers { target, .. }
            | Message::RunElection { target, .. }
            | Message::RoleChange { target, .. }
            | Message::Text { target, .. } => *target,
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            Message::ClientLogAppend { .. } => "CLIENT_LOG_APPEND",
            Message::AppendEntryRequest { .. } => "APPEND_REQUEST",
            Message::AppendEntryResponse { .. } => "APPEND_RESPONSE",
            Message::RequestVoteRequest { .. } => "REQUEST_VOTE_REQUEST",
            Message::RequestVoteResponse { .. } => "REQUEST_VOTE_RESPONSE",
            Message::UpdateFollowers { .. } => "UPDATE_FOLLOWERS",
            Message::RunElection { .. } => "RUN_ELECTION",
            Message::RoleChange { .. } => "ROLE_CHANGE",
            Message::Text { .. } => "TEXT",
        }
    }
}

pub fn encode_message(message: &Message) -> Bytes {
    codec::encode(&to_value(message))
}

pub fn decode_message(buf: &[u8]) -> Result<Message> {
    from_value(codec::decode(buf)?)
}

fn to_value(message: &Message) -> Value {
    let mut dict = Dict::new(message.message_type(), message.source(), message.target());

    match message {
        Message::ClientLogAppend { item, .. } => {
            dict.put("item", Value::Str(item.clone()));
        }
        Message::AppendEntryRequest {
            current_term,
            previous_index,
            previous_term,
            entries,
            commit_index,
            ..
        } => {
            dict.put("commit_index", Value::Int(*commit_index));
            dict.put("current_term", Value::Int(*current_term));
            dict.put(
                "entries",
                Value::List(entries.iter().map(Entry::to_value).collect()),
            );
            dict.put("previous_index", Value::Int(*previous_index));
            dict.put("previous_term", Value::Int(*previous_term));
        }
        Message::AppendEntryResponse {
            current_term,
            success,
            entries_length,
            ..
        } => {
            dict.put("current_term", Value::Int(*current_term));
            dict.put("entries_length", Value::Int(*entries_length as i64));
            dict.put("success", Value::Int(*success as i64));
        }
        Message::RequestVoteRequest {
            current_term,
            last_log_index,
            last_log_term,
            ..
        } => {
            dict.put("current_term", Value::Int(*current_term));
            dict.put("last_log_index", Value::Int(*last_log_index));
            dict.put("last_log_term", Value::Int(*last_log_term));
        }
        Message::RequestVoteResponse {
            success,
            current_term,
            ..
        } => {
            dict.put("current_term", Value::Int(*current_term));
            dict.put("success", Value::Int(*success as i64));
        }
        Message::UpdateFollowers { followers, .. } | Message::RunElection { followers, .. } => {
            dict.put(
                "followers",
                Value::List(followers.iter().map(|id| Value::Int(*id as i64)).collect()),
            );
        }
        Message::RoleChange {
            from_role, to_role, ..
        } => {
            dict.put("from_role", Value::str(from_role.as_str()));
            dict.put("to_role", Value::str(to_role.as_str()));
        }
        Message::Text { text, .. } => {
            dict.put("text", Value::str(text));
        }
    }

    dict.into_value()
}

fn from_value(value: Value) -> Result<Message> {
    let mut dict = Fields(value.into_dict()?);

    let message_type = dict.take_str("message_type")?;
    let source = dict.take_node_id("source")?;
    let target = dict.take_node_id("target")?;

    let message = match &message_type[..] {
        b"CLIENT_LOG_APPEND" => Message::ClientLogAppend {
            source,
            target,
            item: dict.take_str("item")?,
        },
        b"APPEND_REQUEST" => {
            let entries = dict
                .take("entries")?
                .into_list()?
                .into_iter()
                .map(Entry::from_value)
                .collect::<Result<Vec<Entry>>>()?;
            Message::AppendEntryRequest {
                source,
                target,
                commit_index: dict.take_int("commit_index")?,
                current_term: dict.take_int("current_term")?,
                entries,
                previous_index: dict.take_int("previous_index")?,
                previous_term: dict.take_int("previous_term")?,
            }
        }
        b"APPEND_RESPONSE" => Message::AppendEntryResponse {
            source,
            target,
            current_term: dict.take_int("current_term")?,
            entries_length: dict.take_len("entries_length")?,
            success: dict.take_bool("success")?,
        },
        b"REQUEST_VOTE_REQUEST" => Message::RequestVoteRequest {
            source,
            target,
            current_term: dict.take_int("current_term")?,
            last_log_index: dict.take_int("last_log_index")?,
            last_log_term: dict.take_int("last_log_term")?,
        },
        b"REQUEST_VOTE_RESPONSE" => Message::RequestVoteResponse {
            source,
            target,
            current_term: dict.take_int("current_term")?,
            success: dict.take_bool("success")?,
        },
        b"UPDATE_FOLLOWERS" => Message::UpdateFollowers {
            source,
            target,
            followers: dict.take_node_ids("followers")?,
        },
        b"RUN_ELECTION" => Message::RunElection {
            source,
            target,
            followers: dict.take_node_ids("followers")?,
        },
        b"ROLE_CHANGE" => Message::RoleChange {
            source,
            target,
            from_role: Role::from_wire(&dict.take_str("from_role")?)?,
            to_role: Role::from_wire(&dict.take_str("to_role")?)?,
        },
        b"TEXT" => Message::Text {
            source,
            target,
            text: dict.take_text("text")?,
        },
        other => {
            return Err(RaftError::Malformed(format!(
                "unknown message type {:?}",
                String::from_utf8_lossy(other)
            )))
        }
    };

    dict.finish()?;
    Ok(message)
}

/// Builder for the outgoing dictionary.
struct Dict(BTreeMap<Vec<u8>, Value>);

impl Dict {
    fn new(message_type: &str, source: NodeId, target: NodeId) -> Dict {
        let mut dict = Dict(BTreeMap::new());
        dict.put("message_type", Value::str(message_type));
        dict.put("source", Value::Int(source as i64));
        dict.put("target", Value::Int(target as i64));
        dict
    }

    fn put(&mut self, key: &str, value: Value) {
        self.0.insert(key.as_bytes().to_vec(), value);
    }

    fn into_value(self) -> Value {
        Value::Dict(self.0)
    }
}

/// Field extraction for the incoming dictionary; every field is consumed
/// exactly once and leftovers are rejected.
struct Fields(BTreeMap<Vec<u8>, Value>);

impl Fields {
    fn take(&mut self, key: &str) -> Result<Value> {
        self.0
            .remove(key.as_bytes())
            .ok_or_else(|| RaftError::Malformed(format!("missing field {}", key)))
    }

    fn take_int(&mut self, key: &str) -> Result<i64> {
        self.take(key)?.into_int()
    }

    fn take_str(&mut self, key: &str) -> Result<Vec<u8>> {
        self.take(key)?.into_str()
    }

    fn take_text(&mut self, key: &str) -> Result<String> {
        String::from_utf8(self.take_str(key)?)
            .map_err(|_| RaftError::Malformed(format!("field {} is not utf-8", key)))
    }

    fn take_bool(&mut self, key: &str) -> Result<bool> {
        match self.take_int(key)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(RaftError::Malformed(format!(
                "field {} is not a boolean: {}",
                key, other
            ))),
        }
    }

    fn take_len(&mut self, key: &str) -> Result<usize> {
        let n = self.take_int(key)?;
        if n < 0 {
            return Err(RaftError::Malformed(format!(
                "field {} is negative: {}",
                key, n
            )));
        }
        Ok(n as usize)
    }

    fn take_node_id(&mut self, key: &str) -> Result<NodeId> {
        let n = self.take_int(key)?;
        if n < 0 || n > NodeId::MAX as i64 {
            return Err(RaftError::Malformed(format!(
                "field {} is not a node id: {}",
                key, n
            )));
        }
        Ok(n as NodeId)
    }

    fn take_node_ids(&mut self, key: &str) -> Result<Vec<NodeId>> {
        self.take(key)?
            .into_list()?
            .into_iter()
            .map(|value| {
                let n = value.into_int()?;
                if n < 0 || n > NodeId::MAX as i64 {
                    return Err(RaftError::Malformed(format!("bad node id: {}", n)));
                }
                Ok(n as NodeId)
            })
            .collect()
    }

    fn finish(self) -> Result<()> {
        if let Some(key) = self.0.keys().next() {
            return Err(RaftError::Malformed(format!(
                "unexpected field {}",
                String::from_utf8_lossy(key)
            )));
        }
        Ok(())
    }
}

/// Frames [`Message`]s over a byte stream. The encoding is
/// self-delimiting, so decoding is just: parse one value off the front if
/// a whole one has arrived.
pub struct WireCodec;

impl Decoder for WireCodec {
    type Item = Message;
    type Error = RaftError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        match codec::decode_prefix(&src[..])? {
            None => Ok(None),
            Some((value, read)) => {
                src.advance(read);
                Ok(Some(from_value(value)?))
            }
        }
    }
}

impl Encoder<Message> for WireCodec {
    type Error = RaftError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&encode_message(&message));
        Ok(())
    }
}
