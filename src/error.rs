use thiserror::Error;

/// Errors that propagate out of the consensus core or the server shell.
///
/// Log inconsistency and stale terms are deliberately absent: both are
/// answered with a `success = false` response on the wire and never surface
/// as Rust errors.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The bytes are not a legal encoding. The offending message is dropped.
    #[error("malformed wire data: {0}")]
    Malformed(String),

    /// A client submitted a log append to a node that is not the leader.
    #[error("not the leader")]
    NotLeader,

    /// A role transition was requested that the transition table does not
    /// permit. This is a programming error, not a protocol condition.
    #[error("unsupported role transition: {0}")]
    UnsupportedTransition(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RaftError>;
