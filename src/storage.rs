//! Durable state and where it goes.
//!
//! Raft requires `current_term`, `voted_for` and the log to reach stable
//! storage before any message that reflects them leaves the node. The
//! snapshot is one value in the same encoding the wire uses:
//!
//! ```text
//! d 12:current_term <int> 3:log <list of entries> 9:voted_for <int|-1> e
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use crate::codec::{self, Value};
use crate::config::NodeId;
use crate::error::{RaftError, Result};
use crate::log::{Entry, Term};

/// The fields that must survive a crash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DurableState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: Vec<Entry>,
}

impl DurableState {
    fn to_value(&self) -> Value {
        let voted_for = match self.voted_for {
            Some(id) => id as i64,
            None => -1,
        };
        let mut pairs = BTreeMap::new();
        pairs.insert(b"current_term".to_vec(), Value::Int(self.current_term));
        pairs.insert(
            b"log".to_vec(),
            Value::List(self.log.iter().map(Entry::to_value).collect()),
        );
        pairs.insert(b"voted_for".to_vec(), Value::Int(voted_for));
        Value::Dict(pairs)
    }

    fn from_value(value: Value) -> Result<DurableState> {
        let mut pairs = value.into_dict()?;
        let mut take = |key: &str| {
            pairs
                .remove(key.as_bytes())
                .ok_or_else(|| RaftError::Malformed(format!("snapshot missing {}", key)))
        };

        let current_term = take("current_term")?.into_int()?;
        let log = take("log")?
            .into_list()?
            .into_iter()
            .map(Entry::from_value)
            .collect::<Result<Vec<Entry>>>()?;
        let voted_for = match take("voted_for")?.into_int()? {
            -1 => None,
            id if id >= 0 && id <= NodeId::MAX as i64 => Some(id as NodeId),
            other => {
                return Err(RaftError::Malformed(format!(
                    "snapshot voted_for is not a node id: {}",
                    other
                )))
            }
        };

        Ok(DurableState {
            current_term,
            voted_for,
            log,
        })
    }
}

/// Synchronous stable storage. `persist` must not return until the
/// snapshot would survive a crash.
pub trait Storage: Send {
    fn persist(&mut self, state: &DurableState) -> Result<()>;
    fn load(&mut self) -> Result<Option<DurableState>>;
}

/// Keeps the snapshot in memory. For tests and throwaway clusters.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    persisted: Option<DurableState>,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage { persisted: None }
    }
}

impl Storage for MemoryStorage {
    fn persist(&mut self, state: &DurableState) -> Result<()> {
        self.persisted = Some(state.clone());
        Ok(())
    }

    fn load(&mut self) -> Result<Option<DurableState>> {
        Ok(self.persisted.clone())
    }
}

/// Writes the snapshot to a file, atomically: write to a sibling, fsync,
/// rename over the target.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> FileStorage {
        FileStorage { path: path.into() }
    }
}

impl Storage for FileStorage {
    fn persist(&mut self, state: &DurableState) -> Result<()> {
        let bytes = codec::encode(&state.to_value());
        let staging = self.path.with_extension("tmp");

        let mut file = fs::File::create(&staging)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }

    fn load(&mut self) -> Result<Option<DurableState>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        DurableState::from_value(codec::decode(&bytes)?).map(Some)
    }
}
