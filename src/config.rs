use std::path::Path;

use crate::error::{RaftError, Result};

/// An id that uniquely identifies one node of the cluster.
pub type NodeId = u32;

/// One row of the static cluster map.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeAddr {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(id: NodeId, host: impl Into<String>, port: u16) -> NodeAddr {
        NodeAddr {
            id,
            host: host.into(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Boot configuration for a node. The cluster map is fixed for the
/// lifetime of the process.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Our own id; must appear in `nodes`.
    pub id: NodeId,
    /// The full cluster, ourselves included.
    pub nodes: Vec<NodeAddr>,
    /// Leader cycle length. Followers and candidates time out after a
    /// value drawn from [election_timeout_millis, 2 * election_timeout_millis].
    pub heartbeat_millis: u64,
    pub election_timeout_millis: u64,
    /// Where the durable snapshot lives.
    pub state_file: String,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            id: 1,
            nodes: vec![NodeAddr::new(1, "127.0.0.1", 8781)],
            heartbeat_millis: 1_000,
            election_timeout_millis: 3_000,
            state_file: "caucus.state".to_string(),
        }
    }
}

impl RaftConfig {
    /// Load from a file with an environment-variable overlay
    /// (`CAUCUS_ID=2` overrides `id`, and so on). `id_override` wins over
    /// both, so one config file can serve every node of a cluster.
    pub fn load<P: AsRef<Path>>(path: P, id_override: Option<NodeId>) -> Result<RaftConfig> {
        let mut settings = config::Config::default();
        settings
            .merge(config::File::from(path.as_ref()))
            .map_err(|e| RaftError::Config(e.to_string()))?
            .merge(config::Environment::with_prefix("CAUCUS"))
            .map_err(|e| RaftError::Config(e.to_string()))?;

        let mut config: RaftConfig = settings
            .try_into()
            .map_err(|e| RaftError::Config(e.to_string()))?;
        if let Some(id) = id_override {
            config.id = id;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(RaftError::Config("cluster map is empty".to_string()));
        }
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|node| node.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.nodes.len() {
            return Err(RaftError::Config("duplicate node id".to_string()));
        }
        if !self.contains(self.id) {
            return Err(RaftError::Config(format!(
                "own id {} is not in the cluster map",
                self.id
            )));
        }
        if self.heartbeat_millis == 0 || self.election_timeout_millis == 0 {
            return Err(RaftError::Config("timeouts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.iter().any(|node| node.id == id)
    }

    pub fn member_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|node| node.id).collect()
    }

    /// Every member except `own`.
    pub fn peers(&self, own: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .map(|node| node.id)
            .filter(|id| *id != own)
            .collect()
    }

    pub fn majority(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    pub fn addr_of(&self, id: NodeId) -> Option<String> {
        self.nodes
            .iter()
            .find(|node| node.id == id)
            .map(NodeAddr::addr)
    }

    pub fn listen_addr(&self) -> Result<String> {
        self.addr_of(self.id)
            .ok_or_else(|| RaftError::Config(format!("own id {} has no address", self.id)))
    }
}
