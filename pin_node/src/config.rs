use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinNodeConfig {
    pub identity: NodeConfigIdentity,
    pub cluster: NodeConfigCluster,
    #[serde(default)]
    pub ledger: NodeConfigLedger,
    #[serde(default)]
    pub block_store: NodeConfigBlockStore,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfigIdentity {
    /// Path to a file holding the 32-byte secret key (raw, hex or base64url).
    /// Relative paths resolve against the config file's directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_file: Option<String>,
    /// Inline secret key as hex or base64url. Preferred over the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfigCluster {
    pub secret: String,
    /// Address the allocator listener binds to. Without it the node never
    /// accepts connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_addr: Option<String>,
    /// Discovery address announced to other nodes. Only nodes that announce
    /// one take part in the allocator rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise: Option<String>,
    /// Bootstrap allocator to dial.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum NodeConfigLedger {
    Redb {
        path: PathBuf,
    },
    #[default]
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfigBlockStore {
    /// Kubo RPC endpoint, e.g. `http://127.0.0.1:5001`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Directory whose filesystem is measured for capacity reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}
