//! Immutable server configuration, consumed once at construction.

use serde::{Deserialize, Serialize};

use crate::types::{Gtid, ServerId};

/// How brute-force abort victims are rolled back.
///
/// Declared by the embedder at construction and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackMode {
    /// The victim is only marked; the conflict surfaces at the victim's next
    /// command hook.
    Async,
    /// The victim must be rolled back immediately by a background rollbacker
    /// so the applier is never blocked.
    Sync,
}

/// Identity and policy of one replication server.
///
/// All fields are fixed for the lifetime of the server state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Human-readable server name, used in logs and SST requests.
    pub name: String,
    /// Stable server identity within the group.
    pub id: ServerId,
    /// Address the DBMS accepts client connections on, advertised to the
    /// group.
    pub incoming_address: String,
    /// Group communication address.
    pub address: String,
    /// Directory for replication-specific data files.
    pub working_dir: String,
    /// Position to start from when no cluster state is available.
    pub initial_position: Gtid,
    /// Highest replication protocol version this server speaks.
    pub max_protocol_version: i32,
    pub rollback_mode: RollbackMode,
}
