//! Cluster membership views delivered by the provider.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{Gtid, Seqno, ServerId};

/// Quorum status of a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewStatus {
    /// The view has quorum; writes are allowed.
    Primary,
    /// Quorum lost; the group is partitioned.
    NonPrimary,
    /// Final view after leaving the group.
    Disconnected,
}

impl fmt::Display for ViewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewStatus::Primary => write!(f, "primary"),
            ViewStatus::NonPrimary => write!(f, "non-primary"),
            ViewStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// One member of a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: ServerId,
    pub name: String,
    pub incoming_address: String,
}

impl Member {
    pub fn new(id: ServerId, name: impl Into<String>, incoming_address: impl Into<String>) -> Self {
        Member {
            id,
            name: name.into(),
            incoming_address: incoming_address.into(),
        }
    }
}

/// Provider-delivered membership snapshot. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    /// Group position at which the view was formed.
    pub state_id: Gtid,
    /// Monotonically increasing view number.
    pub view_seqno: Seqno,
    pub status: ViewStatus,
    /// Index of the local server in `members`, if present.
    pub own_index: Option<usize>,
    /// Replication protocol version negotiated for this view.
    pub protocol_version: i32,
    pub members: Vec<Member>,
}

impl View {
    pub fn new(
        state_id: Gtid,
        view_seqno: Seqno,
        status: ViewStatus,
        own_index: Option<usize>,
        protocol_version: i32,
        members: Vec<Member>,
    ) -> Self {
        View {
            state_id,
            view_seqno,
            status,
            own_index,
            protocol_version,
            members,
        }
    }

    /// Empty view in `Disconnected` status, the state before the first
    /// provider connect and after the final view.
    pub fn disconnected() -> Self {
        View {
            state_id: Gtid::undefined(),
            view_seqno: Seqno::UNDEFINED,
            status: ViewStatus::Disconnected,
            own_index: None,
            protocol_version: 0,
            members: Vec::new(),
        }
    }

    pub fn is_member(&self, id: ServerId) -> bool {
        self.members.iter().any(|m| m.id == id)
    }

    /// Identity of the local server in this view, if present.
    pub fn own_id(&self) -> Option<ServerId> {
        self.own_index.map(|i| self.members[i].id)
    }

    /// True when this is a primary view with the local server present.
    pub fn is_own_primary(&self) -> bool {
        self.status == ViewStatus::Primary && self.own_index.is_some()
    }

    /// True for the final view delivered after leaving the group.
    pub fn is_final(&self) -> bool {
        self.status == ViewStatus::Disconnected
    }
}
