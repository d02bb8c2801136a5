use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a server in the replication group.
///
/// Stable across restarts; assigned by the embedder (typically persisted in
/// the working directory on first start).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub Uuid);

impl ServerId {
    /// The nil identity, used before a real identity has been assigned.
    pub const fn nil() -> Self {
        ServerId(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for ServerId {
    fn default() -> Self {
        ServerId::nil()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a client session, unique within one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl Default for ClientId {
    fn default() -> Self {
        ClientId(0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client:{}", self.0)
    }
}

/// Identifier of a transaction, unique within its origin server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub const UNDEFINED: TransactionId = TransactionId(u64::MAX);

    pub fn is_undefined(&self) -> bool {
        *self == Self::UNDEFINED
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        TransactionId::UNDEFINED
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undefined() {
            write!(f, "txn:-1")
        } else {
            write!(f, "txn:{}", self.0)
        }
    }
}

/// Totally-ordered sequence number assigned by the provider.
///
/// `-1` means undefined (no position).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Seqno(pub i64);

impl Seqno {
    pub const UNDEFINED: Seqno = Seqno(-1);

    pub fn is_undefined(&self) -> bool {
        self.0 < 0
    }
}

impl Default for Seqno {
    fn default() -> Self {
        Seqno::UNDEFINED
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global transaction id: position in the cluster-wide commit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gtid {
    /// Source of the write set.
    pub server_id: ServerId,
    /// Sequence number within the source's commit order.
    pub seqno: Seqno,
}

impl Gtid {
    pub const fn new(server_id: ServerId, seqno: Seqno) -> Self {
        Gtid { server_id, seqno }
    }

    /// GTID with nil source and undefined seqno.
    pub const fn undefined() -> Self {
        Gtid {
            server_id: ServerId::nil(),
            seqno: Seqno::UNDEFINED,
        }
    }

    pub fn is_undefined(&self) -> bool {
        self.seqno.is_undefined()
    }
}

impl Default for Gtid {
    fn default() -> Self {
        Gtid::undefined()
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server_id, self.seqno)
    }
}

/// One `(name, value)` pair from the provider's status enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusVariable {
    pub name: String,
    pub value: String,
}

impl StatusVariable {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        StatusVariable {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Certification key for total-order isolation and certification.
///
/// A key is an ordered list of parts, coarsest first (e.g. schema, table,
/// row). The provider treats keys as opaque byte strings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Key {
    pub parts: Vec<Vec<u8>>,
}

impl Key {
    pub fn new(parts: Vec<Vec<u8>>) -> Self {
        Key { parts }
    }
}

/// Flags carried by a replicated write set.
///
/// A complete transaction replicated as a single write set carries both
/// `start_transaction` and `commit`; streaming fragments carry them
/// separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WsFlags {
    /// First fragment of the transaction.
    pub start_transaction: bool,
    /// Final fragment; the transaction commits at this position.
    pub commit: bool,
    /// The transaction is rolled back at this position.
    pub rollback: bool,
}

impl WsFlags {
    /// A whole transaction in one write set.
    pub const fn complete() -> Self {
        WsFlags {
            start_transaction: true,
            commit: true,
            rollback: false,
        }
    }

    pub const fn fragment(start_transaction: bool) -> Self {
        WsFlags {
            start_transaction,
            commit: false,
            rollback: false,
        }
    }

    pub const fn commit_fragment() -> Self {
        WsFlags {
            start_transaction: false,
            commit: true,
            rollback: false,
        }
    }

    pub const fn rollback_fragment() -> Self {
        WsFlags {
            start_transaction: false,
            commit: false,
            rollback: true,
        }
    }
}

/// Provider-owned handle to a write set under certification or application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WsHandle {
    pub transaction_id: TransactionId,
    /// Opaque provider cookie; meaningful only to the provider.
    pub opaque: u64,
}

impl WsHandle {
    pub fn new(transaction_id: TransactionId) -> Self {
        WsHandle {
            transaction_id,
            opaque: 0,
        }
    }
}

/// Ordering metadata of a delivered write set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WsMeta {
    /// Position of the write set in the total order.
    pub gtid: Gtid,
    /// Origin server of the transaction.
    pub server_id: ServerId,
    /// Origin client session of the transaction.
    pub client_id: ClientId,
    /// Origin transaction id.
    pub transaction_id: TransactionId,
    pub flags: WsFlags,
}

impl WsMeta {
    pub fn new(
        gtid: Gtid,
        server_id: ServerId,
        client_id: ClientId,
        transaction_id: TransactionId,
        flags: WsFlags,
    ) -> Self {
        WsMeta {
            gtid,
            server_id,
            client_id,
            transaction_id,
            flags,
        }
    }

    /// True when the write set is one fragment of a streaming transaction
    /// rather than a complete transaction.
    pub fn is_streaming_fragment(&self) -> bool {
        !(self.flags.start_transaction && self.flags.commit) || self.flags.rollback
    }
}
