//! Shared value types for the grex replication coordination library.
//!
//! Everything in this crate is a plain value: identifiers, global transaction
//! ids, membership views, status enumerations, and the immutable server
//! configuration. The coordination machinery lives in `grex_core`.

pub mod config;
pub mod error;
pub mod types;
pub mod view;

pub use config::{RollbackMode, ServerConfig};
pub use error::{ClientError, Error, ProviderStatus};
pub use types::{
    ClientId, Gtid, Key, Seqno, ServerId, StatusVariable, TransactionId, WsFlags, WsHandle, WsMeta,
};
pub use view::{Member, View, ViewStatus};
