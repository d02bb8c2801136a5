//! Replication coordination core.
//!
//! This crate mediates between a DBMS and a pluggable group-communication
//! provider that delivers totally-ordered write sets:
//!
//! - [`server_state::ServerState`] tracks the node's membership lifecycle
//!   (disconnected → joiner → synced → ...), orchestrates state snapshot
//!   transfers, and dispatches delivered write sets.
//! - [`client_state::ClientState`] drives each DBMS session through its
//!   idle/executing/result phases while reconciling with high-priority
//!   appliers that may brute-force abort local transactions.
//! - The streaming registries route fragments of in-flight streaming
//!   transactions to the applier standing in for them.
//!
//! The core performs no network I/O and executes no SQL; the provider and the
//! embedder own those concerns and are reached through the traits in
//! [`provider`] and [`service`].

pub mod client_state;
pub mod provider;
pub mod server_state;
pub mod service;
pub mod streaming;
pub mod transaction;

pub use client_state::{AfterStatementResult, ClientMode, ClientState, ClientStatus};
pub use provider::Provider;
pub use server_state::{ServerState, ServerStatus};
pub use service::{ClientService, HighPriorityService, ServerService, SharedApplier};
pub use transaction::{FragmentUnit, StreamingContext, Transaction, TxnState};

pub use grex_common::{
    ClientError, ClientId, Error, Gtid, Key, Member, ProviderStatus, RollbackMode, Seqno,
    ServerConfig, ServerId, StatusVariable, TransactionId, View, ViewStatus, WsFlags, WsHandle,
    WsMeta,
};
