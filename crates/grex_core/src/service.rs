//! Embedder-implemented service traits.
//!
//! The DBMS supplies these at construction time. The core calls out through
//! them; it never calls back into its own public API from within a callback,
//! and callbacks must not re-enter the core while it holds a lock (each
//! callback documents its locking context).

use std::sync::Arc;

use parking_lot::Mutex;

use grex_common::{ClientError, Gtid, ProviderStatus, View, WsHandle, WsMeta};

use crate::client_state::ClientState;
use crate::server_state::ServerStatus;

/// Shared handle to a high-priority applier registered in the streaming
/// registry. The registry is a lookup index; the embedder owns the applier's
/// lifetime.
pub type SharedApplier = Arc<Mutex<dyn HighPriorityService + Send>>;

/// Server-wide callbacks.
pub trait ServerService: Send + Sync {
    /// Whether the state snapshot must be installed before storage-engine
    /// initialization (physical transfers) or after (logical dumps).
    /// Queried once; the answer selects the lifecycle path.
    fn sst_before_init(&self) -> bool;

    /// Produce the opaque SST request string advertised to donor candidates.
    fn sst_request(&self) -> String;

    /// Start donating a state snapshot. Runs the transfer asynchronously and
    /// reports completion through `ServerState::sst_sent`. Returns zero on
    /// successful start.
    fn start_sst(&self, request: &str, gtid: Gtid, bypass: bool) -> i32;

    /// Schedule a background rollback of a brute-force-abort victim. The
    /// rollbacker thread must call [`ClientState::background_rollback`] on
    /// the victim. Only used in synchronous rollback mode.
    fn background_rollback(&self, client: &ClientState);

    /// Observability hook, invoked under the server mutex on every lifecycle
    /// transition. Must not call back into the server state.
    fn log_state_change(&self, from: ServerStatus, to: ServerStatus);

    /// Observability hook for delivered views. Must not call back into the
    /// server state.
    fn log_view(&self, view: &View);

    /// Re-register streaming appliers for fragments found in local storage
    /// after a state snapshot has been installed.
    fn recover_streaming_appliers(&self, server: &crate::server_state::ServerState);

    /// Produce a fresh applier to stand in for a streaming transaction whose
    /// fragments arrive without a registered consumer.
    fn streaming_applier_service(&self) -> SharedApplier;
}

/// Per-session callbacks into the DBMS.
///
/// Several of these are exercised by the transaction collaborator rather
/// than the session hooks.
pub trait ClientService: Send + Sync {
    /// Roll back the session's storage-engine transaction. Called without
    /// any core lock held. Returns zero on success.
    fn rollback(&self) -> i32;

    fn is_autocommit(&self) -> bool;

    /// Whether the DBMS runs two-phase commit for this session.
    fn do_2pc(&self) -> bool;

    /// The certified transaction lost its locks and will be replayed.
    fn will_replay(&self);

    fn replay(&self) -> ProviderStatus;

    /// Block until preceding replayers have finished.
    fn wait_for_replayers(&self);

    /// Collect the session's pending write set for replication. Returns zero
    /// on success.
    fn prepare_data_for_replication(&self) -> i32;

    /// Collect the next streaming fragment into `buffer`. Returns zero on
    /// success.
    fn prepare_fragment_for_replication(&self, buffer: &mut Vec<u8>) -> i32;

    /// Test synchronization point.
    fn debug_sync(&self, point: &str);

    /// Whether the DBMS has killed this session.
    fn killed(&self) -> bool;

    /// Abort the session immediately.
    fn abort(&self);

    /// Re-establish session thread-local state after a thread switch.
    fn store_globals(&self);

    /// Surface a client error to the DBMS error stack.
    fn on_error(&self, error: ClientError);
}

/// Applier interface for remote write sets and streaming fragments.
pub trait HighPriorityService {
    /// Begin applying a new transaction at the given position.
    fn start_transaction(&mut self, handle: &WsHandle, meta: &WsMeta);

    /// Apply one write set or fragment. Returns zero on success.
    fn apply_write_set(&mut self, meta: &WsMeta, data: &[u8]) -> i32;

    /// Commit the applied transaction at its ordered position.
    fn commit(&mut self, handle: &WsHandle, meta: &WsMeta) -> i32;

    /// Roll back the transaction, discarding any applied fragments.
    fn rollback(&mut self, handle: &WsHandle, meta: &WsMeta) -> i32;

    /// Ordering and resource cleanup after one applied unit.
    fn after_apply(&mut self);
}
