//! Per-session client state machine.
//!
//! Each DBMS session owns one `ClientState` and drives it through the
//! command hooks: `open` → `before_command` → `before_statement` →
//! *(statement executes)* → `after_statement` → `after_command_before_result`
//! → *(result sent)* → `after_command_after_result`, then `close` and
//! `cleanup`. High-priority applier threads may mark the embedded
//! transaction for brute-force abort at any point; the hooks absorb the
//! abort as a deadlock error at the next boundary.
//!
//! Lock order: a thread holding the client mutex may take the server mutex,
//! never the reverse. Sections that call embedder services drop the client
//! lock and reacquire.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, MutexGuard};

use grex_common::{ClientError, ClientId, Key, RollbackMode, Seqno, TransactionId, WsFlags, WsMeta};

use crate::server_state::ServerState;
use crate::service::ClientService;
use crate::transaction::{FragmentUnit, Transaction, TxnState};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// Not open.
    None,
    /// Between commands.
    Idle,
    /// Processing a command.
    Exec,
    /// Command done, result being returned.
    Result,
    /// Session closing.
    Quitting,
}

impl ClientStatus {
    fn as_str(self) -> &'static str {
        match self {
            ClientStatus::None => "none",
            ClientStatus::Idle => "idle",
            ClientStatus::Exec => "exec",
            ClientStatus::Result => "result",
            ClientStatus::Quitting => "quit",
        }
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Session replication modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    /// Non-replicating session; terminal.
    Local,
    /// Local transactions replicated through the provider.
    Replicating,
    /// Applier session for remote write sets.
    HighPriority,
    /// Total-order isolation.
    Toi,
}

impl ClientMode {
    fn as_str(self) -> &'static str {
        match self {
            ClientMode::Local => "local",
            ClientMode::Replicating => "replicating",
            ClientMode::HighPriority => "high-priority",
            ClientMode::Toi => "toi",
        }
    }
}

impl fmt::Display for ClientMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome classification of `after_statement`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterStatementResult {
    Success,
    /// The statement deadlocked but may be retried transparently
    /// (replicating autocommit session).
    MayRetry,
    Error,
}

fn state_transition_allowed(from: ClientStatus, to: ClientStatus) -> bool {
    matches!(
        (from, to),
        (ClientStatus::None, ClientStatus::Idle)
            | (ClientStatus::Idle, ClientStatus::Exec)
            | (ClientStatus::Idle, ClientStatus::Quitting)
            | (ClientStatus::Exec, ClientStatus::Result)
            | (ClientStatus::Result, ClientStatus::Idle)
            | (ClientStatus::Quitting, ClientStatus::None)
    )
}

fn mode_transition_allowed(from: ClientMode, to: ClientMode) -> bool {
    use ClientMode::*;
    matches!(
        (from, to),
        (Replicating, HighPriority)
            | (Replicating, Toi)
            | (HighPriority, Replicating)
            | (HighPriority, Toi)
            | (Toi, Replicating)
            | (Toi, HighPriority)
    )
}

/// Where the current client error came from; decides whether the idle
/// transition may clear it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorOrigin {
    None,
    /// Set by the session itself.
    Session,
    /// Absorbed from the embedded transaction (BF abort, certification).
    Transaction,
}

struct ClientInner {
    id: ClientId,
    state: ClientStatus,
    mode: ClientMode,
    /// Mode saved on TOI entry, restored on leave.
    toi_mode: Option<ClientMode>,
    toi_meta: Option<WsMeta>,
    owning_thread: Option<ThreadId>,
    current_thread: Option<ThreadId>,
    current_error: ClientError,
    error_origin: ErrorOrigin,
    debug_level: i32,
    transaction: Transaction,
}

/// One DBMS session's replication coordination state.
pub struct ClientState {
    server: Arc<ServerState>,
    client_service: Arc<dyn ClientService>,
    inner: Mutex<ClientInner>,
    cond: Condvar,
}

impl ClientState {
    pub fn new(
        server: Arc<ServerState>,
        client_service: Arc<dyn ClientService>,
        mode: ClientMode,
    ) -> Arc<Self> {
        Arc::new(ClientState {
            server,
            client_service,
            inner: Mutex::new(ClientInner {
                id: ClientId(0),
                state: ClientStatus::None,
                mode,
                toi_mode: None,
                toi_meta: None,
                owning_thread: None,
                current_thread: None,
                current_error: ClientError::Success,
                error_origin: ErrorOrigin::None,
                debug_level: 0,
                transaction: Transaction::new(),
            }),
            cond: Condvar::new(),
        })
    }

    pub fn server(&self) -> &Arc<ServerState> {
        &self.server
    }

    pub fn id(&self) -> ClientId {
        self.inner.lock().id
    }

    pub fn state(&self) -> ClientStatus {
        self.inner.lock().state
    }

    pub fn mode(&self) -> ClientMode {
        self.inner.lock().mode
    }

    pub fn current_error(&self) -> ClientError {
        self.inner.lock().current_error
    }

    pub fn toi_meta(&self) -> Option<WsMeta> {
        self.inner.lock().toi_meta
    }

    pub fn transaction_state(&self) -> TxnState {
        self.inner.lock().transaction.state()
    }

    pub fn transaction_active(&self) -> bool {
        self.inner.lock().transaction.active()
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.inner.lock().transaction.id()
    }

    pub fn set_debug_level(&self, level: i32) {
        self.inner.lock().debug_level = level;
    }

    /// Thread the session is currently attached to.
    pub fn current_thread(&self) -> Option<ThreadId> {
        self.inner.lock().current_thread
    }

    // ── Session lifecycle ───────────────────────────────────────────────

    /// Open the session. The calling thread becomes the owning thread; the
    /// remaining hooks assert they run on it.
    pub fn open(&self, id: ClientId) {
        let mut inner = self.inner.lock();
        self.debug_log_state(&inner, "open: enter");
        inner.owning_thread = Some(thread::current().id());
        inner.current_thread = inner.owning_thread;
        self.set_state(&mut inner, ClientStatus::Idle);
        inner.id = id;
        self.debug_log_state(&inner, "open: leave");
    }

    /// Close the session. A transaction still active (connection dropped
    /// mid-statement) is rolled back.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        self.debug_log_state(&inner, "close: enter");
        self.set_state(&mut inner, ClientStatus::Quitting);
        if inner.transaction.active() {
            self.rollback_transaction(&mut inner, true);
        }
        self.debug_log_state(&inner, "close: leave");
    }

    /// Release the session slot: quitting → none. Clears the session error.
    pub fn cleanup(&self) {
        let mut inner = self.inner.lock();
        self.debug_log_state(&inner, "cleanup: enter");
        self.set_state(&mut inner, ClientStatus::None);
        inner.current_error = ClientError::Success;
        inner.error_origin = ErrorOrigin::None;
        debug_assert!(!inner.transaction.active());
        self.debug_log_state(&inner, "cleanup: leave");
    }

    /// Re-establish session thread affinity after the DBMS moved the
    /// session to another worker thread.
    pub fn store_globals(&self) {
        let mut inner = self.inner.lock();
        inner.current_thread = Some(thread::current().id());
    }

    // ── Command hooks ───────────────────────────────────────────────────

    /// Command entry: idle → executing.
    ///
    /// In synchronous rollback mode the hook first waits for a background
    /// rollback in flight. Returns non-zero when the transaction was (or is
    /// being) brute-force aborted; the session then carries a deadlock error
    /// and must drive the command to completion through the post hooks.
    pub fn before_command(&self) -> i32 {
        let mut inner = self.inner.lock();
        self.debug_log_state(&inner, "before_command: enter");
        self.assert_owner(&inner);
        debug_assert_eq!(inner.state, ClientStatus::Idle);
        if self.server.rollback_mode() == RollbackMode::Sync {
            // wait until the background rollbacker has finished with us
            while inner.transaction.active()
                && inner.transaction.state() == TxnState::Aborting
            {
                self.cond.wait(&mut inner);
            }
        }
        self.set_state(&mut inner, ClientStatus::Exec);
        if inner.transaction.active() {
            match inner.transaction.state() {
                TxnState::MustAbort => {
                    debug_assert_eq!(self.server.rollback_mode(), RollbackMode::Async);
                    self.override_error_in(&mut inner, ClientError::Deadlock, ErrorOrigin::Transaction);
                    self.rollback_transaction(&mut inner, true);
                    debug_assert!(!inner.transaction.active());
                    self.debug_log_state(&inner, "before_command: error");
                    return 1;
                }
                TxnState::Aborted => {
                    // the abort completed between commands; consume it now
                    self.override_error_in(&mut inner, ClientError::Deadlock, ErrorOrigin::Transaction);
                    inner.transaction.after_statement();
                    debug_assert!(!inner.transaction.active());
                    self.debug_log_state(&inner, "before_command: error");
                    return 1;
                }
                _ => {}
            }
        }
        self.debug_log_state(&inner, "before_command: success");
        0
    }

    /// Statement entry. Returns non-zero when execution must be skipped;
    /// rollback and cleanup then happen in the post-command hooks.
    pub fn before_statement(&self) -> i32 {
        let inner = self.inner.lock();
        self.debug_log_state(&inner, "before_statement: enter");
        self.assert_owner(&inner);
        if inner.transaction.active() && inner.transaction.state() == TxnState::MustAbort {
            self.debug_log_state(&inner, "before_statement: error");
            return 1;
        }
        0
    }

    /// Statement exit: classifies the outcome for the DBMS retry logic.
    pub fn after_statement(&self) -> AfterStatementResult {
        let mut inner = self.inner.lock();
        self.debug_log_state(&inner, "after_statement: enter");
        self.assert_owner(&inner);
        debug_assert_eq!(inner.state, ClientStatus::Exec);
        if inner.transaction.active() && inner.transaction.state() == TxnState::MustAbort {
            self.override_error_in(&mut inner, ClientError::Deadlock, ErrorOrigin::Transaction);
            self.rollback_transaction(&mut inner, false);
        }
        if inner.transaction.after_statement() {
            // a rollback completed during the statement (background
            // rollbacker or the branch above); surface it as a deadlock
            self.override_error_in(&mut inner, ClientError::Deadlock, ErrorOrigin::Transaction);
        }
        let result = match inner.current_error {
            ClientError::Deadlock
                if inner.mode == ClientMode::Replicating && self.client_service.is_autocommit() =>
            {
                AfterStatementResult::MayRetry
            }
            ClientError::Success => AfterStatementResult::Success,
            _ => AfterStatementResult::Error,
        };
        self.debug_log_state(&inner, "after_statement: leave");
        result
    }

    /// Command exit, before the result is returned: executing → result.
    ///
    /// A brute-force abort that raced with the statement is absorbed here;
    /// the rolled-back transaction stays attached to the session until the
    /// next command so the error survives the result phase.
    pub fn after_command_before_result(&self) {
        let mut inner = self.inner.lock();
        self.debug_log_state(&inner, "after_command_before_result: enter");
        self.assert_owner(&inner);
        debug_assert_eq!(inner.state, ClientStatus::Exec);
        if inner.transaction.active() && inner.transaction.state() == TxnState::MustAbort {
            self.override_error_in(&mut inner, ClientError::Deadlock, ErrorOrigin::Transaction);
            self.rollback_transaction(&mut inner, false);
            debug_assert_eq!(inner.transaction.state(), TxnState::Aborted);
        }
        self.set_state(&mut inner, ClientStatus::Result);
        self.debug_log_state(&inner, "after_command_before_result: leave");
    }

    /// Result sent: result → idle.
    ///
    /// An abort that raced between the result hooks is absorbed. With no
    /// active transaction, a lingering transaction-origin error is cleared;
    /// errors set by the session itself survive until `cleanup`.
    pub fn after_command_after_result(&self) {
        let mut inner = self.inner.lock();
        self.debug_log_state(&inner, "after_command_after_result: enter");
        self.assert_owner(&inner);
        debug_assert_eq!(inner.state, ClientStatus::Result);
        debug_assert_ne!(inner.transaction.state(), TxnState::Aborting);
        if inner.transaction.active() && inner.transaction.state() == TxnState::MustAbort {
            self.rollback_transaction(&mut inner, false);
            self.override_error_in(&mut inner, ClientError::Deadlock, ErrorOrigin::Transaction);
        } else if !inner.transaction.active() && inner.error_origin == ErrorOrigin::Transaction {
            inner.current_error = ClientError::Success;
            inner.error_origin = ErrorOrigin::None;
        }
        self.set_state(&mut inner, ClientStatus::Idle);
        self.debug_log_state(&inner, "after_command_after_result: leave");
    }

    // ── Transaction control ─────────────────────────────────────────────

    /// Begin a transaction on this session.
    pub fn start_transaction(&self, id: TransactionId) {
        let mut inner = self.inner.lock();
        self.assert_owner(&inner);
        inner.transaction.start(id);
    }

    /// Enable fragment-based replication for the session's transaction.
    /// Returns non-zero when the fragment unit of an in-flight streaming
    /// transaction would change.
    pub fn enable_streaming(&self, fragment_unit: FragmentUnit, fragment_size: usize) -> i32 {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.mode, ClientMode::Replicating);
        if inner.transaction.enable_streaming(fragment_unit, fragment_size) {
            0
        } else {
            tracing::error!(
                client = %inner.id,
                "changing fragment unit for active transaction not allowed"
            );
            1
        }
    }

    /// Mark the session's transaction for brute-force abort. Called from
    /// high-priority applier threads. Returns whether the mark took.
    ///
    /// In synchronous rollback mode the victim is handed to the background
    /// rollbacker immediately.
    pub fn bf_abort(&self, seqno: Seqno) -> bool {
        let mut inner = self.inner.lock();
        if !inner.transaction.bf_abort(seqno) {
            return false;
        }
        tracing::debug!(client = %inner.id, %seqno, "transaction marked for brute-force abort");
        let sync = self.server.rollback_mode() == RollbackMode::Sync;
        if sync {
            inner.transaction.start_rollback();
        }
        self.cond.notify_all();
        drop(inner);
        if sync {
            self.server.server_service().background_rollback(self);
        }
        true
    }

    /// Complete a brute-force abort on the background rollbacker thread:
    /// aborting → aborted, then wake the owning session.
    pub fn background_rollback(&self) {
        self.client_service.store_globals();
        self.client_service.rollback();
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.transaction.state(), TxnState::Aborting);
        inner.transaction.rollback();
        self.cond.notify_all();
    }

    // ── Errors ──────────────────────────────────────────────────────────

    /// Raise the session error. Clearing a non-success error with success
    /// is a programming error; errors reset only on the path back through
    /// `none`.
    pub fn override_error(&self, error: ClientError) {
        let mut inner = self.inner.lock();
        self.assert_owner(&inner);
        self.override_error_in(&mut inner, error, ErrorOrigin::Session);
    }

    fn override_error_in(&self, inner: &mut ClientInner, error: ClientError, origin: ErrorOrigin) {
        if inner.current_error != ClientError::Success && error == ClientError::Success {
            panic!(
                "client_state: Unallowed error transition: {} -> {}",
                inner.current_error, error
            );
        }
        inner.current_error = error;
        inner.error_origin = origin;
    }

    // ── Total-order isolation ───────────────────────────────────────────

    /// Serialize an operation cluster-wide and shift to TOI mode. Only
    /// valid for a replicating session inside a command. Returns zero on
    /// success.
    pub fn enter_toi(&self, keys: &[Key], buffer: &[u8], flags: WsFlags) -> i32 {
        let id = {
            let inner = self.inner.lock();
            debug_assert_eq!(inner.state, ClientStatus::Exec);
            debug_assert_eq!(inner.mode, ClientMode::Replicating);
            inner.id
        };
        match self.server.provider().enter_toi(id, keys, buffer, flags) {
            Ok(meta) => {
                let mut inner = self.inner.lock();
                inner.toi_mode = Some(inner.mode);
                self.set_mode(&mut inner, ClientMode::Toi);
                inner.toi_meta = Some(meta);
                0
            }
            Err(_) => {
                let mut inner = self.inner.lock();
                self.override_error_in(&mut inner, ClientError::ErrorDuringCommit, ErrorOrigin::Session);
                1
            }
        }
    }

    /// TOI entry for a high-priority applier: the operation is already
    /// serialized by the provider, so the shift is local.
    pub fn enter_toi_mode(&self, ws_meta: &WsMeta) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.mode, ClientMode::HighPriority);
        inner.toi_mode = Some(inner.mode);
        self.set_mode(&mut inner, ClientMode::Toi);
        inner.toi_meta = Some(*ws_meta);
    }

    /// Leave TOI, restoring the saved mode. Returns zero on success.
    pub fn leave_toi(&self) -> i32 {
        let (id, saved) = {
            let inner = self.inner.lock();
            let saved = inner
                .toi_mode
                .unwrap_or_else(|| panic!("client_state: leave_toi without enter_toi"));
            (inner.id, saved)
        };
        let mut ret = 0;
        if saved == ClientMode::Replicating && self.server.provider().leave_toi(id).is_err() {
            let mut inner = self.inner.lock();
            self.override_error_in(&mut inner, ClientError::ErrorDuringCommit, ErrorOrigin::Session);
            ret = 1;
        }
        let mut inner = self.inner.lock();
        self.set_mode(&mut inner, saved);
        inner.toi_mode = None;
        inner.toi_meta = None;
        ret
    }

    // ── Internal ────────────────────────────────────────────────────────

    /// Roll back the active transaction: the storage rollback runs without
    /// the client mutex, then the transaction object is driven to aborted.
    /// With `cleanup` the statement-end cleanup detaches it as well.
    fn rollback_transaction(&self, inner: &mut MutexGuard<'_, ClientInner>, cleanup: bool) {
        debug_assert!(inner.transaction.active());
        MutexGuard::unlocked(inner, || {
            self.client_service.rollback();
        });
        if !matches!(
            inner.transaction.state(),
            TxnState::Aborted | TxnState::Committed
        ) {
            inner.transaction.rollback();
        }
        if cleanup {
            inner.transaction.after_statement();
        }
    }

    fn set_state(&self, inner: &mut ClientInner, to: ClientStatus) {
        let from = inner.state;
        if !state_transition_allowed(from, to) {
            panic!("client_state: Unallowed state transition: {from} -> {to}");
        }
        inner.state = to;
    }

    fn set_mode(&self, inner: &mut ClientInner, to: ClientMode) {
        let from = inner.mode;
        if !mode_transition_allowed(from, to) {
            panic!("client_state: Unallowed mode transition: {from} -> {to}");
        }
        inner.mode = to;
    }

    fn assert_owner(&self, inner: &ClientInner) {
        debug_assert_eq!(
            inner.owning_thread,
            Some(thread::current().id()),
            "client hook invoked off the owning thread"
        );
    }

    fn debug_log_state(&self, inner: &ClientInner, context: &str) {
        if inner.debug_level >= 1 {
            tracing::debug!(
                server = %self.server.name(),
                client = %inner.id,
                state = %inner.state,
                error = %inner.current_error,
                "client_state: {context}"
            );
        }
    }
}
