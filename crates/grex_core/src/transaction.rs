//! Embedded transaction collaborator.
//!
//! The full certify/commit/replay machine is owned by the transaction layer
//! of the embedder; the coordination core only needs the substates the
//! session hooks and brute-force aborts observe. The object lives inside the
//! client state and is mutated only under the client mutex.

use std::fmt;

use grex_common::{Seqno, TransactionId};

/// Substates visible to the coordination hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Statement execution in progress.
    Executing,
    /// A high-priority applier marked the transaction for abort; the owning
    /// session must roll back at its next hook.
    MustAbort,
    /// Rollback in progress (background rollbacker in synchronous mode).
    Aborting,
    /// Rolled back; awaiting statement-end cleanup.
    Aborted,
    /// Committed; awaiting statement-end cleanup.
    Committed,
}

impl TxnState {
    fn as_str(&self) -> &'static str {
        match self {
            TxnState::Executing => "executing",
            TxnState::MustAbort => "must_abort",
            TxnState::Aborting => "aborting",
            TxnState::Aborted => "aborted",
            TxnState::Committed => "committed",
        }
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unit in which a streaming transaction fragments its write set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentUnit {
    Bytes,
    Rows,
    Statements,
}

/// Fragmenting parameters of a streaming transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingContext {
    pub fragment_unit: FragmentUnit,
    pub fragment_size: usize,
    pub fragments_sent: usize,
}

/// Transaction substate tracking for one client session.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TxnState,
    active: bool,
    /// Seqno of the write set that brute-force aborted this transaction.
    bf_seqno: Seqno,
    streaming: Option<StreamingContext>,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction {
            id: TransactionId::UNDEFINED,
            state: TxnState::Executing,
            active: false,
            bf_seqno: Seqno::UNDEFINED,
            streaming: None,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn bf_seqno(&self) -> Seqno {
        self.bf_seqno
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.is_some()
    }

    pub fn streaming(&self) -> Option<&StreamingContext> {
        self.streaming.as_ref()
    }

    /// Start a new transaction. Starting over an active transaction is a
    /// programming error.
    pub fn start(&mut self, id: TransactionId) {
        if self.active {
            panic!(
                "transaction: Unallowed state transition: {} -> executing",
                self.state
            );
        }
        self.id = id;
        self.state = TxnState::Executing;
        self.active = true;
        self.bf_seqno = Seqno::UNDEFINED;
    }

    /// Enable fragment-based replication for this transaction. Changing the
    /// fragment unit while fragments are in flight is rejected.
    pub fn enable_streaming(&mut self, fragment_unit: FragmentUnit, fragment_size: usize) -> bool {
        if let Some(ctx) = &self.streaming {
            if self.active && ctx.fragments_sent > 0 && ctx.fragment_unit != fragment_unit {
                return false;
            }
        }
        let fragments_sent = self.streaming.map_or(0, |c| c.fragments_sent);
        self.streaming = Some(StreamingContext {
            fragment_unit,
            fragment_size,
            fragments_sent,
        });
        true
    }

    /// Record one replicated fragment.
    pub fn fragment_sent(&mut self) {
        if let Some(ctx) = &mut self.streaming {
            ctx.fragments_sent += 1;
        }
    }

    /// Mark the transaction for brute-force abort. Only an active,
    /// executing transaction can be marked; returns whether the mark took.
    pub fn bf_abort(&mut self, seqno: Seqno) -> bool {
        if self.active && self.state == TxnState::Executing {
            self.set_state(TxnState::MustAbort);
            self.bf_seqno = seqno;
            true
        } else {
            false
        }
    }

    /// Hand the transaction to a rollback executor: MustAbort -> Aborting.
    pub fn start_rollback(&mut self) {
        self.set_state(TxnState::Aborting);
    }

    /// Roll the transaction back. Valid from Executing, MustAbort, and
    /// Aborting.
    pub fn rollback(&mut self) {
        if self.state != TxnState::Aborting {
            self.set_state(TxnState::Aborting);
        }
        self.set_state(TxnState::Aborted);
    }

    pub fn commit(&mut self) {
        self.set_state(TxnState::Committed);
    }

    /// Statement-end cleanup: a terminal substate deactivates the
    /// transaction. Returns true when a rolled-back transaction was cleaned
    /// up.
    pub fn after_statement(&mut self) -> bool {
        match self.state {
            TxnState::Aborted => {
                self.active = false;
                self.streaming = None;
                true
            }
            TxnState::Committed => {
                self.active = false;
                self.streaming = None;
                false
            }
            _ => false,
        }
    }

    fn set_state(&mut self, to: TxnState) {
        use TxnState::*;
        let allowed = matches!(
            (self.state, to),
            (Executing, MustAbort)
                | (Executing, Aborting)
                | (Executing, Committed)
                | (MustAbort, Aborting)
                | (Aborting, Aborted)
        );
        if !allowed {
            panic!(
                "transaction: Unallowed state transition: {} -> {}",
                self.state, to
            );
        }
        self.state = to;
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Transaction::new()
    }
}
