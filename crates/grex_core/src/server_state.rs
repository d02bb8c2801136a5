//! Server lifecycle state machine and write-set dispatch.
//!
//! One `ServerState` exists per process. Two classes of threads share it:
//! client threads driving their sessions through the client hooks, and
//! provider threads delivering `on_view` / `on_sync` / `on_apply`. A single
//! mutex guards every field; waits use the paired condvar with predicate
//! loops, so every transition broadcasts.
//!
//! Two lifecycle paths exist, selected by the embedder's snapshot policy:
//!
//! - snapshot after storage-engine init (logical dumps):
//!   disconnected → initializing → initialized → connected → joiner →
//!   joined → synced, with donor ↔ joined while donating;
//! - snapshot before init (physical transfers):
//!   disconnected → connected → joiner → initializing → initialized →
//!   joined → synced.
//!
//! Any other edge is a programming error and panics.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use grex_common::{
    Error, Gtid, RollbackMode, Seqno, ServerConfig, ServerId, StatusVariable, TransactionId, View,
    ViewStatus, WsFlags, WsHandle, WsMeta,
};

use crate::client_state::ClientState;
use crate::provider::Provider;
use crate::service::{HighPriorityService, ServerService, SharedApplier};
use crate::streaming::StreamingRegistry;

/// Lifecycle states of a replication server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Not part of any group.
    Disconnected,
    /// Storage engine initialization in progress.
    Initializing,
    /// Storage engine ready; not yet joined to a group.
    Initialized,
    /// Member of a primary view, join not yet decided.
    Connected,
    /// Receiving a state snapshot.
    Joiner,
    /// Snapshot installed; not yet caught up with the group.
    Joined,
    /// Donating a state snapshot.
    Donor,
    /// Caught up; serving.
    Synced,
    /// Leaving the group.
    Disconnecting,
}

pub(crate) const N_SERVER_STATES: usize = 9;

impl ServerStatus {
    fn index(self) -> usize {
        match self {
            ServerStatus::Disconnected => 0,
            ServerStatus::Initializing => 1,
            ServerStatus::Initialized => 2,
            ServerStatus::Connected => 3,
            ServerStatus::Joiner => 4,
            ServerStatus::Joined => 5,
            ServerStatus::Donor => 6,
            ServerStatus::Synced => 7,
            ServerStatus::Disconnecting => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Disconnected => "disconnected",
            ServerStatus::Initializing => "initializing",
            ServerStatus::Initialized => "initialized",
            ServerStatus::Connected => "connected",
            ServerStatus::Joiner => "joiner",
            ServerStatus::Joined => "joined",
            ServerStatus::Donor => "donor",
            ServerStatus::Synced => "synced",
            ServerStatus::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn transition_allowed(from: ServerStatus, to: ServerStatus) -> bool {
    use ServerStatus::*;
    matches!(
        (from, to),
        (Disconnected, Initializing)
            | (Disconnected, Connected)
            | (Initializing, Initialized)
            | (Initializing, Disconnecting)
            | (Initialized, Connected)
            | (Initialized, Joined)
            | (Initialized, Disconnecting)
            | (Connected, Joiner)
            | (Connected, Disconnecting)
            | (Joiner, Initializing)
            | (Joiner, Joined)
            | (Joiner, Disconnecting)
            | (Joined, Donor)
            | (Joined, Synced)
            | (Joined, Disconnecting)
            | (Donor, Joined)
            | (Donor, Synced)
            | (Donor, Disconnecting)
            | (Synced, Donor)
            | (Synced, Disconnecting)
            | (Disconnecting, Disconnected)
    )
}

struct Inner {
    state: ServerStatus,
    /// Append-only log of entered states, for diagnostics and wait
    /// predicates.
    state_hist: Vec<ServerStatus>,
    state_waiters: [usize; N_SERVER_STATES],
    bootstrap: bool,
    init_initialized: bool,
    /// Position advertised by the snapshot donor.
    sst_gtid: Gtid,
    desync_count: usize,
    pause_count: usize,
    pause_seqno: Seqno,
    streaming: StreamingRegistry,
    provider: Option<Arc<dyn Provider>>,
    /// Group position at cluster entry.
    connected_gtid: Gtid,
    current_view: View,
    last_committed_gtid: Gtid,
}

/// Singleton server coordination state.
pub struct ServerState {
    config: ServerConfig,
    server_service: Arc<dyn ServerService>,
    /// Snapshot policy, queried from the embedder once at construction.
    sst_before_init: bool,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl ServerState {
    pub fn new(config: ServerConfig, server_service: Arc<dyn ServerService>) -> Arc<Self> {
        let last_committed_gtid = config.initial_position;
        let sst_before_init = server_service.sst_before_init();
        Arc::new(ServerState {
            config,
            server_service,
            sst_before_init,
            inner: Mutex::new(Inner {
                state: ServerStatus::Disconnected,
                state_hist: Vec::new(),
                state_waiters: [0; N_SERVER_STATES],
                bootstrap: false,
                init_initialized: false,
                sst_gtid: Gtid::undefined(),
                desync_count: 0,
                pause_count: 0,
                pause_seqno: Seqno::UNDEFINED,
                streaming: StreamingRegistry::default(),
                provider: None,
                connected_gtid: Gtid::undefined(),
                current_view: View::disconnected(),
                last_committed_gtid,
            }),
            cond: Condvar::new(),
        })
    }

    // ── Identity ────────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn id(&self) -> ServerId {
        self.config.id
    }

    pub fn incoming_address(&self) -> &str {
        &self.config.incoming_address
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn working_dir(&self) -> &str {
        &self.config.working_dir
    }

    pub fn initial_position(&self) -> Gtid {
        self.config.initial_position
    }

    pub fn max_protocol_version(&self) -> i32 {
        self.config.max_protocol_version
    }

    pub fn rollback_mode(&self) -> RollbackMode {
        self.config.rollback_mode
    }

    /// Snapshot policy declared by the embedder.
    pub fn sst_before_init(&self) -> bool {
        self.sst_before_init
    }

    pub fn server_service(&self) -> &Arc<dyn ServerService> {
        &self.server_service
    }

    // ── Provider ────────────────────────────────────────────────────────

    pub fn load_provider(&self, provider: Arc<dyn Provider>) {
        let mut inner = self.inner.lock();
        inner.provider = Some(provider);
    }

    pub fn unload_provider(&self) {
        let mut inner = self.inner.lock();
        inner.provider = None;
    }

    /// Handle to the loaded provider. Use before load is a programming
    /// error.
    pub fn provider(&self) -> Arc<dyn Provider> {
        let inner = self.inner.lock();
        Self::provider_of(&inner)
    }

    fn provider_of(inner: &Inner) -> Arc<dyn Provider> {
        inner
            .provider
            .clone()
            .unwrap_or_else(|| panic!("server_state: provider not loaded"))
    }

    // ── Observable state ────────────────────────────────────────────────

    pub fn state(&self) -> ServerStatus {
        self.inner.lock().state
    }

    pub fn state_history(&self) -> Vec<ServerStatus> {
        self.inner.lock().state_hist.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().init_initialized
    }

    pub fn current_view(&self) -> View {
        self.inner.lock().current_view.clone()
    }

    pub fn connected_gtid(&self) -> Gtid {
        self.inner.lock().connected_gtid
    }

    pub fn last_committed_gtid(&self) -> Gtid {
        self.inner.lock().last_committed_gtid
    }

    pub fn pause_seqno(&self) -> Seqno {
        self.inner.lock().pause_seqno
    }

    pub fn desync_count(&self) -> usize {
        self.inner.lock().desync_count
    }

    pub fn pause_count(&self) -> usize {
        self.inner.lock().pause_count
    }

    /// Number of threads currently blocked in `wait_until_state(target)`.
    pub fn waiter_count(&self, target: ServerStatus) -> usize {
        self.inner.lock().state_waiters[target.index()]
    }

    /// Whether this server bootstrapped the group at connect time.
    pub fn is_bootstrap(&self) -> bool {
        self.inner.lock().bootstrap
    }

    /// Provider status variables for monitoring.
    pub fn status(&self) -> Vec<StatusVariable> {
        self.provider().status_variables()
    }

    /// Record a locally committed position. Stale positions (at or below the
    /// known position of the same source) are discarded, keeping the
    /// committed GTID monotone.
    pub fn set_last_committed_gtid(&self, gtid: Gtid) {
        let mut inner = self.inner.lock();
        Self::update_last_committed(&mut inner, gtid);
    }

    fn update_last_committed(inner: &mut Inner, gtid: Gtid) {
        if gtid.is_undefined() {
            return;
        }
        let cur = inner.last_committed_gtid;
        if cur.server_id == gtid.server_id && !cur.seqno.is_undefined() && gtid.seqno <= cur.seqno {
            tracing::debug!(%gtid, current = %cur, "discarding stale commit position");
            return;
        }
        inner.last_committed_gtid = gtid;
    }

    /// Block until the server has entered `target`. Spurious wakeups are
    /// absorbed by the predicate loop; `disconnect()` wakes all waiters by
    /// driving the machine to a terminal state.
    pub fn wait_until_state(&self, target: ServerStatus) {
        let mut inner = self.inner.lock();
        let idx = target.index();
        inner.state_waiters[idx] += 1;
        while inner.state != target {
            self.cond.wait(&mut inner);
        }
        inner.state_waiters[idx] -= 1;
    }

    // ── Group membership ────────────────────────────────────────────────

    /// Join the group. In snapshot-after-init mode the node is already
    /// initialized and becomes `Connected` here; in snapshot-before-init
    /// mode the first own-primary view drives the transition instead.
    pub fn connect(
        &self,
        cluster_name: &str,
        cluster_address: &str,
        cluster_donor: &str,
        bootstrap: bool,
    ) -> Result<(), Error> {
        let provider = self.provider();
        {
            let mut inner = self.inner.lock();
            inner.bootstrap = bootstrap;
        }
        tracing::info!(cluster_name, cluster_address, bootstrap, "connecting to cluster");
        provider.connect(cluster_name, cluster_address, cluster_donor, bootstrap)?;
        let mut inner = self.inner.lock();
        if inner.state == ServerStatus::Initialized {
            self.shift(&mut inner, ServerStatus::Connected);
        }
        Ok(())
    }

    /// Leave the group and wait for the final view.
    pub fn disconnect(&self) -> Result<(), Error> {
        let provider = self.provider();
        {
            let mut inner = self.inner.lock();
            if !matches!(
                inner.state,
                ServerStatus::Disconnecting | ServerStatus::Disconnected
            ) {
                self.shift(&mut inner, ServerStatus::Disconnecting);
            }
        }
        provider.disconnect()?;
        self.wait_until_state(ServerStatus::Disconnected);
        Ok(())
    }

    /// Provider callback: the node has been accepted into the group at
    /// `gtid`.
    pub fn on_connect(&self, gtid: Gtid) {
        let mut inner = self.inner.lock();
        tracing::info!(%gtid, "connected to cluster");
        inner.connected_gtid = gtid;
        if inner.state == ServerStatus::Disconnected {
            self.shift(&mut inner, ServerStatus::Connected);
        }
    }

    /// Provider callback: a new membership view.
    ///
    /// A primary view with the local node present may complete the connect
    /// handshake and closes streams originating from departed members. A
    /// non-primary view, or a primary view without the local node, closes
    /// all open transactions and shifts toward disconnecting. The final view
    /// completes `disconnect()`.
    pub fn on_view(&self, view: View, applier: &mut dyn HighPriorityService) {
        self.server_service.log_view(&view);
        let mut inner = self.inner.lock();
        tracing::info!(
            status = %view.status,
            members = view.members.len(),
            view_seqno = %view.view_seqno,
            "new cluster view"
        );
        match view.status {
            ViewStatus::Primary => {
                if view.is_own_primary() {
                    if inner.state == ServerStatus::Disconnected {
                        self.shift(&mut inner, ServerStatus::Connected);
                    }
                } else {
                    // evicted from the primary component
                    self.close_transactions_at_disconnect(&mut inner, applier);
                    if !matches!(
                        inner.state,
                        ServerStatus::Disconnecting | ServerStatus::Disconnected
                    ) {
                        self.shift(&mut inner, ServerStatus::Disconnecting);
                    }
                }
                self.close_foreign_streams(&mut inner, &view, applier);
                inner.current_view = view;
            }
            ViewStatus::NonPrimary => {
                self.close_transactions_at_disconnect(&mut inner, applier);
                if !matches!(
                    inner.state,
                    ServerStatus::Disconnecting | ServerStatus::Disconnected
                ) {
                    self.shift(&mut inner, ServerStatus::Disconnecting);
                }
                inner.current_view = view;
            }
            ViewStatus::Disconnected => {
                self.close_transactions_at_disconnect(&mut inner, applier);
                inner.current_view = view;
                if inner.state == ServerStatus::Disconnecting {
                    self.shift(&mut inner, ServerStatus::Disconnected);
                }
            }
        }
    }

    /// Provider callback: the node has caught up with the group.
    pub fn on_sync(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ServerStatus::Synced {
            // repeated sync signals are harmless
            return;
        }
        self.shift(&mut inner, ServerStatus::Synced);
    }

    // ── Desync / pause ──────────────────────────────────────────────────

    /// Stop applying remote write sets. Reference counted: only the 0 → 1
    /// edge reaches the provider. On provider failure the count is left
    /// untouched.
    pub fn desync(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        self.desync_locked(&mut inner)
    }

    pub fn resync(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        self.resync_locked(&mut inner)
    }

    /// Pause delivery. Returns the seqno of the pause point recorded on the
    /// 0 → 1 edge.
    pub fn pause(&self) -> Result<Seqno, Error> {
        let mut inner = self.inner.lock();
        self.pause_locked(&mut inner)
    }

    pub fn resume(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        self.resume_locked(&mut inner)
    }

    /// Desync and pause atomically over the server mutex. On a pause
    /// failure the desync half is unwound and no defined seqno exists.
    pub fn desync_and_pause(&self) -> Result<Seqno, Error> {
        let mut inner = self.inner.lock();
        self.desync_locked(&mut inner)?;
        match self.pause_locked(&mut inner) {
            Ok(seqno) => Ok(seqno),
            Err(e) => {
                // unwind the half already taken
                let _ = self.resync_locked(&mut inner);
                Err(e)
            }
        }
    }

    /// Inverse of `desync_and_pause`. The provider must currently be both
    /// desynced and paused by this server.
    pub fn resume_and_resync(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        self.resume_locked(&mut inner)?;
        // a resync failure here leaves the node desynced; the caller may
        // retry resync() alone
        self.resync_locked(&mut inner)
    }

    fn desync_locked(&self, inner: &mut Inner) -> Result<(), Error> {
        if inner.desync_count == 0 {
            Self::provider_of(inner).desync()?;
        }
        inner.desync_count += 1;
        Ok(())
    }

    fn resync_locked(&self, inner: &mut Inner) -> Result<(), Error> {
        if inner.desync_count == 0 {
            panic!("server_state: resync without desync");
        }
        if inner.desync_count == 1 {
            Self::provider_of(inner).resync()?;
        }
        inner.desync_count -= 1;
        Ok(())
    }

    fn pause_locked(&self, inner: &mut Inner) -> Result<Seqno, Error> {
        if inner.pause_count == 0 {
            let seqno = Self::provider_of(inner).pause()?;
            tracing::info!(%seqno, "provider paused");
            inner.pause_seqno = seqno;
        }
        inner.pause_count += 1;
        Ok(inner.pause_seqno)
    }

    fn resume_locked(&self, inner: &mut Inner) -> Result<(), Error> {
        if inner.pause_count == 0 {
            panic!("server_state: resume without pause");
        }
        if inner.pause_count == 1 {
            Self::provider_of(inner).resume()?;
            tracing::info!("provider resumed");
            inner.pause_seqno = Seqno::UNDEFINED;
        }
        inner.pause_count -= 1;
        Ok(())
    }

    // ── State snapshot transfer ─────────────────────────────────────────

    /// Joiner side: produce the SST request advertised to donor candidates
    /// and become a joiner.
    pub fn prepare_for_sst(&self) -> String {
        let request = self.server_service.sst_request();
        let mut inner = self.inner.lock();
        self.shift(&mut inner, ServerStatus::Joiner);
        request
    }

    /// Donor side: the provider selected this node to donate. The transfer
    /// itself runs asynchronously in the embedder; a bypass request
    /// completes without data transfer.
    pub fn start_sst(&self, request: &str, gtid: Gtid, bypass: bool) -> Result<(), Error> {
        {
            let mut inner = self.inner.lock();
            self.shift(&mut inner, ServerStatus::Donor);
        }
        tracing::info!(%gtid, bypass, "starting snapshot donation");
        let rc = self.server_service.start_sst(request, gtid, bypass);
        if rc != 0 {
            let mut inner = self.inner.lock();
            self.shift(&mut inner, ServerStatus::Joined);
            return Err(Error::Sst(rc));
        }
        Ok(())
    }

    /// Donor side: transfer finished. Reports to the provider and returns
    /// the node toward joined.
    pub fn sst_sent(&self, gtid: Gtid, error: i32) -> Result<(), Error> {
        let provider = self.provider();
        tracing::info!(%gtid, error, "snapshot donation finished");
        provider.sst_sent(gtid, error)?;
        let mut inner = self.inner.lock();
        self.shift(&mut inner, ServerStatus::Joined);
        if error == 0 {
            Ok(())
        } else {
            Err(Error::Sst(error))
        }
    }

    /// Joiner side: snapshot payload installed at `gtid`.
    ///
    /// When the snapshot precedes storage-engine initialization, this blocks
    /// until the embedder reports `initialized()`; afterwards the node is
    /// joined and streaming appliers found in the snapshot are recovered.
    pub fn sst_received(&self, gtid: Gtid, error: i32) -> Result<(), Error> {
        let provider = self.provider();
        if error != 0 {
            tracing::warn!(%gtid, error, "snapshot transfer failed");
            provider.sst_received(gtid, error)?;
            return Err(Error::Sst(error));
        }
        let mut inner = self.inner.lock();
        tracing::info!(%gtid, "snapshot received");
        inner.sst_gtid = gtid;
        if !inner.init_initialized {
            // physical snapshot landed before storage engine init
            self.shift(&mut inner, ServerStatus::Initializing);
            while !inner.init_initialized {
                self.cond.wait(&mut inner);
            }
        }
        Self::update_last_committed(&mut inner, gtid);
        self.shift(&mut inner, ServerStatus::Joined);
        MutexGuard::unlocked(&mut inner, || {
            self.server_service.recover_streaming_appliers(self);
            provider.sst_received(gtid, 0)
        })?;
        Ok(())
    }

    /// Embedder callback: storage engine initialization complete.
    pub fn initialized(&self) {
        let mut inner = self.inner.lock();
        tracing::info!("server initialized");
        inner.init_initialized = true;
        match inner.state {
            // snapshot-after-init: initialization precedes the connect
            ServerStatus::Disconnected => {
                debug_assert!(!self.sst_before_init);
                self.shift(&mut inner, ServerStatus::Initializing);
                self.shift(&mut inner, ServerStatus::Initialized);
            }
            // snapshot-before-init: the received snapshot is waiting on us
            ServerStatus::Initializing => {
                debug_assert!(self.sst_before_init);
                self.shift(&mut inner, ServerStatus::Initialized);
            }
            state => {
                panic!("server_state: Unallowed state transition: {state} -> initialized");
            }
        }
    }

    // ── Causal reads ────────────────────────────────────────────────────

    /// Wait until all write sets up to `gtid` have committed locally.
    pub fn wait_for_gtid(&self, gtid: Gtid, timeout_secs: i32) -> Result<(), Error> {
        self.provider().wait_for_gtid(gtid, timeout_secs)
    }

    /// Cluster-wide causal read barrier.
    pub fn causal_read(&self, timeout_secs: i32) -> Result<Gtid, Error> {
        self.provider().causal_read(timeout_secs)
    }

    // ── Write-set application ───────────────────────────────────────────

    /// Provider callback: apply one ordered write set.
    ///
    /// Write sets at or below the snapshot position are already embedded in
    /// the snapshot and are discarded. Streaming fragments are routed to the
    /// applier registered for their origin transaction; the first fragment
    /// creates the stand-in, the commit or rollback fragment removes it.
    /// Returns zero on success.
    pub fn on_apply(
        &self,
        applier: &mut dyn HighPriorityService,
        handle: &WsHandle,
        meta: &WsMeta,
        data: &[u8],
    ) -> i32 {
        let mut inner = self.inner.lock();
        if !inner.sst_gtid.seqno.is_undefined()
            && !meta.gtid.seqno.is_undefined()
            && meta.gtid.seqno <= inner.sst_gtid.seqno
        {
            tracing::debug!(
                gtid = %meta.gtid,
                snapshot = %inner.sst_gtid,
                "discarding write set already embedded in snapshot"
            );
            return 0;
        }

        if meta.flags.rollback {
            return self.apply_rollback_fragment(&mut inner, handle, meta);
        }

        if !meta.is_streaming_fragment() {
            drop(inner);
            return self.apply_complete(applier, handle, meta, data);
        }

        if meta.flags.commit {
            let routed = inner.streaming.take_applier(meta.server_id, meta.transaction_id);
            drop(inner);
            return match routed {
                Some(svc) => {
                    let mut svc = svc.lock();
                    let mut rc = 0;
                    if !data.is_empty() {
                        rc = svc.apply_write_set(meta, data);
                    }
                    if rc == 0 {
                        rc = svc.commit(handle, meta);
                    }
                    svc.after_apply();
                    if rc == 0 {
                        self.set_last_committed_gtid(meta.gtid);
                    }
                    rc
                }
                // commit fragment without preceding fragments: the whole
                // transaction is in this write set
                None => self.apply_complete(applier, handle, meta, data),
            };
        }

        // non-final fragment: route to the stand-in applier, creating it on
        // the first fragment
        let (svc, is_first) =
            match inner.streaming.find_applier(meta.server_id, meta.transaction_id) {
                Some(svc) => (svc, false),
                None => {
                    let svc = self.server_service.streaming_applier_service();
                    inner
                        .streaming
                        .insert_applier(meta.server_id, meta.transaction_id, svc.clone());
                    (svc, true)
                }
            };
        drop(inner);
        let mut svc = svc.lock();
        if is_first {
            svc.start_transaction(handle, meta);
        }
        let rc = svc.apply_write_set(meta, data);
        svc.after_apply();
        rc
    }

    fn apply_complete(
        &self,
        applier: &mut dyn HighPriorityService,
        handle: &WsHandle,
        meta: &WsMeta,
        data: &[u8],
    ) -> i32 {
        applier.start_transaction(handle, meta);
        let mut rc = applier.apply_write_set(meta, data);
        if rc == 0 {
            rc = applier.commit(handle, meta);
        } else {
            applier.rollback(handle, meta);
        }
        applier.after_apply();
        if rc == 0 {
            self.set_last_committed_gtid(meta.gtid);
        }
        rc
    }

    /// A rollback fragment closes the stand-in applier for the stream and,
    /// when the stream originates here, marks the owning local transaction
    /// for brute-force abort.
    fn apply_rollback_fragment(
        &self,
        inner: &mut MutexGuard<'_, Inner>,
        handle: &WsHandle,
        meta: &WsMeta,
    ) -> i32 {
        let routed = inner.streaming.take_applier(meta.server_id, meta.transaction_id);
        let victim = if meta.server_id == self.config.id {
            inner.streaming.find_client(meta.client_id)
        } else {
            None
        };
        MutexGuard::unlocked(inner, || {
            if let Some(svc) = routed {
                let mut svc = svc.lock();
                svc.rollback(handle, meta);
                svc.after_apply();
            }
            if let Some(client) = victim {
                client.bf_abort(meta.gtid.seqno);
            }
        });
        0
    }

    // ── Streaming registries ────────────────────────────────────────────

    /// Register a replicating client whose transaction starts fragmenting.
    pub fn start_streaming_client(&self, client: &Arc<ClientState>) {
        let id = client.id();
        tracing::debug!(%id, "start streaming client");
        let mut inner = self.inner.lock();
        inner.streaming.insert_client(id, client);
    }

    /// Deregister a streaming client whose transaction completed.
    pub fn stop_streaming_client(&self, client: &Arc<ClientState>) {
        let id = client.id();
        tracing::debug!(%id, "stop streaming client");
        let mut inner = self.inner.lock();
        inner.streaming.remove_client(id);
    }

    /// A local streaming client disconnected mid-flight; a stand-in applier
    /// takes over its fragments so a remote rollback or commit can still
    /// complete them.
    pub fn convert_streaming_client_to_applier(&self, client: &Arc<ClientState>) {
        let id = client.id();
        let transaction_id = client.transaction_id();
        tracing::debug!(%id, %transaction_id, "converting streaming client to applier");
        let svc = self.server_service.streaming_applier_service();
        let mut inner = self.inner.lock();
        inner.streaming.remove_client(id);
        inner
            .streaming
            .insert_applier(self.config.id, transaction_id, svc);
    }

    /// Register a stand-in applier for a remote-origin stream.
    pub fn start_streaming_applier(
        &self,
        server_id: ServerId,
        transaction_id: TransactionId,
        applier: SharedApplier,
    ) {
        let mut inner = self.inner.lock();
        inner.streaming.insert_applier(server_id, transaction_id, applier);
    }

    pub fn stop_streaming_applier(&self, server_id: ServerId, transaction_id: TransactionId) {
        let mut inner = self.inner.lock();
        inner.streaming.remove_applier(server_id, transaction_id);
    }

    pub fn find_streaming_applier(
        &self,
        server_id: ServerId,
        transaction_id: TransactionId,
    ) -> Option<SharedApplier> {
        let inner = self.inner.lock();
        inner.streaming.find_applier(server_id, transaction_id)
    }

    pub fn streaming_applier_count(&self) -> usize {
        self.inner.lock().streaming.applier_count()
    }

    // ── Internal ────────────────────────────────────────────────────────

    /// Apply one lifecycle transition. The history append and the condvar
    /// broadcast happen atomically under the mutex: a waiter that sees state
    /// S sees the history ending in S.
    fn shift(&self, inner: &mut Inner, to: ServerStatus) {
        let from = inner.state;
        if !transition_allowed(from, to) {
            panic!("server_state: Unallowed state transition: {from} -> {to}");
        }
        tracing::info!(%from, %to, server = %self.config.name, "server state change");
        self.server_service.log_state_change(from, to);
        inner.state = to;
        inner.state_hist.push(to);
        self.cond.notify_all();
    }

    /// Close streams whose origin server left the primary component. The
    /// delivering applier performs the ordered rollback; registry handles
    /// are dropped (the embedder owns the applier objects).
    fn close_foreign_streams(
        &self,
        inner: &mut Inner,
        view: &View,
        applier: &mut dyn HighPriorityService,
    ) {
        let closed = inner
            .streaming
            .drain_foreign_appliers(|sid| view.is_member(sid));
        for ((server_id, transaction_id), _svc) in closed {
            tracing::info!(%server_id, %transaction_id, "closing stream from departed server");
            let meta = WsMeta {
                server_id,
                transaction_id,
                flags: WsFlags::rollback_fragment(),
                ..WsMeta::default()
            };
            applier.rollback(&WsHandle::new(transaction_id), &meta);
            applier.after_apply();
        }
    }

    /// Close every open stream and abort local streaming transactions when
    /// leaving the group.
    fn close_transactions_at_disconnect(
        &self,
        inner: &mut MutexGuard<'_, Inner>,
        applier: &mut dyn HighPriorityService,
    ) {
        let (clients, appliers) = inner.streaming.drain_all();
        for ((server_id, transaction_id), _svc) in appliers {
            tracing::debug!(%server_id, %transaction_id, "rolling back stream at disconnect");
            let meta = WsMeta {
                server_id,
                transaction_id,
                flags: WsFlags::rollback_fragment(),
                ..WsMeta::default()
            };
            applier.rollback(&WsHandle::new(transaction_id), &meta);
            applier.after_apply();
        }
        // victims take the client mutex; signal them outside the server
        // mutex to keep the client-before-server lock order
        MutexGuard::unlocked(inner, || {
            for client in clients {
                client.bf_abort(Seqno::UNDEFINED);
            }
        });
    }
}
