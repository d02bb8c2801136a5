#![allow(dead_code, unused_imports)]

pub use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
pub use std::sync::Arc;

pub use parking_lot::Mutex;
pub use uuid::Uuid;

pub use grex_core::{
    AfterStatementResult, ClientError, ClientId, ClientMode, ClientService, ClientState,
    ClientStatus, Error, Gtid, HighPriorityService, Key, Member, Provider, ProviderStatus,
    RollbackMode, Seqno, ServerConfig, ServerId, ServerService, ServerState, ServerStatus,
    SharedApplier, StatusVariable, TransactionId, View, ViewStatus, WsFlags, WsHandle, WsMeta,
};

pub fn server_id(n: u128) -> ServerId {
    ServerId(Uuid::from_u128(n))
}

pub fn gtid(source: ServerId, seqno: i64) -> Gtid {
    Gtid::new(source, Seqno(seqno))
}

pub fn primary_view(view_seqno: i64, own_index: Option<usize>, members: &[ServerId]) -> View {
    View::new(
        Gtid::undefined(),
        Seqno(view_seqno),
        ViewStatus::Primary,
        own_index,
        1,
        members
            .iter()
            .map(|id| Member::new(*id, format!("node-{id}"), "127.0.0.1:3306"))
            .collect(),
    )
}

// ── Provider ────────────────────────────────────────────────────────────

/// Records every call so tests can assert the exactly-one-call invariants.
/// Failure injection flags make the next matching call fail once.
#[derive(Default)]
pub struct MockProvider {
    pub connect_calls: AtomicUsize,
    pub disconnect_calls: AtomicUsize,
    pub desync_calls: AtomicUsize,
    pub resync_calls: AtomicUsize,
    pub pause_calls: AtomicUsize,
    pub resume_calls: AtomicUsize,
    pub enter_toi_calls: AtomicUsize,
    pub leave_toi_calls: AtomicUsize,
    pub sst_sent_reports: Mutex<Vec<(Gtid, i32)>>,
    pub sst_received_reports: Mutex<Vec<(Gtid, i32)>>,
    pub pause_seqno: AtomicI64,
    pub fail_next_desync: AtomicBool,
    pub fail_next_pause: AtomicBool,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        let provider = MockProvider::default();
        provider.pause_seqno.store(100, Ordering::SeqCst);
        Arc::new(provider)
    }

    fn take_flag(flag: &AtomicBool) -> bool {
        flag.swap(false, Ordering::SeqCst)
    }
}

impl Provider for MockProvider {
    fn connect(&self, _: &str, _: &str, _: &str, _: bool) -> Result<(), Error> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), Error> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn certify(
        &self,
        _: ClientId,
        _: &mut WsHandle,
        _: WsFlags,
        _: &mut WsMeta,
    ) -> ProviderStatus {
        ProviderStatus::Success
    }

    fn commit_order_enter(&self, _: &WsHandle, _: &WsMeta) -> ProviderStatus {
        ProviderStatus::Success
    }

    fn commit_order_leave(&self, _: &WsHandle, _: &WsMeta) -> ProviderStatus {
        ProviderStatus::Success
    }

    fn release(&self, _: &mut WsHandle) -> ProviderStatus {
        ProviderStatus::Success
    }

    fn replay(&self, _: &WsHandle, _: ClientId) -> ProviderStatus {
        ProviderStatus::Success
    }

    fn enter_toi(
        &self,
        _: ClientId,
        _: &[Key],
        _: &[u8],
        flags: WsFlags,
    ) -> Result<WsMeta, Error> {
        self.enter_toi_calls.fetch_add(1, Ordering::SeqCst);
        Ok(WsMeta {
            gtid: Gtid::new(server_id(0xff), Seqno(1000)),
            flags,
            ..WsMeta::default()
        })
    }

    fn leave_toi(&self, _: ClientId) -> Result<(), Error> {
        self.leave_toi_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn desync(&self) -> Result<(), Error> {
        if Self::take_flag(&self.fail_next_desync) {
            return Err(Error::Provider(ProviderStatus::NotAllowed));
        }
        self.desync_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn resync(&self) -> Result<(), Error> {
        self.resync_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&self) -> Result<Seqno, Error> {
        if Self::take_flag(&self.fail_next_pause) {
            return Err(Error::Provider(ProviderStatus::NotAllowed));
        }
        self.pause_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Seqno(self.pause_seqno.load(Ordering::SeqCst)))
    }

    fn resume(&self) -> Result<(), Error> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn wait_for_gtid(&self, _: Gtid, _: i32) -> Result<(), Error> {
        Ok(())
    }

    fn causal_read(&self, _: i32) -> Result<Gtid, Error> {
        Ok(Gtid::new(server_id(0xff), Seqno(1000)))
    }

    fn sst_sent(&self, gtid: Gtid, error: i32) -> Result<(), Error> {
        self.sst_sent_reports.lock().push((gtid, error));
        Ok(())
    }

    fn sst_received(&self, gtid: Gtid, error: i32) -> Result<(), Error> {
        self.sst_received_reports.lock().push((gtid, error));
        Ok(())
    }

    fn status_variables(&self) -> Vec<StatusVariable> {
        vec![
            StatusVariable::new("cluster_status", "primary"),
            StatusVariable::new("connected", "true"),
        ]
    }
}

// ── Server service ──────────────────────────────────────────────────────

pub struct MockServerService {
    pub sst_before_init: bool,
    pub sst_requests: AtomicUsize,
    pub start_sst_calls: Mutex<Vec<(String, Gtid, bool)>>,
    pub start_sst_result: AtomicI64,
    pub background_rollbacks: AtomicUsize,
    pub state_changes: Mutex<Vec<(ServerStatus, ServerStatus)>>,
    pub views_logged: AtomicUsize,
    pub appliers_recovered: AtomicUsize,
}

impl MockServerService {
    pub fn new(sst_before_init: bool) -> Arc<Self> {
        Arc::new(MockServerService {
            sst_before_init,
            sst_requests: AtomicUsize::new(0),
            start_sst_calls: Mutex::new(Vec::new()),
            start_sst_result: AtomicI64::new(0),
            background_rollbacks: AtomicUsize::new(0),
            state_changes: Mutex::new(Vec::new()),
            views_logged: AtomicUsize::new(0),
            appliers_recovered: AtomicUsize::new(0),
        })
    }
}

impl ServerService for MockServerService {
    fn sst_before_init(&self) -> bool {
        self.sst_before_init
    }

    fn sst_request(&self) -> String {
        self.sst_requests.fetch_add(1, Ordering::SeqCst);
        "mock-sst-request".into()
    }

    fn start_sst(&self, request: &str, gtid: Gtid, bypass: bool) -> i32 {
        self.start_sst_calls
            .lock()
            .push((request.to_string(), gtid, bypass));
        self.start_sst_result.load(Ordering::SeqCst) as i32
    }

    fn background_rollback(&self, client: &ClientState) {
        self.background_rollbacks.fetch_add(1, Ordering::SeqCst);
        // run the rollback inline; a real embedder queues it to a
        // rollbacker thread
        client.background_rollback();
    }

    fn log_state_change(&self, from: ServerStatus, to: ServerStatus) {
        self.state_changes.lock().push((from, to));
    }

    fn log_view(&self, _view: &View) {
        self.views_logged.fetch_add(1, Ordering::SeqCst);
    }

    fn recover_streaming_appliers(&self, _server: &ServerState) {
        self.appliers_recovered.fetch_add(1, Ordering::SeqCst);
    }

    fn streaming_applier_service(&self) -> SharedApplier {
        Arc::new(Mutex::new(MockHighPriorityService::default()))
    }
}

// ── Client service ──────────────────────────────────────────────────────

pub struct MockClientService {
    pub rollbacks: AtomicUsize,
    pub autocommit: AtomicBool,
    pub two_pc: AtomicBool,
    pub replays: AtomicUsize,
    pub aborts: AtomicUsize,
    pub errors: Mutex<Vec<ClientError>>,
}

impl MockClientService {
    pub fn new() -> Arc<Self> {
        Arc::new(MockClientService {
            rollbacks: AtomicUsize::new(0),
            autocommit: AtomicBool::new(false),
            two_pc: AtomicBool::new(false),
            replays: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            errors: Mutex::new(Vec::new()),
        })
    }

    pub fn with_autocommit() -> Arc<Self> {
        let service = Self::new();
        service.autocommit.store(true, Ordering::SeqCst);
        service
    }
}

impl ClientService for MockClientService {
    fn rollback(&self) -> i32 {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        0
    }

    fn is_autocommit(&self) -> bool {
        self.autocommit.load(Ordering::SeqCst)
    }

    fn do_2pc(&self) -> bool {
        self.two_pc.load(Ordering::SeqCst)
    }

    fn will_replay(&self) {}

    fn replay(&self) -> ProviderStatus {
        self.replays.fetch_add(1, Ordering::SeqCst);
        ProviderStatus::Success
    }

    fn wait_for_replayers(&self) {}

    fn prepare_data_for_replication(&self) -> i32 {
        0
    }

    fn prepare_fragment_for_replication(&self, buffer: &mut Vec<u8>) -> i32 {
        buffer.push(1);
        0
    }

    fn debug_sync(&self, _point: &str) {}

    fn killed(&self) -> bool {
        false
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }

    fn store_globals(&self) {}

    fn on_error(&self, error: ClientError) {
        self.errors.lock().push(error);
    }
}

// ── High-priority service ───────────────────────────────────────────────

#[derive(Default)]
pub struct MockHighPriorityService {
    pub started: Vec<TransactionId>,
    pub applied: Vec<(TransactionId, usize)>,
    pub committed: Vec<TransactionId>,
    pub rolled_back: Vec<TransactionId>,
    pub after_applies: usize,
    pub fail_apply: bool,
}

impl HighPriorityService for MockHighPriorityService {
    fn start_transaction(&mut self, _handle: &WsHandle, meta: &WsMeta) {
        self.started.push(meta.transaction_id);
    }

    fn apply_write_set(&mut self, meta: &WsMeta, data: &[u8]) -> i32 {
        if self.fail_apply {
            return 1;
        }
        self.applied.push((meta.transaction_id, data.len()));
        0
    }

    fn commit(&mut self, _handle: &WsHandle, meta: &WsMeta) -> i32 {
        self.committed.push(meta.transaction_id);
        0
    }

    fn rollback(&mut self, _handle: &WsHandle, meta: &WsMeta) -> i32 {
        self.rolled_back.push(meta.transaction_id);
        0
    }

    fn after_apply(&mut self) {
        self.after_applies += 1;
    }
}

// ── Setup helpers ───────────────────────────────────────────────────────

pub fn config(id: ServerId) -> ServerConfig {
    ServerConfig {
        name: "node-1".into(),
        id,
        incoming_address: "127.0.0.1:3306".into(),
        address: "127.0.0.1:4567".into(),
        working_dir: "/tmp/grex".into(),
        initial_position: Gtid::undefined(),
        max_protocol_version: 1,
        rollback_mode: RollbackMode::Async,
    }
}

pub struct Fixture {
    pub server: Arc<ServerState>,
    pub provider: Arc<MockProvider>,
    pub service: Arc<MockServerService>,
    pub own_id: ServerId,
}

/// Server with loaded provider, still disconnected.
pub fn setup(sst_before_init: bool) -> Fixture {
    setup_with_rollback_mode(sst_before_init, RollbackMode::Async)
}

pub fn setup_with_rollback_mode(sst_before_init: bool, rollback_mode: RollbackMode) -> Fixture {
    let own_id = server_id(1);
    let service = MockServerService::new(sst_before_init);
    let mut cfg = config(own_id);
    cfg.rollback_mode = rollback_mode;
    let server = ServerState::new(cfg, service.clone());
    let provider = MockProvider::new();
    server.load_provider(provider.clone());
    Fixture {
        server,
        provider,
        service,
        own_id,
    }
}

/// Drive a server to `Synced` through the snapshot-after-init path.
pub fn sync_server(fx: &Fixture) {
    fx.server.initialized();
    fx.server
        .connect("cluster", "gcomm://", "", false)
        .expect("connect");
    let mut hps = MockHighPriorityService::default();
    fx.server
        .on_view(primary_view(1, Some(0), &[fx.own_id]), &mut hps);
    fx.server.prepare_for_sst();
    fx.server
        .sst_received(gtid(server_id(0xaa), 42), 0)
        .expect("sst_received");
    fx.server.on_sync();
    assert_eq!(fx.server.state(), ServerStatus::Synced);
}
