//! Streaming registries and write-set application routing.

mod common;

use common::*;
use grex_core::TxnState;

fn meta(
    source: ServerId,
    seqno: i64,
    client: u64,
    txn: u64,
    flags: WsFlags,
) -> WsMeta {
    WsMeta {
        gtid: gtid(source, seqno),
        server_id: source,
        client_id: ClientId(client),
        transaction_id: TransactionId(txn),
        flags,
    }
}

fn open_client(fx: &Fixture, id: u64) -> (Arc<MockClientService>, Arc<ClientState>) {
    let service = MockClientService::new();
    let client = ClientState::new(fx.server.clone(), service.clone(), ClientMode::Replicating);
    client.open(ClientId(id));
    (service, client)
}

#[test]
fn streaming_client_registration_round_trip() {
    let fx = setup(false);
    sync_server(&fx);
    let (_service, client) = open_client(&fx, 10);

    fx.server.start_streaming_client(&client);
    fx.server.stop_streaming_client(&client);
}

#[test]
#[should_panic(expected = "duplicate streaming client")]
fn duplicate_streaming_client_is_fatal() {
    let fx = setup(false);
    sync_server(&fx);
    let (_service, client) = open_client(&fx, 10);

    fx.server.start_streaming_client(&client);
    fx.server.start_streaming_client(&client);
}

#[test]
#[should_panic(expected = "unknown streaming client")]
fn stopping_an_unknown_streaming_client_is_fatal() {
    let fx = setup(false);
    sync_server(&fx);
    let (_service, client) = open_client(&fx, 10);

    fx.server.stop_streaming_client(&client);
}

#[test]
#[should_panic(expected = "duplicate streaming applier")]
fn duplicate_streaming_applier_key_is_fatal() {
    let fx = setup(false);
    let origin = server_id(0xbb);
    let applier: SharedApplier = Arc::new(Mutex::new(MockHighPriorityService::default()));

    fx.server
        .start_streaming_applier(origin, TransactionId(1), applier.clone());
    fx.server
        .start_streaming_applier(origin, TransactionId(1), applier);
}

#[test]
fn foreign_streams_closed_on_new_primary_view() {
    let fx = setup(false);
    sync_server(&fx);
    let a = server_id(0xa);
    let b = server_id(0xb);

    let svc: SharedApplier = Arc::new(Mutex::new(MockHighPriorityService::default()));
    fx.server.start_streaming_applier(a, TransactionId(1), svc.clone());
    fx.server.start_streaming_applier(b, TransactionId(1), svc);

    // b drops out of the primary component
    let mut hps = MockHighPriorityService::default();
    fx.server
        .on_view(primary_view(2, Some(1), &[a, fx.own_id]), &mut hps);

    assert!(fx.server.find_streaming_applier(a, TransactionId(1)).is_some());
    assert!(fx.server.find_streaming_applier(b, TransactionId(1)).is_none());
    assert_eq!(fx.server.streaming_applier_count(), 1);
    // the view-delivering applier performed the ordered rollback
    assert_eq!(hps.rolled_back, vec![TransactionId(1)]);
    assert_eq!(hps.after_applies, 1);
}

#[test]
fn write_sets_below_snapshot_position_are_discarded() {
    let fx = setup(false);
    sync_server(&fx); // snapshot position is seqno 42
    let mut hps = MockHighPriorityService::default();

    let rc = fx.server.on_apply(
        &mut hps,
        &WsHandle::new(TransactionId(5)),
        &meta(server_id(0xaa), 40, 1, 5, WsFlags::complete()),
        b"payload",
    );
    assert_eq!(rc, 0);
    assert!(hps.started.is_empty());
    assert!(hps.committed.is_empty());
}

#[test]
fn complete_write_set_applied_and_committed() {
    let fx = setup(false);
    sync_server(&fx);
    let mut hps = MockHighPriorityService::default();
    let source = server_id(0xaa);

    let rc = fx.server.on_apply(
        &mut hps,
        &WsHandle::new(TransactionId(5)),
        &meta(source, 43, 1, 5, WsFlags::complete()),
        b"payload",
    );
    assert_eq!(rc, 0);
    assert_eq!(hps.started, vec![TransactionId(5)]);
    assert_eq!(hps.applied, vec![(TransactionId(5), 7)]);
    assert_eq!(hps.committed, vec![TransactionId(5)]);
    assert_eq!(hps.after_applies, 1);
    assert_eq!(fx.server.last_committed_gtid(), gtid(source, 43));
}

#[test]
fn failed_apply_rolls_back_and_reports() {
    let fx = setup(false);
    sync_server(&fx);
    let mut hps = MockHighPriorityService {
        fail_apply: true,
        ..MockHighPriorityService::default()
    };
    let source = server_id(0xaa);

    let rc = fx.server.on_apply(
        &mut hps,
        &WsHandle::new(TransactionId(5)),
        &meta(source, 43, 1, 5, WsFlags::complete()),
        b"payload",
    );
    assert_eq!(rc, 1);
    assert_eq!(hps.rolled_back, vec![TransactionId(5)]);
    assert!(hps.committed.is_empty());
    // the failed position must not advance the committed GTID
    assert_eq!(fx.server.last_committed_gtid(), gtid(source, 42));
}

#[test]
fn fragments_are_routed_to_a_stand_in_applier() {
    let fx = setup(false);
    sync_server(&fx);
    let origin = server_id(0xbb);
    let mut hps = MockHighPriorityService::default();

    // first fragment creates the stand-in
    let rc = fx.server.on_apply(
        &mut hps,
        &WsHandle::new(TransactionId(7)),
        &meta(origin, 43, 3, 7, WsFlags::fragment(true)),
        b"frag-1",
    );
    assert_eq!(rc, 0);
    assert!(fx
        .server
        .find_streaming_applier(origin, TransactionId(7))
        .is_some());
    // the delivering applier is not involved in fragment application
    assert!(hps.started.is_empty());
    assert!(hps.applied.is_empty());

    // further fragments reuse it
    let rc = fx.server.on_apply(
        &mut hps,
        &WsHandle::new(TransactionId(7)),
        &meta(origin, 44, 3, 7, WsFlags::fragment(false)),
        b"frag-2",
    );
    assert_eq!(rc, 0);
    assert_eq!(fx.server.streaming_applier_count(), 1);

    // the commit fragment completes the stream and removes the entry
    let rc = fx.server.on_apply(
        &mut hps,
        &WsHandle::new(TransactionId(7)),
        &meta(origin, 45, 3, 7, WsFlags::commit_fragment()),
        b"",
    );
    assert_eq!(rc, 0);
    assert!(fx
        .server
        .find_streaming_applier(origin, TransactionId(7))
        .is_none());
    assert_eq!(fx.server.last_committed_gtid(), gtid(origin, 45));
}

#[test]
fn registered_applier_receives_routed_fragments() {
    let fx = setup(false);
    sync_server(&fx);
    let origin = server_id(0xbb);
    let recorder = Arc::new(Mutex::new(MockHighPriorityService::default()));
    fx.server
        .start_streaming_applier(origin, TransactionId(9), recorder.clone());

    let mut hps = MockHighPriorityService::default();
    let rc = fx.server.on_apply(
        &mut hps,
        &WsHandle::new(TransactionId(9)),
        &meta(origin, 43, 3, 9, WsFlags::fragment(false)),
        b"frag",
    );
    assert_eq!(rc, 0);
    let recorded = recorder.lock();
    assert_eq!(recorded.applied, vec![(TransactionId(9), 4)]);
    // the stand-in was registered explicitly, not started by routing
    assert!(recorded.started.is_empty());
}

#[test]
fn rollback_fragment_closes_applier_and_aborts_local_client() {
    let fx = setup(false);
    sync_server(&fx);

    // a local streaming transaction, and its stand-in registered by the
    // origin side of the stream
    let (_service, client) = open_client(&fx, 3);
    client.before_command();
    client.start_transaction(TransactionId(9));
    fx.server.start_streaming_client(&client);

    let recorder = Arc::new(Mutex::new(MockHighPriorityService::default()));
    fx.server
        .start_streaming_applier(fx.own_id, TransactionId(9), recorder.clone());

    let mut hps = MockHighPriorityService::default();
    let rc = fx.server.on_apply(
        &mut hps,
        &WsHandle::new(TransactionId(9)),
        &meta(fx.own_id, 50, 3, 9, WsFlags::rollback_fragment()),
        b"",
    );
    assert_eq!(rc, 0);
    assert!(fx
        .server
        .find_streaming_applier(fx.own_id, TransactionId(9))
        .is_none());
    assert_eq!(recorder.lock().rolled_back, vec![TransactionId(9)]);
    // the owning session got the brute-force abort signal
    assert_eq!(client.transaction_state(), TxnState::MustAbort);

    fx.server.stop_streaming_client(&client);
}

#[test]
fn rollback_fragment_for_remote_stream_leaves_local_clients_alone() {
    let fx = setup(false);
    sync_server(&fx);
    let origin = server_id(0xbb);

    let (_service, client) = open_client(&fx, 3);
    client.before_command();
    client.start_transaction(TransactionId(9));
    fx.server.start_streaming_client(&client);

    let rc = fx.server.on_apply(
        &mut MockHighPriorityService::default(),
        &WsHandle::new(TransactionId(9)),
        &meta(origin, 50, 3, 9, WsFlags::rollback_fragment()),
        b"",
    );
    assert_eq!(rc, 0);
    assert_eq!(client.transaction_state(), TxnState::Executing);

    fx.server.stop_streaming_client(&client);
}

#[test]
fn convert_streaming_client_to_applier_hands_over_the_stream() {
    let fx = setup(false);
    sync_server(&fx);

    let (_service, client) = open_client(&fx, 3);
    client.before_command();
    client.start_transaction(TransactionId(9));
    fx.server.start_streaming_client(&client);

    fx.server.convert_streaming_client_to_applier(&client);
    assert!(fx
        .server
        .find_streaming_applier(fx.own_id, TransactionId(9))
        .is_some());

    // the remote rollback now completes against the stand-in; the client
    // is no longer registered and stays untouched
    let rc = fx.server.on_apply(
        &mut MockHighPriorityService::default(),
        &WsHandle::new(TransactionId(9)),
        &meta(fx.own_id, 51, 3, 9, WsFlags::rollback_fragment()),
        b"",
    );
    assert_eq!(rc, 0);
    assert!(fx
        .server
        .find_streaming_applier(fx.own_id, TransactionId(9))
        .is_none());
    assert_eq!(client.transaction_state(), TxnState::Executing);
}

#[test]
fn disconnect_view_closes_all_streams() {
    let fx = setup(false);
    sync_server(&fx);
    let origin = server_id(0xbb);

    let (_service, client) = open_client(&fx, 3);
    client.before_command();
    client.start_transaction(TransactionId(9));
    fx.server.start_streaming_client(&client);

    let recorder = Arc::new(Mutex::new(MockHighPriorityService::default()));
    fx.server
        .start_streaming_applier(origin, TransactionId(4), recorder.clone());

    let mut hps = MockHighPriorityService::default();
    fx.server.on_view(
        View::new(
            Gtid::undefined(),
            Seqno(3),
            ViewStatus::NonPrimary,
            Some(0),
            1,
            vec![Member::new(fx.own_id, "node-1", "127.0.0.1:3306")],
        ),
        &mut hps,
    );

    assert_eq!(fx.server.streaming_applier_count(), 0);
    assert_eq!(hps.rolled_back, vec![TransactionId(4)]);
    // the local streaming transaction was brute-force aborted
    assert_eq!(client.transaction_state(), TxnState::MustAbort);
    assert_eq!(fx.server.state(), ServerStatus::Disconnecting);
}
