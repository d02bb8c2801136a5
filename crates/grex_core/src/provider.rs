//! Facade over the group-communication provider.
//!
//! The provider owns certification, total ordering, and delivery; the core
//! only calls through this trait. Calls are blocking: the provider returns
//! when the operation has completed or failed. Statuses that are part of the
//! replication protocol (certification verdicts, BF aborts) are returned
//! verbatim as [`ProviderStatus`]; infrastructure failures surface as
//! [`Error`].

use grex_common::{
    ClientId, Error, Gtid, Key, ProviderStatus, Seqno, StatusVariable, WsFlags, WsHandle, WsMeta,
};

pub trait Provider: Send + Sync {
    /// Join the group. Membership is confirmed asynchronously through
    /// `ServerState::on_view` on a provider thread.
    fn connect(
        &self,
        cluster_name: &str,
        cluster_address: &str,
        cluster_donor: &str,
        bootstrap: bool,
    ) -> Result<(), Error>;

    /// Leave the group. The final view is delivered before the provider
    /// stops its threads.
    fn disconnect(&self) -> Result<(), Error>;

    /// Certify a write set. The verdict is part of the protocol and is
    /// returned verbatim.
    fn certify(
        &self,
        client_id: ClientId,
        handle: &mut WsHandle,
        flags: WsFlags,
        meta: &mut WsMeta,
    ) -> ProviderStatus;

    /// Enter the commit-order critical section for a certified write set.
    fn commit_order_enter(&self, handle: &WsHandle, meta: &WsMeta) -> ProviderStatus;

    fn commit_order_leave(&self, handle: &WsHandle, meta: &WsMeta) -> ProviderStatus;

    /// Release provider resources attached to a write-set handle.
    fn release(&self, handle: &mut WsHandle) -> ProviderStatus;

    /// Replay a brute-force-aborted transaction in applier context.
    fn replay(&self, handle: &WsHandle, applier_id: ClientId) -> ProviderStatus;

    /// Serialize an operation cluster-wide before execution. On success the
    /// returned meta carries the operation's ordering position.
    fn enter_toi(
        &self,
        client_id: ClientId,
        keys: &[Key],
        buffer: &[u8],
        flags: WsFlags,
    ) -> Result<WsMeta, Error>;

    fn leave_toi(&self, client_id: ClientId) -> Result<(), Error>;

    /// Stop applying remote write sets; the node falls behind deliberately.
    fn desync(&self) -> Result<(), Error>;

    fn resync(&self) -> Result<(), Error>;

    /// Pause delivery entirely. Returns the seqno of the last write set
    /// ordered before the pause point.
    fn pause(&self) -> Result<Seqno, Error>;

    fn resume(&self) -> Result<(), Error>;

    /// Block until all write sets up to `gtid` have been committed locally.
    /// Returns `Error::Timeout` after `timeout_secs`.
    fn wait_for_gtid(&self, gtid: Gtid, timeout_secs: i32) -> Result<(), Error>;

    /// Cluster-wide causal read barrier. Heavier than `wait_for_gtid`; may
    /// communicate with other nodes. Returns the position reached.
    fn causal_read(&self, timeout_secs: i32) -> Result<Gtid, Error>;

    /// Donor-side SST completion report.
    fn sst_sent(&self, gtid: Gtid, error: i32) -> Result<(), Error>;

    /// Joiner-side SST completion report.
    fn sst_received(&self, gtid: Gtid, error: i32) -> Result<(), Error>;

    /// Enumerate provider status variables for monitoring.
    fn status_variables(&self) -> Vec<StatusVariable>;
}
