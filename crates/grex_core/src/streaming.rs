//! Registries for in-flight streaming transactions.
//!
//! Two indexes bridge fragment producers and consumers:
//!
//! - streaming clients: local replicating sessions whose transaction is
//!   fragmenting, keyed by client id;
//! - streaming appliers: high-priority services impersonating a remote
//!   streaming transaction, keyed by `(origin server, origin transaction)`.
//!
//! Neither map owns its entries. Client entries are weak; applier handles
//! are shared with the embedder, which controls their lifetime. All access
//! goes through the server state and happens under the server mutex.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use grex_common::{ClientId, ServerId, TransactionId};

use crate::client_state::ClientState;
use crate::service::SharedApplier;

#[derive(Default)]
pub(crate) struct StreamingRegistry {
    clients: HashMap<ClientId, Weak<ClientState>>,
    appliers: HashMap<(ServerId, TransactionId), SharedApplier>,
}

impl StreamingRegistry {
    pub(crate) fn insert_client(&mut self, id: ClientId, client: &Arc<ClientState>) {
        if self.clients.insert(id, Arc::downgrade(client)).is_some() {
            panic!("server_state: duplicate streaming client: {id}");
        }
    }

    pub(crate) fn remove_client(&mut self, id: ClientId) {
        if self.clients.remove(&id).is_none() {
            panic!("server_state: unknown streaming client: {id}");
        }
    }

    pub(crate) fn find_client(&self, id: ClientId) -> Option<Arc<ClientState>> {
        self.clients.get(&id).and_then(Weak::upgrade)
    }

    pub(crate) fn insert_applier(
        &mut self,
        server_id: ServerId,
        transaction_id: TransactionId,
        applier: SharedApplier,
    ) {
        if self
            .appliers
            .insert((server_id, transaction_id), applier)
            .is_some()
        {
            panic!("server_state: duplicate streaming applier: ({server_id}, {transaction_id})");
        }
    }

    pub(crate) fn remove_applier(&mut self, server_id: ServerId, transaction_id: TransactionId) {
        if self.appliers.remove(&(server_id, transaction_id)).is_none() {
            panic!("server_state: unknown streaming applier: ({server_id}, {transaction_id})");
        }
    }

    pub(crate) fn take_applier(
        &mut self,
        server_id: ServerId,
        transaction_id: TransactionId,
    ) -> Option<SharedApplier> {
        self.appliers.remove(&(server_id, transaction_id))
    }

    pub(crate) fn find_applier(
        &self,
        server_id: ServerId,
        transaction_id: TransactionId,
    ) -> Option<SharedApplier> {
        self.appliers.get(&(server_id, transaction_id)).cloned()
    }

    pub(crate) fn applier_count(&self) -> usize {
        self.appliers.len()
    }

    /// Remove every applier whose origin server is not in `retain`, returning
    /// the removed entries for closure.
    pub(crate) fn drain_foreign_appliers(
        &mut self,
        retain: impl Fn(ServerId) -> bool,
    ) -> Vec<((ServerId, TransactionId), SharedApplier)> {
        let foreign: Vec<(ServerId, TransactionId)> = self
            .appliers
            .keys()
            .filter(|(sid, _)| !retain(*sid))
            .copied()
            .collect();
        foreign
            .into_iter()
            .map(|key| {
                let svc = self.appliers.remove(&key).expect("key collected above");
                (key, svc)
            })
            .collect()
    }

    /// Remove all entries, returning live clients and all appliers.
    pub(crate) fn drain_all(
        &mut self,
    ) -> (
        Vec<Arc<ClientState>>,
        Vec<((ServerId, TransactionId), SharedApplier)>,
    ) {
        let clients = self
            .clients
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        let appliers = self.appliers.drain().collect();
        (clients, appliers)
    }
}
