// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared in-memory state, owned by the supervisor and injected into tasks.
//!
//! Readers take the read lock; writers replace whole maps under the write
//! lock. The mesh map additionally fans out to subscribers, invoked after
//! the write lock is dropped so a subscriber may read state freely.

use cp_client::types::{MeshPeer, PeeringSession};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};
use uuid::Uuid;
use wren_common::{lock, read_lock, write_lock};

/// UUID -> desired peering record, as last pulled from the control plane.
#[derive(Default)]
pub struct SessionMap {
    inner: RwLock<HashMap<Uuid, PeeringSession>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashMap<Uuid, PeeringSession> {
        read_lock!(self.inner).clone()
    }

    pub fn replace(&self, sessions: HashMap<Uuid, PeeringSession>) {
        *write_lock!(self.inner) = sessions;
    }

    pub fn len(&self) -> usize {
        read_lock!(self.inner).len()
    }
}

pub type MeshMap = HashMap<u8, MeshPeer>;

type MeshCallback = Box<dyn Fn(&MeshMap) + Send + Sync>;

/// node-id -> mesh peer record, plus the fan-out channel dependent tasks
/// hang off of.
#[derive(Default)]
pub struct MeshState {
    inner: RwLock<MeshMap>,
    subscribers: Mutex<Vec<MeshCallback>>,
}

impl MeshState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MeshMap {
        read_lock!(self.inner).clone()
    }

    pub fn subscribe(&self, callback: MeshCallback) {
        lock!(self.subscribers).push(callback);
    }

    /// Replace the map and notify subscribers. The write lock is released
    /// before any callback runs.
    pub fn replace(&self, peers: MeshMap) {
        {
            *write_lock!(self.inner) = peers.clone();
        }
        for callback in lock!(self.subscribers).iter() {
            callback(&peers);
        }
    }
}

/// Policy facts learned from the bird-config bundle that other tasks need,
/// currently just the backbone ASN.
pub struct PolicyState {
    asn: AtomicU32,
}

impl PolicyState {
    pub fn new(seed_asn: u32) -> Self {
        Self {
            asn: AtomicU32::new(seed_asn),
        }
    }

    pub fn set_asn(&self, asn: u32) {
        if asn != 0 {
            self.asn.store(asn, Ordering::Relaxed);
        }
    }

    pub fn asn(&self) -> u32 {
        self.asn.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn peer(id: u8) -> MeshPeer {
        MeshPeer {
            node_id: id,
            node_name: format!("node{id}"),
            loopback_ipv4: format!("172.22.188.{id}"),
            loopback_ipv6: format!("fd00:4242:7777::{id}"),
            public_key: String::new(),
            endpoint: String::new(),
            mtu: 0,
            is_rr: false,
        }
    }

    #[test]
    fn replace_notifies_subscribers_outside_the_lock() {
        let state = Arc::new(MeshState::new());
        let seen = Arc::new(AtomicUsize::new(0));

        let inner = state.clone();
        let counter = seen.clone();
        state.subscribe(Box::new(move |peers| {
            // Reading from inside the callback must not deadlock, which
            // proves the writer lock is released before fan-out.
            assert_eq!(inner.snapshot().len(), peers.len());
            counter.store(peers.len(), Ordering::SeqCst);
        }));

        let map: MeshMap = [(2u8, peer(2)), (3u8, peer(3))].into();
        state.replace(map);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(state.snapshot().len(), 2);
    }

    #[test]
    fn session_map_replaces_atomically() {
        let sessions = SessionMap::new();
        assert_eq!(sessions.len(), 0);
        let uuid = Uuid::new_v4();
        let record: PeeringSession = serde_json::from_value(serde_json::json!({
            "uuid": uuid,
            "asn": 65000u32,
            "status": 2,
        }))
        .unwrap();
        sessions.replace([(uuid, record)].into());
        assert_eq!(sessions.len(), 1);
        sessions.replace(HashMap::new());
        assert_eq!(sessions.len(), 0);
    }

    #[test]
    fn policy_state_ignores_zero_asn() {
        let policy = PolicyState::new(0);
        policy.set_asn(0);
        assert_eq!(policy.asn(), 0);
        policy.set_asn(4242420998);
        assert_eq!(policy.asn(), 4242420998);
        policy.set_asn(0);
        assert_eq!(policy.asn(), 4242420998);
    }
}
