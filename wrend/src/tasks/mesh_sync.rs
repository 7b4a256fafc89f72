// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mesh tunnel sync: converge one WireGuard interface per remote mesh node
//! and publish the peer map to dependent tasks.

use crate::config::Config;
use crate::log::{inf, wrn};
use crate::state::{MeshMap, MeshState};
use anyhow::Context;
use chrono::Utc;
use cp_client::types::{MeshPeer, MeshStatusReport};
use cp_client::CpClient;
use netsys::wireguard::WgExecutor;
use slog::Logger;
use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use wren_common::lock;

const UNIT: &str = "mesh-sync";
const PERIOD: Duration = Duration::from_secs(120);
const DEFAULT_MTU: u32 = 1420;
const MESH_PORT_BASE: u16 = 51820;

/// Allowed-IPs broad enough for IGP traffic: all IPv4, the DN42 ULA block,
/// and link-local.
const MESH_ALLOWED_IPS: [&str; 3] = ["0.0.0.0/0", "fd00::/8", "fe80::/64"];

pub fn mesh_ifname(node_id: u8) -> String {
    format!("dn42-wg-igp-{node_id}")
}

pub struct MeshSync {
    config: Arc<Config>,
    cp: Arc<CpClient>,
    wg: Arc<WgExecutor>,
    mesh: Arc<MeshState>,
    /// Previous desired map, kept privately: the shared mesh state is also
    /// written by bird-config-sync and cannot anchor stale-tunnel deletion.
    prev: Mutex<MeshMap>,
    log: Logger,
}

impl MeshSync {
    pub fn new(
        config: Arc<Config>,
        cp: Arc<CpClient>,
        wg: Arc<WgExecutor>,
        mesh: Arc<MeshState>,
        log: Logger,
    ) -> Self {
        Self {
            config,
            cp,
            wg,
            mesh,
            prev: Mutex::new(MeshMap::new()),
            log,
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    inf!(self.log, UNIT, "task stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sync(&cancel).await {
                wrn!(self.log, UNIT, "sync failed: {e:#}");
            }
        }
    }

    async fn sync(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mesh_config = self
            .cp
            .fetch_mesh(cancel)
            .await
            .context("failed to fetch mesh config")?;
        inf!(
            self.log,
            UNIT,
            "received {} peers from control plane",
            mesh_config.peers.len()
        );

        let local_id = mesh_config.local_node_id;
        let mut desired = MeshMap::new();
        let mut outcomes: BTreeMap<u8, String> = BTreeMap::new();

        for peer in &mesh_config.peers {
            desired.insert(peer.node_id, peer.clone());
            if peer.node_id == local_id {
                continue;
            }
            match self.ensure_tunnel(peer).await {
                Ok(()) => {
                    outcomes.insert(peer.node_id, "configured".to_string());
                }
                Err(e) => {
                    wrn!(
                        self.log,
                        UNIT,
                        "failed to configure tunnel to {}: {e:#}",
                        peer.node_name
                    );
                    outcomes.insert(peer.node_id, format!("error: {e:#}"));
                }
            }
        }

        // Tear down tunnels for nodes that left the mesh.
        let stale: Vec<(u8, String)> = {
            let prev = lock!(self.prev);
            prev.values()
                .filter(|p| {
                    p.node_id != local_id && !desired.contains_key(&p.node_id)
                })
                .map(|p| (p.node_id, p.node_name.clone()))
                .collect()
        };
        for (node_id, name) in stale {
            inf!(self.log, UNIT, "removing stale tunnel to {name}");
            if let Err(e) =
                self.wg.delete_interface(&mesh_ifname(node_id)).await
            {
                wrn!(
                    self.log,
                    UNIT,
                    "failed to delete {}: {e}",
                    mesh_ifname(node_id)
                );
            }
        }

        *lock!(self.prev) = desired.clone();
        self.mesh.replace(desired);

        // Non-blocking follow-up send; a slow control plane must not stall
        // the reconciliation loop.
        if !outcomes.is_empty() {
            let this = self.clone();
            let cancel = cancel.clone();
            let report = MeshStatusReport {
                node_id: this.config.node.name.clone(),
                timestamp: Utc::now().timestamp(),
                peers: outcomes,
            };
            tokio::spawn(async move {
                if let Err(e) =
                    this.cp.send_mesh_status(&report, &cancel).await
                {
                    wrn!(this.log, UNIT, "failed to report status: {e}");
                }
            });
        }
        Ok(())
    }

    async fn ensure_tunnel(&self, peer: &MeshPeer) -> anyhow::Result<()> {
        if peer.public_key.is_empty() {
            anyhow::bail!("peer has no public key");
        }
        let ifname = mesh_ifname(peer.node_id);
        let allowed: Vec<String> =
            MESH_ALLOWED_IPS.iter().map(|s| s.to_string()).collect();
        let listen_port = MESH_PORT_BASE + peer.node_id as u16;
        let endpoint =
            (!peer.endpoint.is_empty()).then_some(peer.endpoint.as_str());

        self.wg
            .create_interface(
                &ifname,
                Some(listen_port),
                &peer.public_key,
                endpoint,
                &allowed,
                self.config.wireguard.persistent_keepalive_interval,
            )
            .await
            .context("failed to create interface")?;

        let mtu = if peer.mtu == 0 { DEFAULT_MTU } else { peer.mtu };
        if let Err(e) = self.wg.set_mtu(&ifname, mtu).await {
            wrn!(self.log, UNIT, "failed to set mtu for {ifname}: {e}");
        }

        // Babel speaks over link-local; derive ours from the node loopback.
        if let Some(lla) =
            derive_link_local(&self.config.wireguard.dn42_ipv6)
        {
            if let Err(e) = self.wg.add_address(&ifname, &lla).await {
                wrn!(
                    self.log,
                    UNIT,
                    "failed to add link-local address to {ifname}: {e}"
                );
            }
        }

        inf!(
            self.log,
            UNIT,
            "configured tunnel to {} ({})",
            peer.node_name,
            peer.endpoint
        );
        Ok(())
    }
}

/// Derive the mesh link-local address from the node loopback: segments 3
/// and 4 of `fd00:....:R:I::1` carry over into `fe80:R:I::1/64`.
fn derive_link_local(loopback: &str) -> Option<String> {
    let bare = loopback.split('/').next()?;
    let addr: Ipv6Addr = bare.parse().ok()?;
    let segments = addr.segments();
    Some(format!(
        "fe80:{:x}:{:x}::1/64",
        segments[3], segments[4]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_local_derivation_carries_region_and_index() {
        assert_eq!(
            derive_link_local("fd00:4242:7777:302:1::1").as_deref(),
            Some("fe80:302:1::1/64")
        );
        assert_eq!(
            derive_link_local("fd00:4242:7777:101:4::1/128").as_deref(),
            Some("fe80:101:4::1/64")
        );
        assert_eq!(derive_link_local("not-an-address"), None);
        assert_eq!(derive_link_local(""), None);
    }

    #[test]
    fn mesh_interface_names_are_deterministic() {
        assert_eq!(mesh_ifname(2), "dn42-wg-igp-2");
        assert_eq!(mesh_ifname(62), "dn42-wg-igp-62");
    }
}
