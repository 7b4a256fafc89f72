// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! iBGP topology sync: render one fragment per remote mesh node and prune
//! fragments for nodes that left the mesh.

use crate::config::Config;
use crate::log::{dbg, inf, wrn};
use crate::state::{MeshState, PolicyState};
use bird::config::{ConfigGenerator, IbgpParams};
use bird::Pool;
use slog::Logger;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const UNIT: &str = "ibgp";
const PERIOD: Duration = Duration::from_secs(120);

pub struct IbgpSync {
    config: Arc<Config>,
    pool: Arc<Pool>,
    generator: Arc<ConfigGenerator>,
    mesh: Arc<MeshState>,
    policy: Arc<PolicyState>,
    log: Logger,
}

impl IbgpSync {
    pub fn new(
        config: Arc<Config>,
        pool: Arc<Pool>,
        generator: Arc<ConfigGenerator>,
        mesh: Arc<MeshState>,
        policy: Arc<PolicyState>,
        log: Logger,
    ) -> Self {
        Self {
            config,
            pool,
            generator,
            mesh,
            policy,
            log,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
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
            if let Err(e) = self.sync().await {
                wrn!(self.log, UNIT, "sync failed: {e:#}");
            }
        }
    }

    async fn sync(&self) -> anyhow::Result<()> {
        let peers = self.mesh.snapshot();
        if peers.is_empty() {
            dbg!(self.log, UNIT, "no peers to configure");
            return Ok(());
        }

        let local_asn = self.policy.asn();
        if local_asn == 0 {
            dbg!(self.log, UNIT, "backbone asn not yet known, skipping");
            return Ok(());
        }

        let local_id = self.config.node.id;
        // Prefer the mesh's own record of us; fall back to the naming
        // convention used for reflector nodes.
        let local_is_rr = peers
            .get(&local_id)
            .map(|p| p.is_rr)
            .unwrap_or_else(|| {
                self.config.node.name.to_lowercase().contains("-rr")
            });

        let mut changed = false;
        let mut current = BTreeSet::new();
        let mut rendered = 0usize;
        for (id, peer) in &peers {
            if *id == local_id {
                continue;
            }
            current.insert(*id);
            let params = IbgpParams {
                node_id: *id,
                node_name: peer.node_name.clone(),
                loopback_ipv6: peer.loopback_ipv6.clone(),
                local_asn,
                rr_client: local_is_rr && !peer.is_rr,
            };
            match self.generator.write_ibgp(&params) {
                Ok(_) => {
                    changed = true;
                    rendered += 1;
                }
                Err(e) => {
                    wrn!(
                        self.log,
                        UNIT,
                        "failed to render fragment for {}: {e}",
                        peer.node_name
                    );
                }
            }
        }

        match self.generator.cleanup_stale(&current) {
            Ok(removed) if !removed.is_empty() => changed = true,
            Ok(_) => {}
            Err(e) => wrn!(self.log, UNIT, "cleanup failed: {e}"),
        }

        if changed {
            if let Err(e) = self.pool.configure().await {
                wrn!(self.log, UNIT, "BIRD reconfigure failed: {e}");
            } else {
                inf!(self.log, UNIT, "configured {rendered} ibgp peers");
            }
        }
        Ok(())
    }
}
