// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Policy configuration sync: fetch the bird-config bundle, fan the iBGP
//! peer list out through mesh state, and re-render the global fragments
//! whenever the config hash advances.

use crate::log::{dbg, inf, wrn};
use crate::state::{MeshMap, MeshState, PolicyState};
use crate::tasks::sleep_unless_cancelled;
use anyhow::Context;
use bird::config::{
    ColdPotatoParams, CommunitiesParams, ConfigGenerator, FiltersParams,
    IgpParams,
};
use bird::Pool;
use cp_client::types::{BirdConfigBundle, MeshPeer};
use cp_client::CpClient;
use slog::Logger;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use wren_common::lock;

const UNIT: &str = "bird-config";
const PERIOD: Duration = Duration::from_secs(300);
const INITIAL_DELAY: Duration = Duration::from_secs(30);

const DEFAULT_LOOPBACK_RANGE4: &str = "172.22.188.0/26";
const DEFAULT_LOOPBACK_RANGE6: &str = "fd00:4242:7777::/48";

pub struct BirdConfigSync {
    cp: Arc<CpClient>,
    pool: Arc<Pool>,
    generator: Arc<ConfigGenerator>,
    mesh: Arc<MeshState>,
    policy: Arc<PolicyState>,
    last_hash: Mutex<Option<String>>,
    log: Logger,
}

impl BirdConfigSync {
    pub fn new(
        cp: Arc<CpClient>,
        pool: Arc<Pool>,
        generator: Arc<ConfigGenerator>,
        mesh: Arc<MeshState>,
        policy: Arc<PolicyState>,
        log: Logger,
    ) -> Self {
        Self {
            cp,
            pool,
            generator,
            mesh,
            policy,
            last_hash: Mutex::new(None),
            log,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        // Let session and mesh state populate before the first render.
        if !sleep_unless_cancelled(INITIAL_DELAY, &cancel).await {
            inf!(self.log, UNIT, "task stopped");
            return;
        }
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

    async fn sync(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let bundle = self
            .cp
            .fetch_bird_config(cancel)
            .await
            .context("failed to fetch bird config")?;

        self.policy.set_asn(bundle.policy.dn42_as);

        // Fan the iBGP peer list out unconditionally: peers may shift even
        // while the hash is stable.
        let peers: MeshMap = bundle
            .ibgp_peers
            .iter()
            .map(|p| {
                (
                    p.node_id,
                    MeshPeer {
                        node_id: p.node_id,
                        node_name: p.node_name.clone(),
                        loopback_ipv4: p.loopback_ipv4.clone(),
                        loopback_ipv6: p.loopback_ipv6.clone(),
                        public_key: String::new(),
                        endpoint: String::new(),
                        mtu: 0,
                        is_rr: p.is_rr,
                    },
                )
            })
            .collect();
        inf!(self.log, UNIT, "updated ibgp peers: {} peers", peers.len());
        self.mesh.replace(peers);

        {
            let last = lock!(self.last_hash);
            if last.as_deref() == Some(bundle.config_hash.as_str()) {
                dbg!(self.log, UNIT, "config unchanged, skipping render");
                return Ok(());
            }
        }
        inf!(
            self.log,
            UNIT,
            "config changed (hash {}), rendering fragments",
            bundle.config_hash
        );

        self.render(&bundle)?;
        *lock!(self.last_hash) = Some(bundle.config_hash.clone());

        if let Err(e) = self.pool.configure().await {
            wrn!(self.log, UNIT, "BIRD reconfigure failed: {e}");
        } else {
            inf!(self.log, UNIT, "BIRD configuration reloaded");
        }
        Ok(())
    }

    fn render(&self, bundle: &BirdConfigBundle) -> anyhow::Result<()> {
        self.generator
            .write_filters(&FiltersParams {
                node_name: bundle.node.name.clone(),
                node_id: bundle.node.id,
                config_hash: bundle.config_hash.clone(),
                dn42_as: bundle.policy.dn42_as,
                as_path_max_len: bundle.policy.as_path_max_len,
            })
            .context("failed to render filters.conf")?;

        self.generator
            .write_communities(&CommunitiesParams {
                node_name: bundle.node.name.clone(),
                node_id: bundle.node.id,
                region_code: bundle.node.region_code.clone(),
                bandwidth: bundle.node.bandwidth.clone(),
                dn42_as: bundle.policy.dn42_as,
            })
            .context("failed to render moenet_communities.conf")?;

        self.generator
            .write_igp(&IgpParams {
                loopback_range4: bundle
                    .policy
                    .prefixes4
                    .first()
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_LOOPBACK_RANGE4.to_string()),
                loopback_range6: bundle
                    .policy
                    .prefixes6
                    .first()
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_LOOPBACK_RANGE6.to_string()),
            })
            .context("failed to render babel.conf")?;

        // Cold potato preferences need a numeric region; nodes without one
        // simply go without the fragment.
        if let Err(e) = self.generator.write_cold_potato(&ColdPotatoParams {
            dn42_as: bundle.policy.dn42_as,
            region_code: bundle.node.region_code.clone(),
        }) {
            wrn!(self.log, UNIT, "skipping cold_potato.conf: {e}");
        }
        Ok(())
    }
}
