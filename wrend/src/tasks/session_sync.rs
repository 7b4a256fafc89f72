// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Session synchronization: converge local tunnel, firewall and BIRD state
//! against the control plane's desired session list.

use crate::config::Config;
use crate::log::{dbg, inf, wrn};
use crate::metrics::Metrics;
use crate::state::SessionMap;
use anyhow::Context;
use bird::config::{ConfigGenerator, PeerParams};
use bird::Pool;
use cp_client::types::{PeeringSession, SessionStatus};
use cp_client::CpClient;
use netsys::firewall::FirewallExecutor;
use netsys::wireguard::WgExecutor;
use slog::Logger;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const UNIT: &str = "session-sync";
const DEFAULT_MTU: u32 = 1420;

pub struct SessionSync {
    config: Arc<Config>,
    cp: Arc<CpClient>,
    pool: Arc<Pool>,
    generator: Arc<ConfigGenerator>,
    wg: Arc<WgExecutor>,
    firewall: Arc<FirewallExecutor>,
    sessions: Arc<SessionMap>,
    metrics: Arc<Metrics>,
    log: Logger,
}

impl SessionSync {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        cp: Arc<CpClient>,
        pool: Arc<Pool>,
        generator: Arc<ConfigGenerator>,
        wg: Arc<WgExecutor>,
        firewall: Arc<FirewallExecutor>,
        sessions: Arc<SessionMap>,
        metrics: Arc<Metrics>,
        log: Logger,
    ) -> Self {
        Self {
            config,
            cp,
            pool,
            generator,
            wg,
            firewall,
            sessions,
            metrics,
            log,
        }
    }

    /// Periodic loop. `nudge` lets the local API request an immediate
    /// iteration between ticks.
    pub async fn run(self, cancel: CancellationToken, nudge: Arc<Notify>) {
        let mut ticker = interval(Duration::from_secs(
            self.config.control_plane.sync_interval,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    inf!(self.log, UNIT, "task stopped");
                    return;
                }
                _ = ticker.tick() => {}
                _ = nudge.notified() => {
                    inf!(self.log, UNIT, "manual sync requested");
                }
            }
            match self.sync(&cancel).await {
                Ok(()) => self.metrics.record_session_sync(),
                Err(e) => wrn!(self.log, UNIT, "sync failed: {e:#}"),
            }
        }
    }

    async fn sync(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let fetched = self.cp.fetch_sessions(cancel).await;
        self.metrics.record_cp_request(fetched.is_ok());
        let fetched = fetched.context("failed to fetch sessions")?;
        inf!(
            self.log,
            UNIT,
            "received {} sessions from control plane",
            fetched.len()
        );

        let remote: HashMap<Uuid, PeeringSession> =
            fetched.iter().map(|s| (s.uuid, s.clone())).collect();

        let mut errored = 0u64;
        for session in &fetched {
            if cancel.is_cancelled() {
                anyhow::bail!("cancelled");
            }
            if let Err(e) = self.process(session, cancel).await {
                errored += 1;
                wrn!(
                    self.log,
                    UNIT,
                    "failed to process session {} (AS{}): {e:#}",
                    session.uuid,
                    session.asn
                );
            }
        }

        // Anything still present locally but gone upstream is torn down.
        let local = self.sessions.snapshot();
        for (uuid, stale) in &local {
            if !remote.contains_key(uuid) {
                inf!(
                    self.log,
                    UNIT,
                    "session {} (AS{}) removed upstream, cleaning up",
                    uuid,
                    stale.asn
                );
                self.teardown(stale).await;
            }
        }

        let active = fetched
            .iter()
            .filter(|s| matches!(s.status(), Ok(SessionStatus::Active)))
            .count() as u64;
        self.metrics
            .set_session_counts(remote.len() as u64, active, errored);
        self.sessions.replace(remote);
        Ok(())
    }

    async fn process(
        &self,
        session: &PeeringSession,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let status = match session.status() {
            Ok(status) => status,
            Err(raw) => {
                wrn!(
                    self.log,
                    UNIT,
                    "unknown status {raw} for session {}",
                    session.uuid
                );
                return Ok(());
            }
        };
        match status {
            SessionStatus::QueuedForSetup | SessionStatus::Problem => {
                self.converge(session, cancel).await
            }
            SessionStatus::Active => {
                self.verify(session);
                Ok(())
            }
            SessionStatus::QueuedForDelete => {
                inf!(
                    self.log,
                    UNIT,
                    "deleting session AS{} ({})",
                    session.asn,
                    session.name
                );
                self.teardown(session).await;
                self.cp
                    .report_modify(session.uuid, "deleted", None, cancel)
                    .await
                    .context("failed to report deletion")?;
                Ok(())
            }
            // Same cleanup as delete, but the control plane is not told;
            // the session stays disabled until an operator acts.
            SessionStatus::Disabled => {
                inf!(
                    self.log,
                    UNIT,
                    "cleaning up disabled session AS{}",
                    session.asn
                );
                self.teardown(session).await;
                Ok(())
            }
            SessionStatus::PendingApproval => Ok(()),
            SessionStatus::Deleted | SessionStatus::Teardown => {
                dbg!(
                    self.log,
                    UNIT,
                    "ignoring session {} with status {:?}",
                    session.uuid,
                    status
                );
                Ok(())
            }
        }
    }

    /// Run the setup path and report the outcome: `active` on success,
    /// `problem` with the error string otherwise.
    async fn converge(
        &self,
        session: &PeeringSession,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        inf!(
            self.log,
            UNIT,
            "setting up session AS{} ({})",
            session.asn,
            session.name
        );
        match self.setup(session).await {
            Ok(()) => {
                self.cp
                    .report_modify(session.uuid, "active", None, cancel)
                    .await
                    .context("failed to report status")?;
                inf!(self.log, UNIT, "session AS{} setup complete", session.asn);
                Ok(())
            }
            Err(e) => {
                let reason = format!("{e:#}");
                wrn!(
                    self.log,
                    UNIT,
                    "setup for AS{} failed: {reason}",
                    session.asn
                );
                self.cp
                    .report_modify(
                        session.uuid,
                        "problem",
                        Some(&reason),
                        cancel,
                    )
                    .await
                    .context("failed to report problem")?;
                Ok(())
            }
        }
    }

    async fn setup(&self, session: &PeeringSession) -> anyhow::Result<()> {
        if session.kind == "wireguard" && !session.credential.is_empty() {
            if session.interface.is_empty() {
                anyhow::bail!("session has no interface name");
            }
            let mut allowed = Vec::new();
            if !session.ipv4.is_empty() {
                allowed.push(format!("{}/32", session.ipv4));
            }
            if !session.ipv6.is_empty() {
                allowed.push(format!("{}/128", session.ipv6));
            }
            if !session.ipv6_link_local.is_empty() {
                allowed.push(format!("{}/128", session.ipv6_link_local));
            }
            let endpoint =
                (!session.endpoint.is_empty()).then_some(session.endpoint.as_str());

            self.wg
                .create_interface(
                    &session.interface,
                    Some(session.listen_port()),
                    &session.credential,
                    endpoint,
                    &allowed,
                    self.config.wireguard.persistent_keepalive_interval,
                )
                .await
                .context("failed to create tunnel interface")?;

            let mtu = if session.mtu == 0 {
                DEFAULT_MTU
            } else {
                session.mtu
            };
            if let Err(e) = self.wg.set_mtu(&session.interface, mtu).await {
                wrn!(
                    self.log,
                    UNIT,
                    "failed to set mtu on {}: {e}",
                    session.interface
                );
            }

            self.firewall
                .allow_port(session.listen_port())
                .await
                .context("failed to open listen port")?;
        }

        self.generator
            .write_peer(&peer_params(session))
            .context("failed to render peer config")?;

        if let Err(e) = self.pool.configure().await {
            wrn!(self.log, UNIT, "BIRD reconfigure failed: {e}");
        }
        Ok(())
    }

    /// Best-effort check for sessions the control plane believes are up.
    fn verify(&self, session: &PeeringSession) {
        if session.kind == "wireguard"
            && !session.interface.is_empty()
            && !self.wg.interface_exists(&session.interface)
        {
            dbg!(
                self.log,
                UNIT,
                "active session AS{} has no interface {}",
                session.asn,
                session.interface
            );
        }
    }

    /// Remove every artifact the session owns. Per-step failures are logged
    /// and the remaining steps still run; the next tick reconciles.
    async fn teardown(&self, session: &PeeringSession) {
        if let Err(e) = self.generator.remove_peer(session.asn) {
            wrn!(
                self.log,
                UNIT,
                "failed to remove peer config for AS{}: {e}",
                session.asn
            );
        }
        if let Err(e) = self.pool.configure().await {
            wrn!(self.log, UNIT, "BIRD reconfigure failed: {e}");
        }
        if session.kind == "wireguard" && !session.interface.is_empty() {
            if let Err(e) =
                self.wg.delete_interface(&session.interface).await
            {
                wrn!(
                    self.log,
                    UNIT,
                    "failed to delete interface {}: {e}",
                    session.interface
                );
            }
        }
        if let Err(e) =
            self.firewall.remove_port(session.listen_port()).await
        {
            wrn!(
                self.log,
                UNIT,
                "failed to close port {}: {e}",
                session.listen_port()
            );
        }
    }
}

fn peer_params(session: &PeeringSession) -> PeerParams {
    PeerParams {
        asn: session.asn,
        description: if session.name.is_empty() {
            session.description.clone()
        } else {
            session.name.clone()
        },
        interface: session.interface.clone(),
        ipv4: session.ipv4.clone(),
        ipv6: session.ipv6.clone(),
        ipv6_link_local: session.ipv6_link_local.clone(),
        extensions: session.extensions.clone(),
        policy: session.policy.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_params_prefer_display_name() {
        let session: PeeringSession =
            serde_json::from_value(serde_json::json!({
                "uuid": "b4b2d3a0-6a0f-4f3e-9f6a-5b1d2c3e4f50",
                "asn": 4242420123u32,
                "name": "PEER",
                "description": "longer text",
                "status": 4,
                "interface": "wg_u1",
                "ipv6LinkLocal": "fe80::1",
            }))
            .unwrap();
        let params = peer_params(&session);
        assert_eq!(params.description, "PEER");
        assert_eq!(params.interface, "wg_u1");
        assert_eq!(params.ipv6_link_local, "fe80::1");
    }
}
