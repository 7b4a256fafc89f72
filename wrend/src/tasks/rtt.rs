// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RTT measurement: TCP-connect probes against the loopback addresses of
//! known mesh peers, batched to the control plane.

use crate::config::Config;
use crate::log::{inf, wrn};
use crate::state::MeshMap;
use chrono::Utc;
use cp_client::types::{RttMeasurement, RttReport};
use cp_client::CpClient;
use slog::Logger;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use wren_common::lock;

const UNIT: &str = "rtt";
const PERIOD: Duration = Duration::from_secs(300);
const PROBE_SPACING: Duration = Duration::from_millis(100);
const PROBE_PORT: u16 = 53;

/// Anycast DNS addresses probed until the mesh peer list is known.
const FALLBACK_TARGETS: [&str; 2] = ["172.20.0.53", "fd42:d42:d42::1"];

/// Mesh peer loopbacks, IPv6 preferred.
pub fn collect_targets(peers: &MeshMap) -> Vec<String> {
    let mut targets = Vec::with_capacity(peers.len());
    for peer in peers.values() {
        if !peer.loopback_ipv6.is_empty() {
            targets.push(peer.loopback_ipv6.clone());
        } else if !peer.loopback_ipv4.is_empty() {
            targets.push(peer.loopback_ipv4.clone());
        }
    }
    targets
}

pub struct Rtt {
    config: Arc<Config>,
    cp: Arc<CpClient>,
    targets: Arc<Mutex<Vec<String>>>,
    results: Mutex<HashMap<String, RttMeasurement>>,
    probe_port: u16,
    log: Logger,
}

impl Rtt {
    pub fn new(config: Arc<Config>, cp: Arc<CpClient>, log: Logger) -> Self {
        Self {
            config,
            cp,
            targets: Arc::new(Mutex::new(Vec::new())),
            results: Mutex::new(HashMap::new()),
            probe_port: PROBE_PORT,
            log,
        }
    }

    /// Shared target list, updated through the mesh-state fan-out.
    pub fn targets(&self) -> Arc<Mutex<Vec<String>>> {
        self.targets.clone()
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
            self.measure_all(&cancel).await;
        }
    }

    async fn measure_all(&self, cancel: &CancellationToken) {
        let mut targets = lock!(self.targets).clone();
        let mesh_count = targets.len();
        if targets.is_empty() {
            targets =
                FALLBACK_TARGETS.iter().map(|t| t.to_string()).collect();
        }

        let count = self.config.metric.ping_count;
        let timeout = Duration::from_secs(self.config.metric.ping_timeout);

        let mut probes = JoinSet::new();
        for target in targets {
            let cancel = cancel.clone();
            let port = self.probe_port;
            probes.spawn(async move {
                measure(target, count, timeout, port, &cancel).await
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = probes.join_next().await {
            if let Ok(Some(sample)) = joined {
                results.insert(sample.target.clone(), sample);
            }
        }
        if cancel.is_cancelled() {
            return;
        }
        inf!(
            self.log,
            UNIT,
            "measured {} targets (mesh={mesh_count})",
            results.len()
        );

        let measurements: Vec<RttMeasurement> =
            results.values().cloned().collect();
        *lock!(self.results) = results;
        if measurements.is_empty() {
            return;
        }

        let report = RttReport {
            measurements,
            timestamp: Utc::now().timestamp(),
        };
        match self.cp.send_rtt(&report, cancel).await {
            Ok(()) => inf!(
                self.log,
                UNIT,
                "reported {} measurements",
                report.measurements.len()
            ),
            Err(e) => {
                wrn!(self.log, UNIT, "failed to report results: {e}")
            }
        }
    }
}

/// Sequential probes against one target, spaced by [`PROBE_SPACING`].
/// Returns None when cancelled mid-measurement.
async fn measure(
    target: String,
    count: u32,
    timeout: Duration,
    port: u16,
    cancel: &CancellationToken,
) -> Option<RttMeasurement> {
    let mut success = 0u32;
    let mut total = Duration::ZERO;
    for i in 0..count {
        if cancel.is_cancelled() {
            return None;
        }
        if let Some(rtt) = tcp_ping(&target, port, timeout, cancel).await {
            success += 1;
            total += rtt;
        }
        if i + 1 < count
            && !super::sleep_unless_cancelled(PROBE_SPACING, cancel).await
        {
            return None;
        }
    }
    Some(summarize(&target, count, success, total))
}

fn summarize(
    target: &str,
    count: u32,
    success: u32,
    total: Duration,
) -> RttMeasurement {
    if success == 0 {
        return RttMeasurement {
            target: target.to_string(),
            rtt_ms: -1.0,
            loss: 100.0,
        };
    }
    RttMeasurement {
        target: target.to_string(),
        rtt_ms: total.as_secs_f64() * 1000.0 / f64::from(success),
        loss: f64::from(count - success) / f64::from(count) * 100.0,
    }
}

async fn tcp_ping(
    target: &str,
    port: u16,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Option<Duration> {
    let start = Instant::now();
    let connect = async {
        match target.parse::<IpAddr>() {
            Ok(ip) => TcpStream::connect((ip, port)).await,
            Err(_) => TcpStream::connect((target, port)).await,
        }
    };
    tokio::select! {
        _ = cancel.cancelled() => None,
        outcome = tokio::time::timeout(timeout, connect) => match outcome {
            Ok(Ok(_stream)) => Some(start.elapsed()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp_client::types::MeshPeer;
    use tokio::net::TcpListener;

    #[test]
    fn summarize_handles_total_loss_and_averaging() {
        let lost = summarize("t", 4, 0, Duration::ZERO);
        assert_eq!(lost.rtt_ms, -1.0);
        assert_eq!(lost.loss, 100.0);

        let half = summarize("t", 4, 2, Duration::from_millis(30));
        assert!((half.rtt_ms - 15.0).abs() < 0.001);
        assert_eq!(half.loss, 50.0);
    }

    #[test]
    fn targets_prefer_ipv6_loopback() {
        let mut peers = MeshMap::new();
        peers.insert(
            2,
            MeshPeer {
                node_id: 2,
                node_name: "a".into(),
                loopback_ipv4: "172.22.188.2".into(),
                loopback_ipv6: "fd00:4242:7777::2".into(),
                public_key: String::new(),
                endpoint: String::new(),
                mtu: 0,
                is_rr: false,
            },
        );
        peers.insert(
            3,
            MeshPeer {
                node_id: 3,
                node_name: "b".into(),
                loopback_ipv4: "172.22.188.3".into(),
                loopback_ipv6: String::new(),
                public_key: String::new(),
                endpoint: String::new(),
                mtu: 0,
                is_rr: false,
            },
        );
        let mut targets = collect_targets(&peers);
        targets.sort();
        assert_eq!(targets, vec!["172.22.188.3", "fd00:4242:7777::2"]);
    }

    #[tokio::test]
    async fn probes_measure_a_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let sample = measure(
            "127.0.0.1".to_string(),
            2,
            Duration::from_secs(1),
            port,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(sample.loss, 0.0);
        assert!(sample.rtt_ms >= 0.0);
    }

    #[tokio::test]
    async fn refused_port_counts_as_loss() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let sample = measure(
            "127.0.0.1".to_string(),
            2,
            Duration::from_millis(500),
            port,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(sample.rtt_ms, -1.0);
        assert_eq!(sample.loss, 100.0);
    }

    #[tokio::test]
    async fn cancellation_aborts_probe_spacing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let sample = measure(
            "127.0.0.1".to_string(),
            4,
            Duration::from_secs(1),
            1,
            &cancel,
        )
        .await;
        assert!(sample.is_none());
    }
}
