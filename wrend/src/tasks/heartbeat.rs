// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Heartbeat: node health snapshot pushed to the control plane.

use crate::config::Config;
use crate::log::{dbg, inf, wrn};
use crate::metrics::Metrics;
use chrono::Utc;
use cp_client::types::{HeartbeatReport, HeartbeatStatus};
use cp_client::CpClient;
use slog::Logger;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const UNIT: &str = "heartbeat";

pub struct Heartbeat {
    config: Arc<Config>,
    cp: Arc<CpClient>,
    metrics: Arc<Metrics>,
    version: String,
    /// Kernel release string, read once at startup.
    kernel: String,
    mesh_public_key: String,
    detector: reqwest::Client,
    log: Logger,
}

impl Heartbeat {
    pub fn new(
        config: Arc<Config>,
        cp: Arc<CpClient>,
        metrics: Arc<Metrics>,
        version: String,
        mesh_public_key: String,
        log: Logger,
    ) -> Self {
        let kernel = read_kernel();
        let detector = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            config,
            cp,
            metrics,
            version,
            kernel,
            mesh_public_key,
            detector,
            log,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let refresh_interval =
            Duration::from_secs(self.config.control_plane.ip_refresh_interval);
        let mut detected: (Option<String>, Option<String>) = (None, None);
        let mut reported: (Option<String>, Option<String>) = (None, None);
        let mut last_refresh: Option<Instant> = None;

        let mut ticker = interval(Duration::from_secs(
            self.config.control_plane.heartbeat_interval,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    inf!(self.log, UNIT, "task stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let due = last_refresh
                .map(|t| t.elapsed() >= refresh_interval)
                .unwrap_or(true);
            if due {
                detected = (
                    self.detect_ip(&self.config.control_plane.ipv4_detect_url)
                        .await,
                    self.detect_ip(&self.config.control_plane.ipv6_detect_url)
                        .await,
                );
                last_refresh = Some(Instant::now());
            }

            // Only addresses that changed since the last report ride along.
            let public_ipv4 = detected
                .0
                .clone()
                .filter(|addr| reported.0.as_deref() != Some(addr));
            let public_ipv6 = detected
                .1
                .clone()
                .filter(|addr| reported.1.as_deref() != Some(addr));

            let status = self.snapshot(public_ipv4, public_ipv6);
            let timestamp = status.timestamp;
            let load_avg = status.load_avg.clone();
            let report = HeartbeatReport {
                node_id: self.config.node.name.clone(),
                agent_version: self.version.clone(),
                status,
            };
            match self.cp.send_heartbeat(&report, &cancel).await {
                Ok(()) => {
                    self.metrics.record_cp_request(true);
                    self.metrics.record_heartbeat(timestamp);
                    if let Some(addr) = report.status.public_ipv4 {
                        reported.0 = Some(addr);
                    }
                    if let Some(addr) = report.status.public_ipv6 {
                        reported.1 = Some(addr);
                    }
                    dbg!(self.log, UNIT, "sent (load: {load_avg})");
                }
                Err(e) => {
                    self.metrics.record_cp_request(false);
                    wrn!(self.log, UNIT, "failed to send heartbeat: {e}");
                }
            }
        }
    }

    fn snapshot(
        &self,
        public_ipv4: Option<String>,
        public_ipv6: Option<String>,
    ) -> HeartbeatStatus {
        let net_dev = read_proc("/proc/net/dev");
        HeartbeatStatus {
            version: self.version.clone(),
            kernel: self.kernel.clone(),
            load_avg: parse_load_avg(&read_proc("/proc/loadavg")),
            uptime: parse_uptime(&read_proc("/proc/uptime")),
            timestamp: Utc::now().timestamp(),
            tx: sum_net_dev(&net_dev, 9),
            rx: sum_net_dev(&net_dev, 1),
            tcp: count_socket_lines(&read_proc("/proc/net/tcp"))
                + count_socket_lines(&read_proc("/proc/net/tcp6")),
            udp: count_socket_lines(&read_proc("/proc/net/udp"))
                + count_socket_lines(&read_proc("/proc/net/udp6")),
            mesh_public_key: self.mesh_public_key.clone(),
            public_ipv4,
            public_ipv6,
        }
    }

    async fn detect_ip(&self, url: &str) -> Option<String> {
        let resp = self.detector.get(url).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body = resp.text().await.ok()?;
        let addr: IpAddr = body.trim().parse().ok()?;
        Some(addr.to_string())
    }
}

fn read_proc(path: &str) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

fn read_kernel() -> String {
    let version = read_proc("/proc/version");
    version
        .split_whitespace()
        .nth(2)
        .unwrap_or("unknown")
        .to_string()
}

fn parse_load_avg(contents: &str) -> String {
    let fields: Vec<&str> = contents.split_whitespace().take(3).collect();
    if fields.len() == 3 {
        fields.join(" ")
    } else {
        "0.00 0.00 0.00".to_string()
    }
}

fn parse_uptime(contents: &str) -> i64 {
    contents
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<f64>().ok())
        .map(|v| v as i64)
        .unwrap_or(0)
}

/// Sum one `/proc/net/dev` column across non-loopback interfaces.
/// `field` is the index after the interface name: 1 = rx bytes, 9 = tx.
fn sum_net_dev(contents: &str, field: usize) -> u64 {
    let mut total = 0u64;
    for line in contents.lines().skip(2) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let iface = fields[0].trim_end_matches(':');
        if iface == "lo" {
            continue;
        }
        if let Ok(value) = fields[field].parse::<u64>() {
            total += value;
        }
    }
    total
}

/// Count entries in a `/proc/net/{tcp,udp}` table, skipping the header.
fn count_socket_lines(contents: &str) -> usize {
    contents
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_avg_takes_first_three_fields() {
        assert_eq!(
            parse_load_avg("0.52 0.58 0.59 1/389 12345\n"),
            "0.52 0.58 0.59"
        );
        assert_eq!(parse_load_avg(""), "0.00 0.00 0.00");
    }

    #[test]
    fn uptime_truncates_to_seconds() {
        assert_eq!(parse_uptime("35435.67 123.45\n"), 35435);
        assert_eq!(parse_uptime("garbage"), 0);
    }

    #[test]
    fn net_dev_sums_skip_loopback() {
        let table = "\
Inter-|   Receive                |  Transmit\n\
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n\
    lo: 1000 10 0 0 0 0 0 0 2000 20 0 0 0 0 0 0\n\
  eth0: 300 3 0 0 0 0 0 0 400 4 0 0 0 0 0 0\n\
 wg_u1: 50 1 0 0 0 0 0 0 60 1 0 0 0 0 0 0\n";
        assert_eq!(sum_net_dev(table, 1), 350);
        assert_eq!(sum_net_dev(table, 9), 460);
    }

    #[test]
    fn socket_counts_skip_header_and_blanks() {
        let table = "\
  sl  local_address rem_address   st\n\
   0: 00000000:1F90 00000000:0000 0A\n\
   1: 0100007F:13AD 00000000:0000 0A\n\n";
        assert_eq!(count_socket_lines(table), 2);
    }
}
