// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! BGP metric collection: scrape `show protocols`, keep the eBGP peer rows,
//! and post the snapshot to the control plane.

use crate::config::Config;
use crate::log::{dbg, inf, wrn};
use anyhow::Context;
use bird::Pool;
use chrono::Utc;
use cp_client::types::{BgpProtocolRow, BgpStateReport};
use cp_client::CpClient;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const UNIT: &str = "metric";
const PEER_PREFIX: &str = "dn42_";

pub struct MetricCollector {
    config: Arc<Config>,
    cp: Arc<CpClient>,
    pool: Arc<Pool>,
    log: Logger,
}

impl MetricCollector {
    pub fn new(
        config: Arc<Config>,
        cp: Arc<CpClient>,
        pool: Arc<Pool>,
        log: Logger,
    ) -> Self {
        Self {
            config,
            cp,
            pool,
            log,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(
            self.config.control_plane.metric_interval,
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
            if let Err(e) = self.collect_and_report(&cancel).await {
                wrn!(self.log, UNIT, "collection failed: {e:#}");
            }
        }
    }

    async fn collect_and_report(
        &self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let output = self
            .pool
            .show_protocols()
            .await
            .context("failed to query protocols")?;
        let sessions = parse_protocol_rows(&output, PEER_PREFIX);
        if sessions.is_empty() {
            dbg!(self.log, UNIT, "no sessions to report");
            return Ok(());
        }

        let report = BgpStateReport {
            node_id: self.config.node.name.clone(),
            timestamp: Utc::now().timestamp(),
            sessions,
        };
        self.cp
            .send_bgp_report(&report, cancel)
            .await
            .context("failed to report metrics")?;
        inf!(self.log, UNIT, "reported {} sessions", report.sessions.len());
        Ok(())
    }
}

/// Drop the `NNNN-`/`NNNN ` status-code prefix the control socket puts in
/// front of table rows.
fn strip_code_prefix(line: &str) -> &str {
    let b = line.as_bytes();
    if b.len() >= 5
        && b[..4].iter().all(u8::is_ascii_digit)
        && (b[4] == b'-' || b[4] == b' ')
    {
        &line[5..]
    } else {
        line
    }
}

/// Parse the header-less `show protocols` table, keeping BGP rows whose
/// protocol name carries the peer prefix.
pub(crate) fn parse_protocol_rows(
    output: &str,
    prefix: &str,
) -> Vec<BgpProtocolRow> {
    let mut rows = Vec::new();
    for raw in output.lines() {
        let line = strip_code_prefix(raw);
        if line.is_empty() || line.starts_with("Name") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let (name, proto, state) = (fields[0], fields[1], fields[3]);
        if proto != "BGP" || !name.starts_with(prefix) {
            continue;
        }
        let info = if fields.len() > 5 {
            fields[5..].join(" ")
        } else {
            String::new()
        };
        rows.push(BgpProtocolRow {
            name: name.to_string(),
            kind: "bgp".to_string(),
            state: state.to_string(),
            info,
        });
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_prefixed_bgp_rows() {
        let output = "\
2002-Name       Proto      Table      State  Since         Info\n\
1002-dn42_4242420123 BGP        ---        up     10:47:27      Established\n\
1002-dn42_4242420777 BGP        ---        start  10:47:30      Active        Socket: Connection refused\n\
1002-ibgp_2     BGP        ---        up     10:45:01      Established\n\
1002-babel_igp  Babel      ---        up     10:44:58      \n\
1002-static1    Static     master4    up     10:44:58      \n\
0000 \n";
        let rows = parse_protocol_rows(output, "dn42_");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "dn42_4242420123");
        assert_eq!(rows[0].state, "up");
        assert_eq!(rows[0].info, "Established");
        assert_eq!(rows[1].state, "start");
        assert_eq!(rows[1].info, "Active Socket: Connection refused");
    }

    #[test]
    fn also_accepts_rows_without_code_prefix() {
        let output = "\
Name       Proto      Table      State  Since         Info\n\
dn42_4242420123 BGP    ---        up     10:47:27      Established\n";
        let rows = parse_protocol_rows(output, "dn42_");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, "bgp");
    }
}
