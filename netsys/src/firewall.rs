// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! UDP port rules for tunnel listeners, kept in iptables/ip6tables and
//! tagged with a comment so the agent can recognize its own rules.

use crate::{cmd, Error};
use slog::{debug, error, info, Logger};
use std::collections::BTreeSet;

const RULES_V4_PATH: &str = "/etc/iptables/rules.v4";
const RULES_V6_PATH: &str = "/etc/iptables/rules.v6";

pub struct FirewallExecutor {
    chain: String,
    comment_prefix: String,
    log: Logger,
}

impl FirewallExecutor {
    pub fn new(log: Logger) -> Self {
        Self {
            chain: "INPUT".to_string(),
            comment_prefix: "wrend-dn42".to_string(),
            log,
        }
    }

    fn comment(&self, port: u16) -> String {
        format!("{}-{}", self.comment_prefix, port)
    }

    fn rule_args<'a>(
        &'a self,
        action: &'a str,
        port: &'a str,
        comment: &'a str,
    ) -> Vec<&'a str> {
        vec![
            action,
            &self.chain,
            "-p",
            "udp",
            "--dport",
            port,
            "-m",
            "comment",
            "--comment",
            comment,
            "-j",
            "ACCEPT",
        ]
    }

    /// Open a UDP port in both address families. The v4 rule is rolled back
    /// if the v6 rule cannot be installed.
    pub async fn allow_port(&self, port: u16) -> Result<(), Error> {
        if self.port_exists(port).await {
            debug!(self.log, "port {port} already open");
            return Ok(());
        }
        let comment = self.comment(port);
        let port_s = port.to_string();

        cmd::run("iptables", &self.rule_args("-A", &port_s, &comment)).await?;
        if let Err(e) =
            cmd::run("ip6tables", &self.rule_args("-A", &port_s, &comment))
                .await
        {
            let _ =
                cmd::run("iptables", &self.rule_args("-D", &port_s, &comment))
                    .await;
            return Err(e);
        }

        info!(self.log, "opened udp port {port}");
        self.save_rules().await;
        Ok(())
    }

    /// Remove the UDP port rules. Missing rules are not an error.
    pub async fn remove_port(&self, port: u16) -> Result<(), Error> {
        let comment = self.comment(port);
        let port_s = port.to_string();
        let _ =
            cmd::run("iptables", &self.rule_args("-D", &port_s, &comment))
                .await;
        let _ =
            cmd::run("ip6tables", &self.rule_args("-D", &port_s, &comment))
                .await;
        info!(self.log, "closed udp port {port}");
        self.save_rules().await;
        Ok(())
    }

    /// Ports currently opened by this agent, recognized by comment tag.
    pub async fn open_ports(&self) -> Result<BTreeSet<u16>, Error> {
        let output = cmd::run(
            "iptables",
            &["-L", &self.chain, "-n", "--line-numbers"],
        )
        .await?;
        Ok(parse_tagged_ports(&output, &self.comment_prefix))
    }

    /// Reconcile the installed rule set to exactly `desired`. Per-port
    /// failures are logged and skipped; the pass continues.
    pub async fn sync_ports(
        &self,
        desired: &BTreeSet<u16>,
    ) -> Result<(usize, usize), Error> {
        let current = self.open_ports().await?;
        let mut added = 0;
        let mut removed = 0;

        for port in desired.difference(&current) {
            match self.allow_port(*port).await {
                Ok(()) => added += 1,
                Err(e) => error!(self.log, "failed to open port {port}: {e}"),
            }
        }
        for port in current.difference(desired) {
            match self.remove_port(*port).await {
                Ok(()) => removed += 1,
                Err(e) => error!(self.log, "failed to close port {port}: {e}"),
            }
        }

        if added > 0 || removed > 0 {
            info!(self.log, "synced ports"; "added" => added, "removed" => removed);
        }
        Ok((added, removed))
    }

    async fn port_exists(&self, port: u16) -> bool {
        let port = port.to_string();
        cmd::probe(
            "iptables",
            &[
                "-C", &self.chain, "-p", "udp", "--dport", &port, "-j",
                "ACCEPT",
            ],
        )
        .await
        .unwrap_or(false)
    }

    /// Persist the rule set. Each save is a plain command whose stdout we
    /// write ourselves; failures are ignored, persistence is best-effort.
    async fn save_rules(&self) {
        for (program, path) in
            [("iptables-save", RULES_V4_PATH), ("ip6tables-save", RULES_V6_PATH)]
        {
            if let Ok(dump) = cmd::run(program, &[]).await {
                let _ = std::fs::write(path, dump);
            }
        }
    }
}

/// Pull `dpt:<port>` out of listing lines that carry our comment tag.
fn parse_tagged_ports(listing: &str, tag: &str) -> BTreeSet<u16> {
    let mut ports = BTreeSet::new();
    for line in listing.lines() {
        if !line.contains(tag) {
            continue;
        }
        if let Some(idx) = line.find("dpt:") {
            let digits: String = line[idx + 4..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(port) = digits.parse() {
                ports.insert(port);
            }
        }
    }
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_only_tagged_rules() {
        let listing = "\
Chain INPUT (policy ACCEPT)\n\
num  target  prot opt source    destination\n\
1    ACCEPT  udp  --  0.0.0.0/0 0.0.0.0/0   udp dpt:24001 /* wrend-dn42-24001 */\n\
2    ACCEPT  udp  --  0.0.0.0/0 0.0.0.0/0   udp dpt:51822 /* wrend-dn42-51822 */\n\
3    ACCEPT  udp  --  0.0.0.0/0 0.0.0.0/0   udp dpt:53 /* unbound */\n";
        let ports = parse_tagged_ports(listing, "wrend-dn42");
        assert_eq!(ports, [24001u16, 51822].into_iter().collect());
    }

    #[test]
    fn ignores_malformed_lines() {
        let listing = "1 ACCEPT udp dpt:notaport /* wrend-dn42-x */\n";
        assert!(parse_tagged_ports(listing, "wrend-dn42").is_empty());
    }
}
