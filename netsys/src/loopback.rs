// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dummy interface carrying the node's stable DN42 source addresses.

use crate::{cmd, Error};
use slog::{debug, info, warn, Logger};

pub struct LoopbackExecutor {
    interface: String,
    log: Logger,
}

impl LoopbackExecutor {
    pub fn new(log: Logger) -> Self {
        Self {
            interface: "dummy0".to_string(),
            log,
        }
    }

    /// Make sure the dummy interface exists and is up.
    pub async fn ensure_up(&self) -> Result<(), Error> {
        if !cmd::probe("ip", &["link", "show", &self.interface]).await? {
            cmd::run(
                "ip",
                &["link", "add", &self.interface, "type", "dummy"],
            )
            .await?;
            info!(self.log, "created loopback interface {}", self.interface);
        }
        cmd::run("ip", &["link", "set", &self.interface, "up"]).await?;
        Ok(())
    }

    /// Configure the interface with the node's loopback addresses. Bare
    /// addresses get /32 (v4) or /128 (v6) appended. Per-address failures
    /// are logged, not fatal; at least one address must be supplied.
    pub async fn setup_addresses(
        &self,
        ipv4: &str,
        ipv6: &str,
    ) -> Result<(), Error> {
        if ipv4.is_empty() && ipv6.is_empty() {
            return Err(Error::NoLoopbackAddress);
        }
        self.ensure_up().await?;

        let mut configured = Vec::new();
        if !ipv4.is_empty() {
            let addr = with_prefix(ipv4, 32);
            match self.add_address(&addr).await {
                Ok(()) => configured.push(addr),
                Err(e) => {
                    warn!(self.log, "failed to add {addr}: {e}")
                }
            }
        }
        if !ipv6.is_empty() {
            let addr = with_prefix(ipv6, 128);
            match self.add_address(&addr).await {
                Ok(()) => configured.push(addr),
                Err(e) => {
                    warn!(self.log, "failed to add {addr}: {e}")
                }
            }
        }
        if !configured.is_empty() {
            info!(self.log, "loopback configured: {}", configured.join(", "));
        }
        Ok(())
    }

    async fn add_address(&self, addr: &str) -> Result<(), Error> {
        let current = cmd::run("ip", &["addr", "show", &self.interface])
            .await
            .unwrap_or_default();
        let bare = addr.split('/').next().unwrap_or(addr);
        if current.contains(bare) {
            debug!(self.log, "address {addr} already configured");
            return Ok(());
        }
        cmd::run("ip", &["addr", "add", addr, "dev", &self.interface]).await?;
        Ok(())
    }

    /// All inet/inet6 addresses currently on the interface.
    pub async fn addresses(&self) -> Result<Vec<String>, Error> {
        let output =
            cmd::run("ip", &["addr", "show", &self.interface]).await?;
        Ok(parse_addresses(&output))
    }

    pub async fn remove_address(&self, addr: &str) -> Result<(), Error> {
        cmd::run("ip", &["addr", "del", addr, "dev", &self.interface]).await?;
        info!(self.log, "removed address {addr}");
        Ok(())
    }
}

fn with_prefix(addr: &str, bits: u8) -> String {
    if addr.contains('/') {
        addr.to_string()
    } else {
        format!("{addr}/{bits}")
    }
}

fn parse_addresses(output: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("inet") | Some("inet6") => {
                if let Some(addr) = fields.next() {
                    out.push(addr.to_string());
                }
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_are_appended_only_when_missing() {
        assert_eq!(with_prefix("172.22.188.4", 32), "172.22.188.4/32");
        assert_eq!(with_prefix("172.22.188.4/26", 32), "172.22.188.4/26");
        assert_eq!(
            with_prefix("fd00:4242:7777:101:4::1", 128),
            "fd00:4242:7777:101:4::1/128"
        );
    }

    #[test]
    fn addresses_parsed_from_ip_output() {
        let output = "\
2: dummy0: <BROADCAST,NOARP,UP,LOWER_UP> mtu 1500\n\
    link/ether 02:00:00:00:00:01 brd ff:ff:ff:ff:ff:ff\n\
    inet 172.22.188.4/32 scope global dummy0\n\
       valid_lft forever preferred_lft forever\n\
    inet6 fd00:4242:7777:101:4::1/128 scope global\n";
        assert_eq!(
            parse_addresses(output),
            vec!["172.22.188.4/32", "fd00:4242:7777:101:4::1/128"]
        );
    }
}
