// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! WireGuard tunnel lifecycle via the `wg` and `ip` tools.

use crate::{cmd, Error};
use slog::{info, warn, Logger};
use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;

pub struct WgExecutor {
    private_key: String,
    public_key: String,
    log: Logger,
}

impl WgExecutor {
    /// Load the node keypair, generating and persisting one on first run.
    /// The public key is additionally written to `public_key_path` so other
    /// consumers (heartbeat, operators) can read it without shelling out.
    pub async fn new(
        private_key_path: &Path,
        public_key_path: &Path,
        log: Logger,
    ) -> Result<Self, Error> {
        let private_key = match fs::read_to_string(private_key_path) {
            Ok(data) => data.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let generated = cmd::run("wg", &["genkey"]).await?;
                let key = generated.trim().to_string();
                if key.is_empty() {
                    return Err(Error::EmptyKey("private"));
                }
                if let Some(parent) = private_key_path.parent() {
                    if !parent.exists() {
                        fs::DirBuilder::new()
                            .recursive(true)
                            .mode(0o700)
                            .create(parent)?;
                    }
                }
                fs::write(private_key_path, &key)?;
                fs::set_permissions(
                    private_key_path,
                    fs::Permissions::from_mode(0o600),
                )?;
                key
            }
            Err(e) => return Err(e.into()),
        };

        let derived =
            cmd::run_with_stdin("wg", &["pubkey"], &private_key).await?;
        let public_key = derived.trim().to_string();
        if public_key.is_empty() {
            return Err(Error::EmptyKey("public"));
        }
        if let Err(e) = fs::write(public_key_path, &public_key) {
            warn!(log, "failed to persist public key: {e}");
        }

        Ok(Self {
            private_key,
            public_key,
            log,
        })
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Create-or-update a tunnel interface with a single peer. Safe to call
    /// repeatedly with the same arguments.
    pub async fn create_interface(
        &self,
        name: &str,
        listen_port: Option<u16>,
        peer_key: &str,
        endpoint: Option<&str>,
        allowed_ips: &[String],
        keepalive: u32,
    ) -> Result<(), Error> {
        if !self.interface_exists(name) {
            cmd::run("ip", &["link", "add", "dev", name, "type", "wireguard"])
                .await?;
        }

        cmd::run_with_stdin(
            "wg",
            &["set", name, "private-key", "/dev/stdin"],
            &self.private_key,
        )
        .await?;

        if let Some(port) = listen_port {
            let port = port.to_string();
            cmd::run("wg", &["set", name, "listen-port", &port]).await?;
        }

        let joined = allowed_ips.join(",");
        let keepalive = keepalive.to_string();
        let mut args =
            vec!["set", name, "peer", peer_key, "allowed-ips", joined.as_str()];
        if let Some(endpoint) = endpoint.filter(|e| !e.is_empty()) {
            args.push("endpoint");
            args.push(endpoint);
        }
        args.push("persistent-keepalive");
        args.push(&keepalive);
        cmd::run("wg", &args).await?;

        cmd::run("ip", &["link", "set", name, "up"]).await?;
        info!(self.log, "interface {name} configured");
        Ok(())
    }

    /// Add an address to an interface if not already present.
    pub async fn add_address(
        &self,
        name: &str,
        addr: &str,
    ) -> Result<(), Error> {
        let current = cmd::run("ip", &["addr", "show", name])
            .await
            .unwrap_or_default();
        let bare = addr.split('/').next().unwrap_or(addr);
        if current.contains(bare) {
            return Ok(());
        }
        cmd::run("ip", &["addr", "add", addr, "dev", name]).await?;
        Ok(())
    }

    pub async fn set_mtu(&self, name: &str, mtu: u32) -> Result<(), Error> {
        let mtu = mtu.to_string();
        cmd::run("ip", &["link", "set", name, "mtu", &mtu]).await?;
        Ok(())
    }

    /// Delete an interface. A missing interface is not an error.
    pub async fn delete_interface(&self, name: &str) -> Result<(), Error> {
        if !self.interface_exists(name) {
            return Ok(());
        }
        if let Err(e) = cmd::run("ip", &["link", "set", name, "down"]).await {
            warn!(self.log, "failed to bring down {name}: {e}");
        }
        cmd::run("ip", &["link", "del", name]).await?;
        info!(self.log, "interface {name} deleted");
        Ok(())
    }

    pub fn interface_exists(&self, name: &str) -> bool {
        interface_in_proc_net_dev(
            &fs::read_to_string("/proc/net/dev").unwrap_or_default(),
            name,
        )
    }

    pub async fn status(&self, name: &str) -> Result<String, Error> {
        cmd::run("wg", &["show", name]).await
    }
}

fn interface_in_proc_net_dev(contents: &str, name: &str) -> bool {
    let marker = format!("{name}:");
    contents
        .lines()
        .any(|line| line.trim_start().starts_with(&marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_net_dev_matching_is_exact() {
        let table = "\
Inter-|   Receive\n face |bytes\n\
    lo: 1 2 3\n\
  wg_u1: 4 5 6\n\
  dn42-wg-igp-2: 7 8 9\n";
        assert!(interface_in_proc_net_dev(table, "wg_u1"));
        assert!(interface_in_proc_net_dev(table, "dn42-wg-igp-2"));
        assert!(!interface_in_proc_net_dev(table, "wg_u"));
        assert!(!interface_in_proc_net_dev(table, "dn42-wg-igp-20"));
    }
}
