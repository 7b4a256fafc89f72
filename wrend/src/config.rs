// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Agent configuration.
//!
//! Two on-disk forms are accepted. The full form carries every section; the
//! bootstrap form carries only `{bootstrap, server}` and causes the remainder
//! to be fetched from the control plane via `GET /agent/{router}/config`.
//! Documented numeric defaults are applied after parse in both cases.

use cp_client::types::Envelope;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("bootstrap config missing required fields (apiUrl, nodeName)")]
    IncompleteBootstrap,

    #[error("failed to fetch config from control plane: {0}")]
    Bootstrap(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub server: ServerConfig,
    pub node: NodeConfig,
    pub control_plane: ControlPlaneConfig,
    pub bird: BirdConfig,
    pub wireguard: WireGuardConfig,
    pub metric: MetricConfig,
    pub auto_update: AutoUpdateConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub listen: String,
    pub read_timeout: u64,
    pub write_timeout: u64,
    pub idle_timeout: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    pub name: String,
    pub id: u8,
    pub asn: u32,
    pub region: String,
    pub location: String,
    pub provider: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlPlaneConfig {
    pub url: String,
    pub token: String,
    /// Seconds.
    pub request_timeout: u64,
    pub heartbeat_interval: u64,
    pub sync_interval: u64,
    pub metric_interval: u64,
    pub max_retries: u32,
    /// Milliseconds.
    pub retry_initial_delay: u64,
    /// Seconds between public IP re-detections for the heartbeat.
    pub ip_refresh_interval: u64,
    pub ipv4_detect_url: String,
    pub ipv6_detect_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BirdConfig {
    pub control_socket: String,
    pub pool_size: usize,
    pub pool_size_max: usize,
    /// Root of the rendered configuration tree.
    pub conf_dir: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireGuardConfig {
    pub private_key_path: String,
    pub public_key_path: String,
    pub persistent_keepalive_interval: u32,
    pub dn42_ipv4: String,
    pub dn42_ipv6: String,
    pub dn42_ipv6_link_local: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricConfig {
    /// Seconds per TCP ping attempt.
    pub ping_timeout: u64,
    pub ping_count: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoUpdateConfig {
    pub enabled: bool,
    /// Minutes.
    pub check_interval: u64,
    pub channel: String,
    pub github_repo: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfig {
    pub bootstrap: BootstrapSection,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapSection {
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub token: String,
}

/// The sections the control plane supplies in bootstrap mode.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteConfig {
    pub node: NodeConfig,
    pub bird: BirdConfig,
    pub wireguard: WireGuardConfig,
    pub metric: MetricConfig,
    pub auto_update: AutoUpdateConfig,
}

impl Config {
    pub fn apply_defaults(&mut self) {
        let s = &mut self.server;
        if s.listen.is_empty() {
            s.listen = "0.0.0.0:8080".to_string();
        }
        if s.read_timeout == 0 {
            s.read_timeout = 30;
        }
        if s.write_timeout == 0 {
            s.write_timeout = 30;
        }
        if s.idle_timeout == 0 {
            s.idle_timeout = 120;
        }

        let cp = &mut self.control_plane;
        if cp.request_timeout == 0 {
            cp.request_timeout = 15;
        }
        if cp.heartbeat_interval == 0 {
            cp.heartbeat_interval = 30;
        }
        if cp.sync_interval == 0 {
            cp.sync_interval = 60;
        }
        if cp.metric_interval == 0 {
            cp.metric_interval = 60;
        }
        if cp.max_retries == 0 {
            cp.max_retries = 3;
        }
        if cp.retry_initial_delay == 0 {
            cp.retry_initial_delay = 1000;
        }
        if cp.ip_refresh_interval == 0 {
            cp.ip_refresh_interval = 3600;
        }
        if cp.ipv4_detect_url.is_empty() {
            cp.ipv4_detect_url = "https://ipv4.icanhazip.com".to_string();
        }
        if cp.ipv6_detect_url.is_empty() {
            cp.ipv6_detect_url = "https://ipv6.icanhazip.com".to_string();
        }

        let b = &mut self.bird;
        if b.control_socket.is_empty() {
            b.control_socket = "/var/run/bird/bird.ctl".to_string();
        }
        if b.pool_size == 0 {
            b.pool_size = 5;
        }
        if b.pool_size_max == 0 {
            b.pool_size_max = 64;
        }
        if b.conf_dir.is_empty() {
            b.conf_dir = "/etc/bird".to_string();
        }

        let w = &mut self.wireguard;
        if w.private_key_path.is_empty() {
            w.private_key_path = "/etc/wireguard/private.key".to_string();
        }
        if w.public_key_path.is_empty() {
            w.public_key_path = "/etc/wireguard/public.key".to_string();
        }
        if w.persistent_keepalive_interval == 0 {
            w.persistent_keepalive_interval = 25;
        }

        let m = &mut self.metric;
        if m.ping_timeout == 0 {
            m.ping_timeout = 5;
        }
        if m.ping_count == 0 {
            m.ping_count = 4;
        }

        let u = &mut self.auto_update;
        if u.check_interval == 0 {
            u.check_interval = 60;
        }
        if u.channel.is_empty() {
            u.channel = "stable".to_string();
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.control_plane.request_timeout)
    }

    fn is_complete(&self) -> bool {
        !self.node.name.is_empty() && !self.wireguard.dn42_ipv4.is_empty()
    }
}

/// Load configuration, transparently bootstrapping from the control plane
/// when the file only carries the bootstrap form.
pub async fn load_with_bootstrap(
    path: &Path,
) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path)?;

    if let Ok(mut full) = serde_json::from_str::<Config>(&raw) {
        if full.is_complete() {
            full.apply_defaults();
            return Ok(full);
        }
    }

    let bootstrap: BootstrapConfig = serde_json::from_str(&raw)?;
    if bootstrap.bootstrap.api_url.is_empty()
        || bootstrap.bootstrap.node_name.is_empty()
    {
        return Err(ConfigError::IncompleteBootstrap);
    }

    let remote = fetch_remote_config(&bootstrap).await?;
    let mut merged = merge_config(bootstrap, remote);
    merged.apply_defaults();
    Ok(merged)
}

async fn fetch_remote_config(
    bootstrap: &BootstrapConfig,
) -> Result<RemoteConfig, ConfigError> {
    let url = format!(
        "{}/agent/{}/config",
        bootstrap.bootstrap.api_url.trim_end_matches('/'),
        bootstrap.bootstrap.node_name,
    );
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| ConfigError::Bootstrap(e.to_string()))?;
    let resp = client
        .get(url)
        .bearer_auth(&bootstrap.bootstrap.token)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| ConfigError::Bootstrap(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(ConfigError::Bootstrap(format!(
            "control plane returned status {}",
            resp.status()
        )));
    }
    let envelope: Envelope<RemoteConfig> = resp
        .json()
        .await
        .map_err(|e| ConfigError::Bootstrap(e.to_string()))?;
    Ok(envelope.data)
}

fn merge_config(bootstrap: BootstrapConfig, remote: RemoteConfig) -> Config {
    Config {
        server: bootstrap.server,
        node: remote.node,
        bird: remote.bird,
        wireguard: remote.wireguard,
        metric: remote.metric,
        auto_update: remote.auto_update,
        control_plane: ControlPlaneConfig {
            url: bootstrap.bootstrap.api_url,
            token: bootstrap.bootstrap.token,
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_zeroed_fields() {
        let mut config = Config::default();
        config.apply_defaults();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.control_plane.sync_interval, 60);
        assert_eq!(config.control_plane.max_retries, 3);
        assert_eq!(config.control_plane.retry_initial_delay, 1000);
        assert_eq!(config.control_plane.ip_refresh_interval, 3600);
        assert_eq!(config.bird.control_socket, "/var/run/bird/bird.ctl");
        assert_eq!(config.bird.pool_size, 5);
        assert_eq!(config.bird.pool_size_max, 64);
        assert_eq!(config.bird.conf_dir, "/etc/bird");
        assert_eq!(config.metric.ping_count, 4);
        assert_eq!(config.wireguard.persistent_keepalive_interval, 25);
    }

    #[test]
    fn explicit_values_survive_defaulting() {
        let raw = r#"{
            "server": { "listen": "127.0.0.1:9999" },
            "node": { "name": "nue1", "id": 4, "asn": 4242420998, "region": "302" },
            "controlPlane": { "url": "https://cp.example/api/v1", "token": "t", "syncInterval": 15 },
            "bird": { "confDir": "/tmp/bird" },
            "wireguard": { "dn42Ipv4": "172.22.188.4", "dn42Ipv6": "fd00:4242:7777:302:1::1" }
        }"#;
        let mut config: Config = serde_json::from_str(raw).unwrap();
        config.apply_defaults();
        assert_eq!(config.server.listen, "127.0.0.1:9999");
        assert_eq!(config.control_plane.sync_interval, 15);
        assert_eq!(config.control_plane.heartbeat_interval, 30);
        assert_eq!(config.node.id, 4);
        assert!(config.is_complete());
    }

    #[test]
    fn bootstrap_form_requires_api_url_and_node_name() {
        let raw = r#"{ "bootstrap": { "token": "t" }, "server": {} }"#;
        let bootstrap: BootstrapConfig = serde_json::from_str(raw).unwrap();
        assert!(bootstrap.bootstrap.api_url.is_empty());
    }

    #[test]
    fn merge_keeps_local_server_and_bootstrap_credentials() {
        let bootstrap: BootstrapConfig = serde_json::from_str(
            r#"{
                "bootstrap": { "apiUrl": "https://cp.example/api/v1", "nodeName": "nue1", "token": "secret" },
                "server": { "listen": "127.0.0.1:8080" }
            }"#,
        )
        .unwrap();
        let remote: RemoteConfig = serde_json::from_str(
            r#"{
                "node": { "name": "nue1", "id": 4 },
                "wireguard": { "dn42Ipv4": "172.22.188.4" }
            }"#,
        )
        .unwrap();
        let mut merged = merge_config(bootstrap, remote);
        merged.apply_defaults();
        assert_eq!(merged.server.listen, "127.0.0.1:8080");
        assert_eq!(merged.control_plane.url, "https://cp.example/api/v1");
        assert_eq!(merged.control_plane.token, "secret");
        assert_eq!(merged.node.id, 4);
        assert_eq!(merged.control_plane.request_timeout, 15);
    }
}
