// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire model for the control plane API.
//!
//! Every response body is wrapped in an [`Envelope`]; the payload types here
//! mirror the JSON the control plane emits, so field renames live in this
//! module and nowhere else.

use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Generic control plane response wrapper.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    pub data: T,
}

/// Lifecycle status of a peering session. The numeric values are authoritative
/// control plane input and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(i32)]
pub enum SessionStatus {
    Deleted = 0,
    Disabled = 1,
    Active = 2,
    PendingApproval = 3,
    QueuedForSetup = 4,
    QueuedForDelete = 5,
    Problem = 6,
    Teardown = 7,
}

/// A BGP peering session as described by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeeringSession {
    pub uuid: Uuid,
    pub asn: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: i32,
    /// Transport kind, currently always "wireguard".
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub endpoint: String,
    /// Peer WireGuard public key.
    #[serde(default)]
    pub credential: String,
    #[serde(default)]
    pub ipv4: String,
    #[serde(default)]
    pub ipv6: String,
    #[serde(default)]
    pub ipv6_link_local: String,
    #[serde(default)]
    pub mtu: u32,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub policy: String,
    #[serde(default)]
    pub last_error: String,
}

impl PeeringSession {
    /// Decode the raw status integer into the closed enumeration. Unknown
    /// values surface as `Err` so callers can log-and-skip.
    pub fn status(&self) -> Result<SessionStatus, i32> {
        SessionStatus::try_from(self.status).map_err(|_| self.status)
    }

    /// BIRD protocol name for this session.
    pub fn protocol_name(&self) -> String {
        format!("dn42_{}", self.asn)
    }

    /// Deterministic local WireGuard listen port for this session.
    pub fn listen_port(&self) -> u16 {
        20000 + (self.asn % 10000) as u16
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsData {
    #[serde(default)]
    pub bgp_sessions: Vec<PeeringSession>,
}

/// A fellow agent-managed node in the internal routing mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshPeer {
    pub node_id: u8,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub loopback_ipv4: String,
    #[serde(default)]
    pub loopback_ipv6: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub mtu: u32,
    #[serde(default)]
    pub is_rr: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshConfig {
    pub local_node_id: u8,
    #[serde(default)]
    pub local_loopback4: String,
    #[serde(default)]
    pub local_loopback6: String,
    #[serde(default)]
    pub peers: Vec<MeshPeer>,
}

/// Node metadata carried in the bird-config bundle.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleNode {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub region_code: String,
    #[serde(default)]
    pub bandwidth: String,
}

/// Policy parameters carried in the bird-config bundle.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundlePolicy {
    pub dn42_as: u32,
    #[serde(default)]
    pub prefixes4: Vec<String>,
    #[serde(default)]
    pub prefixes6: Vec<String>,
    #[serde(default = "default_as_path_max_len")]
    pub as_path_max_len: u32,
    #[serde(default)]
    pub import_limit: u32,
    #[serde(default)]
    pub export_limit: u32,
    #[serde(default)]
    pub roa_sources: Vec<String>,
}

fn default_as_path_max_len() -> u32 {
    64
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IbgpPeer {
    pub node_id: u8,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub loopback_ipv4: String,
    #[serde(default)]
    pub loopback_ipv6: String,
    #[serde(default)]
    pub is_rr: bool,
}

/// The rendered-config input bundle. `config_hash` advances whenever any of
/// the derived data changes; equality means re-rendering can be skipped.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BirdConfigBundle {
    pub config_hash: String,
    pub node: BundleNode,
    pub policy: BundlePolicy,
    #[serde(default)]
    pub ibgp_peers: Vec<IbgpPeer>,
}

/// Session status update pushed to the control plane.
#[derive(Debug, Serialize)]
pub struct ModifyRequest {
    pub peer_id: Uuid,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Node health snapshot nested inside a heartbeat report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatStatus {
    pub version: String,
    pub kernel: String,
    pub load_avg: String,
    pub uptime: i64,
    pub timestamp: i64,
    pub tx: u64,
    pub rx: u64,
    pub tcp: usize,
    pub udp: usize,
    pub mesh_public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ipv6: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatReport {
    pub node_id: String,
    pub agent_version: String,
    pub status: HeartbeatStatus,
}

/// One BGP protocol row scraped from `show protocols`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BgpProtocolRow {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub state: String,
    pub info: String,
}

#[derive(Debug, Serialize)]
pub struct BgpStateReport {
    pub node_id: String,
    pub timestamp: i64,
    pub sessions: Vec<BgpProtocolRow>,
}

/// One RTT sample. `rtt_ms` is -1 when every probe was lost.
#[derive(Debug, Clone, Serialize)]
pub struct RttMeasurement {
    pub target: String,
    pub rtt_ms: f64,
    pub loss: f64,
}

#[derive(Debug, Serialize)]
pub struct RttReport {
    pub measurements: Vec<RttMeasurement>,
    pub timestamp: i64,
}

/// Per-peer convergence outcomes from a mesh-sync pass.
#[derive(Debug, Serialize)]
pub struct MeshStatusReport {
    pub node_id: String,
    pub timestamp: i64,
    pub peers: BTreeMap<u8, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_status_round_trip() {
        assert_eq!(
            SessionStatus::try_from(4).unwrap(),
            SessionStatus::QueuedForSetup
        );
        assert_eq!(SessionStatus::try_from(0).unwrap(), SessionStatus::Deleted);
        assert!(SessionStatus::try_from(42).is_err());
    }

    #[test]
    fn session_decodes_control_plane_json() {
        let raw = r#"{
            "uuid": "b4b2d3a0-6a0f-4f3e-9f6a-5b1d2c3e4f50",
            "asn": 4242420123,
            "name": "PEER-EXAMPLE",
            "status": 4,
            "type": "wireguard",
            "interface": "wg_u1",
            "endpoint": "203.0.113.10:24000",
            "credential": "K",
            "ipv6LinkLocal": "fe80::1",
            "mtu": 1420
        }"#;
        let s: PeeringSession = serde_json::from_str(raw).unwrap();
        assert_eq!(s.status().unwrap(), SessionStatus::QueuedForSetup);
        assert_eq!(s.kind, "wireguard");
        assert_eq!(s.ipv6_link_local, "fe80::1");
        assert_eq!(s.protocol_name(), "dn42_4242420123");
        assert_eq!(s.listen_port(), 20123);
        assert!(s.ipv4.is_empty());
    }

    #[test]
    fn bundle_decodes_with_defaults() {
        let raw = r#"{
            "configHash": "abc123",
            "node": { "id": 4, "name": "nue1", "regionCode": "302" },
            "policy": { "dn42As": 4242420998 },
            "ibgpPeers": [
                { "nodeId": 2, "nodeName": "fra1", "loopbackIpv6": "fd00::2", "isRr": true }
            ]
        }"#;
        let b: BirdConfigBundle = serde_json::from_str(raw).unwrap();
        assert_eq!(b.policy.as_path_max_len, 64);
        assert_eq!(b.ibgp_peers.len(), 1);
        assert!(b.ibgp_peers[0].is_rr);
    }
}
