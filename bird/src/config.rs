// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generator for the BIRD configuration fragments the agent owns.
//!
//! Layout under the configurable root (default `/etc/bird`):
//! `filters.conf`, `moenet_communities.conf`, `babel.conf`,
//! `cold_potato.conf`, `peers/dn42_<asn>.conf`, `ibgp/ibgp_<nodeId>.conf`.
//!
//! Rendering never reloads the daemon; callers batch renders and follow up
//! with one `Pool::configure`.

use crate::error::Error;
use slog::{info, Logger};
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Inputs for a per-peer eBGP fragment.
#[derive(Debug, Clone, Default)]
pub struct PeerParams {
    pub asn: u32,
    pub description: String,
    pub interface: String,
    pub ipv4: String,
    pub ipv6: String,
    pub ipv6_link_local: String,
    pub extensions: Vec<String>,
    pub policy: String,
}

impl PeerParams {
    fn has_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e == name)
    }
}

/// Inputs for a per-node iBGP fragment.
#[derive(Debug, Clone, Default)]
pub struct IbgpParams {
    pub node_id: u8,
    pub node_name: String,
    pub loopback_ipv6: String,
    pub local_asn: u32,
    /// Emit the route-reflector-client directive: true iff the local node is
    /// a reflector and the remote is not.
    pub rr_client: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FiltersParams {
    pub node_name: String,
    pub node_id: u32,
    pub config_hash: String,
    pub dn42_as: u32,
    pub as_path_max_len: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CommunitiesParams {
    pub node_name: String,
    pub node_id: u32,
    pub region_code: String,
    pub bandwidth: String,
    pub dn42_as: u32,
}

/// Inputs for the IGP (babel) fragment. The ranges bound which loopback
/// routes the mesh may exchange.
#[derive(Debug, Clone, Default)]
pub struct IgpParams {
    pub loopback_range4: String,
    pub loopback_range6: String,
}

#[derive(Debug, Clone, Default)]
pub struct ColdPotatoParams {
    pub dn42_as: u32,
    pub region_code: String,
}

pub struct ConfigGenerator {
    root: PathBuf,
    peers_dir: PathBuf,
    ibgp_dir: PathBuf,
    log: Logger,
}

impl ConfigGenerator {
    pub fn new(root: impl Into<PathBuf>, log: Logger) -> Result<Self, Error> {
        let root = root.into();
        let peers_dir = root.join("peers");
        let ibgp_dir = root.join("ibgp");
        for dir in [&root, &peers_dir, &ibgp_dir] {
            if !dir.exists() {
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o755)
                    .create(dir)?;
            }
        }
        Ok(Self {
            root,
            peers_dir,
            ibgp_dir,
            log,
        })
    }

    pub fn peer_path(&self, asn: u32) -> PathBuf {
        self.peers_dir.join(format!("dn42_{asn}.conf"))
    }

    pub fn ibgp_path(&self, node_id: u8) -> PathBuf {
        self.ibgp_dir.join(format!("ibgp_{node_id}.conf"))
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<(), Error> {
        fs::write(path, contents)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
        Ok(())
    }

    /// Render and write the eBGP fragment for one peering session.
    pub fn write_peer(&self, params: &PeerParams) -> Result<PathBuf, Error> {
        let rendered = render_peer(params)?;
        let path = self.peer_path(params.asn);
        self.write_file(&path, &rendered)?;
        info!(self.log, "wrote peer fragment {}", path.display());
        Ok(path)
    }

    /// Remove a peer fragment. A missing file is not an error.
    pub fn remove_peer(&self, asn: u32) -> Result<(), Error> {
        remove_if_present(&self.peer_path(asn))
    }

    pub fn write_ibgp(&self, params: &IbgpParams) -> Result<PathBuf, Error> {
        let rendered = render_ibgp(params)?;
        let path = self.ibgp_path(params.node_id);
        self.write_file(&path, &rendered)?;
        Ok(path)
    }

    /// Remove an iBGP fragment. A missing file is not an error.
    pub fn remove_ibgp(&self, node_id: u8) -> Result<(), Error> {
        remove_if_present(&self.ibgp_path(node_id))
    }

    /// Remove iBGP fragments whose node-id is not in `current`. Returns the
    /// ids that were removed.
    pub fn cleanup_stale(
        &self,
        current: &BTreeSet<u8>,
    ) -> Result<Vec<u8>, Error> {
        let mut removed = Vec::new();
        for entry in fs::read_dir(&self.ibgp_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = parse_ibgp_filename(name) else {
                continue;
            };
            if !current.contains(&id) {
                remove_if_present(&entry.path())?;
                info!(self.log, "removed stale ibgp fragment for node {id}");
                removed.push(id);
            }
        }
        Ok(removed)
    }

    pub fn write_filters(&self, params: &FiltersParams) -> Result<(), Error> {
        let rendered = render_filters(params)?;
        self.write_file(&self.root.join("filters.conf"), &rendered)
    }

    pub fn write_communities(
        &self,
        params: &CommunitiesParams,
    ) -> Result<(), Error> {
        let rendered = render_communities(params)?;
        self.write_file(&self.root.join("moenet_communities.conf"), &rendered)
    }

    pub fn write_igp(&self, params: &IgpParams) -> Result<(), Error> {
        let rendered = render_igp(params)?;
        self.write_file(&self.root.join("babel.conf"), &rendered)
    }

    pub fn write_cold_potato(
        &self,
        params: &ColdPotatoParams,
    ) -> Result<(), Error> {
        let rendered = render_cold_potato(params)?;
        self.write_file(&self.root.join("cold_potato.conf"), &rendered)
    }
}

fn remove_if_present(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn parse_ibgp_filename(name: &str) -> Option<u8> {
    name.strip_prefix("ibgp_")?
        .strip_suffix(".conf")?
        .parse()
        .ok()
}

pub fn render_peer(p: &PeerParams) -> Result<String, Error> {
    if p.asn == 0 {
        return Err(Error::MissingField {
            fragment: "peer",
            field: "asn",
        });
    }
    let neighbor = if !p.ipv6_link_local.is_empty() {
        if p.interface.is_empty() {
            return Err(Error::MissingField {
                fragment: "peer",
                field: "interface",
            });
        }
        format!("{}%'{}'", p.ipv6_link_local, p.interface)
    } else if !p.ipv6.is_empty() {
        p.ipv6.clone()
    } else if !p.ipv4.is_empty() {
        p.ipv4.clone()
    } else {
        return Err(Error::MissingField {
            fragment: "peer",
            field: "neighbor address",
        });
    };

    let mp_bgp = p.has_extension("mp-bgp");
    let enh = p.has_extension("extended-nexthop");
    let want_v4 = mp_bgp || !p.ipv4.is_empty() || enh;
    let want_v6 =
        mp_bgp || !p.ipv6.is_empty() || !p.ipv6_link_local.is_empty();

    let mut out = format!(
        "# Peer AS{asn} -- {desc}\n\
         # Managed by wrend, do not edit by hand.\n",
        asn = p.asn,
        desc = p.description,
    );
    if !p.policy.is_empty() {
        out.push_str(&format!("# policy: {}\n", p.policy));
    }
    out.push_str(&format!(
        "\nprotocol bgp dn42_{asn} from dnpeers {{\n    \
         neighbor {neighbor} as {asn};\n    \
         description \"{desc}\";\n",
        asn = p.asn,
        neighbor = neighbor,
        desc = p.description,
    ));
    if want_v4 {
        out.push_str("    ipv4 {\n");
        if enh {
            out.push_str("        extended next hop on;\n");
        }
        out.push_str("        import limit 9000 action block;\n    };\n");
    }
    if want_v6 {
        out.push_str(
            "    ipv6 {\n        import limit 9000 action block;\n    };\n",
        );
    }
    out.push_str("}\n");
    Ok(out)
}

pub fn render_ibgp(p: &IbgpParams) -> Result<String, Error> {
    if p.loopback_ipv6.is_empty() {
        return Err(Error::MissingField {
            fragment: "ibgp",
            field: "loopback_ipv6",
        });
    }
    if p.local_asn == 0 {
        return Err(Error::MissingField {
            fragment: "ibgp",
            field: "local_asn",
        });
    }
    let mut out = format!(
        "# iBGP peer: {name} (node {id})\n\
         # Managed by wrend, do not edit by hand.\n\
         \n\
         protocol bgp ibgp_{id} from ibgp_peers {{\n    \
         neighbor {loopback} as {asn};\n    \
         description \"iBGP to {name}\";\n",
        name = p.node_name,
        id = p.node_id,
        loopback = p.loopback_ipv6,
        asn = p.local_asn,
    );
    if p.rr_client {
        out.push_str("    rr client;\n");
    }
    out.push_str(
        "\n    ipv4 {\n        \
         import all;\n        \
         export all;\n        \
         next hop self;\n    };\n\
         \n    ipv6 {\n        \
         import all;\n        \
         export all;\n        \
         next hop self;\n    };\n}\n",
    );
    Ok(out)
}

// DN42-wide community definitions carry no node-specific data.
const DN42_COMMUNITY_DEFS: &str = r#"
# -----------------------------------------------------------------------------
# DN42 BGP Community Definitions
# -----------------------------------------------------------------------------

# Latency Communities (64511, 1-9)
define DN42_LATENCY_0    = (64511, 1);  # RTT < 2.7ms
define DN42_LATENCY_1    = (64511, 2);  # RTT < 7.3ms
define DN42_LATENCY_2    = (64511, 3);  # RTT < 20ms
define DN42_LATENCY_3    = (64511, 4);  # RTT < 55ms
define DN42_LATENCY_4    = (64511, 5);  # RTT < 148ms
define DN42_LATENCY_5    = (64511, 6);  # RTT < 403ms
define DN42_LATENCY_6    = (64511, 7);  # RTT < 1097ms
define DN42_LATENCY_7    = (64511, 8);  # RTT < 2981ms
define DN42_LATENCY_8    = (64511, 9);  # RTT >= 2981ms

# Bandwidth Communities (64511, 21-25)
define DN42_BW_100M_PLUS = (64511, 21);
define DN42_BW_10G_PLUS  = (64511, 22);
define DN42_BW_1G_PLUS   = (64511, 23);
define DN42_BW_100K_PLUS = (64511, 24);
define DN42_BW_10M_PLUS  = (64511, 25);

# Crypto Communities (64511, 31-34)
define DN42_CRYPTO_NONE      = (64511, 31);
define DN42_CRYPTO_UNSAFE    = (64511, 32);
define DN42_CRYPTO_ENCRYPTED = (64511, 33);
define DN42_CRYPTO_LATENCY   = (64511, 34);

# Region Communities (64511, 41-53)
define DN42_REGION_EU       = (64511, 41);
define DN42_REGION_NA_E     = (64511, 42);
define DN42_REGION_NA_C     = (64511, 43);
define DN42_REGION_NA_W     = (64511, 44);
define DN42_REGION_CA       = (64511, 45);
define DN42_REGION_SA       = (64511, 46);
define DN42_REGION_AF       = (64511, 47);
define DN42_REGION_AS_S     = (64511, 48);
define DN42_REGION_AS_SE    = (64511, 49);
define DN42_REGION_AS_E     = (64511, 50);
define DN42_REGION_OC       = (64511, 51);
define DN42_REGION_ME       = (64511, 52);
define DN42_REGION_AS_N     = (64511, 53);

# Action Communities
define DN42_NO_EXPORT   = (64511, 65281);
define DN42_NO_ANNOUNCE = (64511, 65282);

# RFC 8326 Graceful Shutdown
define GRACEFUL_SHUTDOWN = (65535, 0);
"#;

const DN42_VALIDATION_FUNCS: &str = r#"
# -----------------------------------------------------------------------------
# Prefix Validation
# -----------------------------------------------------------------------------

function is_valid_dn42_prefix() -> bool {
    return net ~ [
        172.20.0.0/14{21,29},
        172.20.0.0/24{28,32},
        172.21.0.0/24{28,32},
        172.22.0.0/24{28,32},
        172.23.0.0/24{28,32},
        172.31.0.0/16+,
        10.0.0.0/8{15,24}
    ];
}

function is_valid_dn42_prefix6() -> bool {
    return net ~ [
        fd00::/8{44,64}
    ];
}

# -----------------------------------------------------------------------------
# ROA Validation
# -----------------------------------------------------------------------------

function dn42_roa_valid() -> bool {
    if (roa_check(dn42_roa, net, bgp_path.last) = ROA_VALID) then return true;
    if (roa_check(dn42_roa, net, bgp_path.last) = ROA_UNKNOWN) then return true;
    return false;
}

# -----------------------------------------------------------------------------
# Import/Export Filters
# -----------------------------------------------------------------------------

function update_local_pref_from_latency() {
    bgp_local_pref = 100;
    if (DN42_LATENCY_0 ~ bgp_community) then bgp_local_pref = 260;
    if (DN42_LATENCY_1 ~ bgp_community) then bgp_local_pref = 250;
    if (DN42_LATENCY_2 ~ bgp_community) then bgp_local_pref = 240;
    if (DN42_LATENCY_3 ~ bgp_community) then bgp_local_pref = 230;
    if (DN42_LATENCY_4 ~ bgp_community) then bgp_local_pref = 220;
    if (DN42_LATENCY_5 ~ bgp_community) then bgp_local_pref = 210;
    if (DN42_LATENCY_6 ~ bgp_community) then bgp_local_pref = 200;
    if (DN42_LATENCY_7 ~ bgp_community) then bgp_local_pref = 150;
    if (DN42_LATENCY_8 ~ bgp_community) then bgp_local_pref = 100;
    if (GRACEFUL_SHUTDOWN ~ bgp_community) then bgp_local_pref = 0;
}
"#;

pub fn render_filters(p: &FiltersParams) -> Result<String, Error> {
    if p.node_name.is_empty() {
        return Err(Error::MissingField {
            fragment: "filters",
            field: "node_name",
        });
    }
    if p.dn42_as == 0 {
        return Err(Error::MissingField {
            fragment: "filters",
            field: "dn42_as",
        });
    }
    let mut out = format!(
        "# =============================================================================\n\
         # BIRD Filters for {name} - generated by wrend\n\
         # Config Hash: {hash}\n\
         # =============================================================================\n",
        name = p.node_name,
        hash = p.config_hash,
    );
    out.push_str(DN42_COMMUNITY_DEFS);
    out.push_str(&format!(
        "\n# -----------------------------------------------------------------------------\n\
         # Backbone Large Communities\n\
         # -----------------------------------------------------------------------------\n\
         \n\
         define LC_ACCEPTED_HERE    = ({asn}, 100, {node});\n\
         define LC_REJECT_SELF      = ({asn}, 150, 1);\n\
         define LC_REJECT_PREFIX    = ({asn}, 150, 2);\n\
         define LC_REJECT_ROA       = ({asn}, 150, 3);\n\
         define LC_REJECT_PATH_LEN  = ({asn}, 150, 4);\n\
         define LC_REJECT_BLACKLIST = ({asn}, 150, 5);\n",
        asn = p.dn42_as,
        node = p.node_id,
    ));
    out.push_str(DN42_VALIDATION_FUNCS);
    out.push_str(&format!(
        "\nfilter dn42_import_filter {{\n    \
         if (bgp_path.len > {max_len}) then {{\n        \
         bgp_large_community.add(LC_REJECT_PATH_LEN);\n        \
         reject \"AS path too long\";\n    }}\n    \
         if (!is_valid_dn42_prefix()) then {{\n        \
         bgp_large_community.add(LC_REJECT_PREFIX);\n        \
         reject \"Invalid DN42 prefix\";\n    }}\n    \
         if (!dn42_roa_valid()) then {{\n        \
         bgp_large_community.add(LC_REJECT_ROA);\n        \
         reject \"ROA check failed\";\n    }}\n    \
         update_local_pref_from_latency();\n    \
         bgp_large_community.add(LC_ACCEPTED_HERE);\n    \
         accept;\n}}\n\
         \n\
         filter dn42_export_filter {{\n    \
         if (!is_valid_dn42_prefix()) then reject;\n    \
         if (source !~ [RTS_BGP, RTS_STATIC]) then reject;\n    \
         accept;\n}}\n",
        max_len = p.as_path_max_len,
    ));
    Ok(out)
}

pub fn render_communities(p: &CommunitiesParams) -> Result<String, Error> {
    if p.dn42_as == 0 {
        return Err(Error::MissingField {
            fragment: "communities",
            field: "dn42_as",
        });
    }
    if p.bandwidth.is_empty() {
        return Err(Error::MissingField {
            fragment: "communities",
            field: "bandwidth",
        });
    }
    let mut out = format!(
        "# =============================================================================\n\
         # Backbone Large Community Definitions\n\
         # For internal cold potato routing - generated by wrend\n\
         # =============================================================================\n\
         \n\
         # Node: {name} (ID: {id}, Region: {region})\n\
         \n\
         define BACKBONE_ASN = {asn};\n",
        name = p.node_name,
        id = p.node_id,
        region = p.region_code,
        asn = p.dn42_as,
    );
    out.push_str(
        r#"
# -----------------------------------------------------------------------------
# Type 1: Continent Origin (for cold potato routing)
# -----------------------------------------------------------------------------
define LC_ORIGIN_AS    = (BACKBONE_ASN, 1, 100);  # Asia
define LC_ORIGIN_NA    = (BACKBONE_ASN, 1, 200);  # North America
define LC_ORIGIN_EU    = (BACKBONE_ASN, 1, 300);  # Europe
define LC_ORIGIN_OC    = (BACKBONE_ASN, 1, 400);  # Oceania
define LC_ORIGIN_OTHER = (BACKBONE_ASN, 1, 500);  # Other (AF, ME, SA, CA)

# -----------------------------------------------------------------------------
# Type 2: Sub-region
# Codes: 1xx=Asia, 2xx=NA, 3xx=EU, 4xx=OC, 5xx=Other
# -----------------------------------------------------------------------------

define LC_REGION_AS_E  = (BACKBONE_ASN, 2, 101);  # East Asia
define LC_REGION_AS_SE = (BACKBONE_ASN, 2, 102);  # Southeast Asia
define LC_REGION_AS_S  = (BACKBONE_ASN, 2, 103);  # South Asia
define LC_REGION_AS_N  = (BACKBONE_ASN, 2, 104);  # North Asia

define LC_REGION_NA_E  = (BACKBONE_ASN, 2, 201);  # East coast
define LC_REGION_NA_C  = (BACKBONE_ASN, 2, 202);  # Central
define LC_REGION_NA_W  = (BACKBONE_ASN, 2, 203);  # West coast
define LC_REGION_CA    = (BACKBONE_ASN, 2, 204);  # Central America
define LC_REGION_SA    = (BACKBONE_ASN, 2, 205);  # South America

define LC_REGION_EU_W  = (BACKBONE_ASN, 2, 301);  # Western Europe
define LC_REGION_EU_C  = (BACKBONE_ASN, 2, 302);  # Central Europe
define LC_REGION_EU_E  = (BACKBONE_ASN, 2, 303);  # Eastern Europe

define LC_REGION_OC    = (BACKBONE_ASN, 2, 401);  # AU, NZ

define LC_REGION_AF    = (BACKBONE_ASN, 2, 501);  # Africa
define LC_REGION_ME    = (BACKBONE_ASN, 2, 502);  # Middle East

# -----------------------------------------------------------------------------
# Type 4: Link Characteristics
# -----------------------------------------------------------------------------
define LC_LINK_INTERCONT = (BACKBONE_ASN, 4, 1);   # Intercontinental link
define LC_LINK_HIGH_LAT  = (BACKBONE_ASN, 4, 2);   # High latency (>200ms)
define LC_LINK_LOW_MTU   = (BACKBONE_ASN, 4, 3);   # Low MTU (<1400)

# -----------------------------------------------------------------------------
# Type 5: Granular Bandwidth (backbone internal)
# Used for iBGP path selection within the backbone
# -----------------------------------------------------------------------------
define LC_BW_10G   = (BACKBONE_ASN, 5, 10000);
define LC_BW_5G    = (BACKBONE_ASN, 5, 5000);
define LC_BW_2G    = (BACKBONE_ASN, 5, 2000);
define LC_BW_1G    = (BACKBONE_ASN, 5, 1000);
define LC_BW_500M  = (BACKBONE_ASN, 5, 500);
define LC_BW_200M  = (BACKBONE_ASN, 5, 200);
define LC_BW_100M  = (BACKBONE_ASN, 5, 100);
define LC_BW_50M   = (BACKBONE_ASN, 5, 50);
define LC_BW_10M   = (BACKBONE_ASN, 5, 10);
"#,
    );
    out.push_str(&format!(
        "\n# Our node's bandwidth class\ndefine OUR_LC_BANDWIDTH = LC_BW_{bw};\n",
        bw = p.bandwidth,
    ));
    out.push_str(
        r#"
# -----------------------------------------------------------------------------
# Helper: Add backbone bandwidth to iBGP routes
# Call this in the iBGP export filter
# -----------------------------------------------------------------------------
function add_backbone_bandwidth() {
    bgp_large_community.delete([(BACKBONE_ASN, 5, *)]);
    bgp_large_community.add(OUR_LC_BANDWIDTH);
}
"#,
    );
    Ok(out)
}

pub fn render_igp(p: &IgpParams) -> Result<String, Error> {
    if p.loopback_range4.is_empty() || p.loopback_range6.is_empty() {
        return Err(Error::MissingField {
            fragment: "igp",
            field: "loopback range",
        });
    }
    let mut out = String::from(
        "# Babel IGP Configuration - generated by wrend\n\
         # Purpose: exchange loopback addresses for iBGP next-hop reachability\n\
         # Mode: P2P (one interface per mesh peer)\n\
         # DO NOT EDIT MANUALLY\n",
    );
    out.push_str(
        r#"
protocol babel babel_igp {
    # Wildcard matches every mesh tunnel interface
    interface "dn42-wg-igp-*" {
        type tunnel;
        rxcost 64;

        # RTT shapes path selection without declaring slow links dead
        rtt cost 32;
        rtt min 200 ms;
        rtt max 10000 ms;

        hello interval 10 s;
        update interval 40 s;
    };

    # Loopback announcement over the dummy interface
    interface "dummy0" {
        type wired;
        rxcost 1;
        hello interval 10 s;
        update interval 40 s;
    };
"#,
    );
    out.push_str(&format!(
        "\n    ipv4 {{\n        \
         import filter {{\n            \
         if net.len = 32 && net ~ {r4} then accept;\n            \
         reject;\n        }};\n        \
         export filter {{\n            \
         if net.len = 32 && net ~ {r4} then accept;\n            \
         reject;\n        }};\n    }};\n\
         \n    ipv6 {{\n        \
         import filter {{\n            \
         if net.len = 128 && net ~ {r6} then accept;\n            \
         reject;\n        }};\n        \
         export filter {{\n            \
         if net.len = 128 && net ~ {r6} then accept;\n            \
         reject;\n        }};\n    }};\n}}\n",
        r4 = p.loopback_range4,
        r6 = p.loopback_range6,
    ));
    Ok(out)
}

pub fn render_cold_potato(p: &ColdPotatoParams) -> Result<String, Error> {
    if p.dn42_as == 0 {
        return Err(Error::MissingField {
            fragment: "cold_potato",
            field: "dn42_as",
        });
    }
    let region: u32 = p.region_code.parse().map_err(|_| {
        Error::MissingField {
            fragment: "cold_potato",
            field: "region_code",
        }
    })?;
    let mut out = format!(
        "# Cold potato routing - generated by wrend\n\
         # Keep traffic on the backbone as long as possible by preferring\n\
         # routes whose origin region matches ours.\n\
         \n\
         define LOCAL_REGION_LC = ({asn}, 2, {region});\n",
        asn = p.dn42_as,
        region = region,
    );
    out.push_str(
        r#"
function cold_potato_pref() {
    if (LOCAL_REGION_LC ~ bgp_large_community) then {
        bgp_local_pref = bgp_local_pref + 50;
    }
}
"#,
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_gen() -> (ConfigGenerator, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let log = wren_common::log::build_logger(std::io::sink());
        let gen = ConfigGenerator::new(dir.path().join("bird"), log).unwrap();
        (gen, dir)
    }

    fn sample_peer() -> PeerParams {
        PeerParams {
            asn: 4242420123,
            description: "PEER-EXAMPLE".into(),
            interface: "wg_u1".into(),
            ipv4: "172.23.0.1".into(),
            ipv6: String::new(),
            ipv6_link_local: "fe80::1".into(),
            extensions: vec!["mp-bgp".into(), "extended-nexthop".into()],
            policy: String::new(),
        }
    }

    #[test]
    fn peer_fragment_written_with_expected_name_and_mode() {
        let (gen, _dir) = test_gen();
        let path = gen.write_peer(&sample_peer()).unwrap();
        assert!(path.ends_with("peers/dn42_4242420123.conf"));
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o644);
        let body = fs::read_to_string(&path).unwrap();
        assert!(body.contains("protocol bgp dn42_4242420123 from dnpeers"));
        assert!(body.contains("neighbor fe80::1%'wg_u1' as 4242420123;"));
        assert!(body.contains("extended next hop on;"));
    }

    #[test]
    fn render_remove_render_is_byte_stable() {
        let (gen, _dir) = test_gen();
        let params = sample_peer();
        let path = gen.write_peer(&params).unwrap();
        let first = fs::read(&path).unwrap();
        gen.remove_peer(params.asn).unwrap();
        assert!(!path.exists());
        gen.write_peer(&params).unwrap();
        assert_eq!(fs::read(&path).unwrap(), first);
    }

    #[test]
    fn remove_is_idempotent() {
        let (gen, _dir) = test_gen();
        gen.remove_peer(65000).unwrap();
        gen.remove_peer(65000).unwrap();
        gen.remove_ibgp(9).unwrap();
    }

    #[test]
    fn peer_without_any_neighbor_address_is_rejected() {
        let (gen, _dir) = test_gen();
        let params = PeerParams {
            asn: 65001,
            ..Default::default()
        };
        assert!(matches!(
            gen.write_peer(&params),
            Err(Error::MissingField { .. })
        ));
        assert!(!gen.peer_path(65001).exists());
    }

    #[test]
    fn rr_client_directive_follows_flag() {
        let with = render_ibgp(&IbgpParams {
            node_id: 2,
            node_name: "fra1".into(),
            loopback_ipv6: "fd00:4242:7777:301:1::1".into(),
            local_asn: 4242420998,
            rr_client: true,
        })
        .unwrap();
        assert!(with.contains("rr client;"));
        assert!(with.contains("neighbor fd00:4242:7777:301:1::1 as 4242420998;"));

        let without = render_ibgp(&IbgpParams {
            node_id: 2,
            node_name: "fra1".into(),
            loopback_ipv6: "fd00:4242:7777:301:1::1".into(),
            local_asn: 4242420998,
            rr_client: false,
        })
        .unwrap();
        assert!(!without.contains("rr client;"));
    }

    #[test]
    fn cleanup_removes_only_stale_ids() {
        let (gen, _dir) = test_gen();
        for id in [2u8, 3, 5] {
            gen.write_ibgp(&IbgpParams {
                node_id: id,
                node_name: format!("node{id}"),
                loopback_ipv6: format!("fd00:4242:7777::{id}"),
                local_asn: 4242420998,
                rr_client: false,
            })
            .unwrap();
        }
        // A foreign file must be left alone.
        fs::write(gen.ibgp_path(0).parent().unwrap().join("notes.txt"), "x")
            .unwrap();

        let current: BTreeSet<u8> = [2u8, 3].into_iter().collect();
        let mut removed = gen.cleanup_stale(&current).unwrap();
        removed.sort();
        assert_eq!(removed, vec![5]);
        assert!(gen.ibgp_path(2).exists());
        assert!(gen.ibgp_path(3).exists());
        assert!(!gen.ibgp_path(5).exists());
    }

    #[test]
    fn filters_carry_hash_and_policy_inputs() {
        let rendered = render_filters(&FiltersParams {
            node_name: "nue1".into(),
            node_id: 4,
            config_hash: "deadbeef".into(),
            dn42_as: 4242420998,
            as_path_max_len: 15,
        })
        .unwrap();
        assert!(rendered.contains("Config Hash: deadbeef"));
        assert!(rendered.contains("bgp_path.len > 15"));
        assert!(rendered.contains("(4242420998, 100, 4)"));
        assert!(rendered.contains("define GRACEFUL_SHUTDOWN = (65535, 0);"));
    }

    #[test]
    fn igp_fragment_bounds_loopback_ranges() {
        let rendered = render_igp(&IgpParams {
            loopback_range4: "172.22.188.0/26".into(),
            loopback_range6: "fd00:4242:7777::/48".into(),
        })
        .unwrap();
        assert!(rendered.contains("net ~ 172.22.188.0/26"));
        assert!(rendered.contains("net ~ fd00:4242:7777::/48"));
        assert!(rendered.contains("interface \"dn42-wg-igp-*\""));
    }

    #[test]
    fn communities_require_bandwidth_class() {
        let params = CommunitiesParams {
            node_name: "nue1".into(),
            node_id: 4,
            region_code: "302".into(),
            bandwidth: String::new(),
            dn42_as: 4242420998,
        };
        assert!(matches!(
            render_communities(&params),
            Err(Error::MissingField { .. })
        ));
        let ok = render_communities(&CommunitiesParams {
            bandwidth: "1G".into(),
            ..params
        })
        .unwrap();
        assert!(ok.contains("define OUR_LC_BANDWIDTH = LC_BW_1G;"));
    }

    #[test]
    fn cold_potato_rejects_non_numeric_region() {
        assert!(render_cold_potato(&ColdPotatoParams {
            dn42_as: 4242420998,
            region_code: "eu-west".into(),
        })
        .is_err());
        let ok = render_cold_potato(&ColdPotatoParams {
            dn42_as: 4242420998,
            region_code: "302".into(),
        })
        .unwrap();
        assert!(ok.contains("(4242420998, 2, 302)"));
    }
}
