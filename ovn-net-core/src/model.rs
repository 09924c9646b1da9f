//! Data model: networks and endpoints as persisted and as held in memory.
//!
//! Every field that was not present in an earlier version of this struct
//! carries `#[serde(default)]` so a store record written by an older binary
//! still deserializes (spec: readers tolerate unknown/missing fields).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// IPv4 or IPv6 pool descriptor handed to us by the container engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolDescriptor {
    /// CIDR, e.g. "10.9.0.0/24".
    pub subnet: String,
    /// Gateway address, no prefix, e.g. "10.9.0.1".
    pub gateway: String,
}

/// `ovn.role` values recognized on `CreateNetwork`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NetworkRole {
    Transit,
}

/// OVN connection details for an OVN-backed network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OvnConfig {
    pub switch: String,
    pub router: Option<String>,
    pub role: Option<NetworkRole>,
    pub external_gateway: Option<String>,
    pub transit_network: Option<String>,
    pub nb_connection: String,
    pub sb_connection: String,
    #[serde(default)]
    pub auto_create: bool,
}

/// One logical L2 segment visible to the container engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    #[serde(default = "default_bridge")]
    pub bridge: String,
    #[serde(default)]
    pub vlan: Option<u16>,
    #[serde(default)]
    pub mtu: Option<u32>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub ovn: Option<OvnConfig>,
    pub ipv4: PoolDescriptor,
    #[serde(default)]
    pub ipv6: Option<PoolDescriptor>,
    /// `true` when `dhcp=ovn` was set on `CreateNetwork` — the network's
    /// addresses come from OVN's built-in DHCP rather than a caller-side
    /// IPAM driver, so `Join` tells the engine to disable its own
    /// gateway service for this endpoint.
    #[serde(default)]
    pub dhcp_enabled: bool,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

pub fn default_bridge() -> String {
    "br-int".to_string()
}

impl Network {
    pub fn is_transit(&self) -> bool {
        matches!(
            self.ovn.as_ref().and_then(|o| o.role),
            Some(NetworkRole::Transit)
        )
    }

    pub fn is_ovn_backed(&self) -> bool {
        self.ovn.is_some()
    }
}

/// One container's attachment to one network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub network_id: String,
    #[serde(default)]
    pub ipv4: Option<String>,
    #[serde(default)]
    pub ipv6: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub host_veth: Option<String>,
    #[serde(default)]
    pub peer_veth: Option<String>,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Endpoint {
    /// `lsp-<first-12-chars-of-endpoint-id>`, the binding key for OVN.
    pub fn logical_port_name(&self) -> String {
        format!("lsp-{}", short_id(&self.id, 12))
    }

    /// `veth<eid7>` / `veth<eid7>-p`, the host/peer veth pair names.
    pub fn veth_names(&self) -> (String, String) {
        let tag = short_id(&self.id, 7);
        (format!("veth{tag}"), format!("veth{tag}-p"))
    }
}

/// First `n` hex characters of an id, lowercased, no separators.
pub fn short_id(id: &str, n: usize) -> String {
    id.chars().filter(|c| c.is_ascii_hexdigit()).take(n).collect()
}

/// Drop a `/prefix` suffix, if any. Used wherever a config value is
/// declared as a CIDR but consumed as a bare address (OVN static-route
/// next hops, gateway-IP equality checks).
pub fn strip_prefix(addr: &str) -> String {
    addr.split('/').next().unwrap_or(addr).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: &str) -> Endpoint {
        Endpoint {
            id: id.to_string(),
            network_id: "N1".to_string(),
            ipv4: None,
            ipv6: None,
            mac: None,
            host_veth: None,
            peer_veth: None,
            options: HashMap::new(),
        }
    }

    #[test]
    fn logical_port_name_uses_first_12_hex_chars() {
        let e = endpoint("abcdef0123456789");
        assert_eq!(e.logical_port_name(), "lsp-abcdef012345");
    }

    #[test]
    fn veth_names_use_first_7_hex_chars() {
        let e = endpoint("abcdef0123456789");
        let (host, peer) = e.veth_names();
        assert_eq!(host, "vethabcdef0");
        assert_eq!(peer, "vethabcdef0-p");
    }

    #[test]
    fn strip_prefix_drops_cidr_suffix() {
        assert_eq!(strip_prefix("192.168.100.254/24"), "192.168.100.254");
        assert_eq!(strip_prefix("192.168.100.254"), "192.168.100.254");
    }

    #[test]
    fn forward_compatible_deserialization_ignores_unknown_fields() {
        let json = r#"{
            "id": "N1",
            "ipv4": {"subnet": "10.9.0.0/24", "gateway": "10.9.0.1"},
            "some_future_field": 42
        }"#;
        let net: Network = serde_json::from_str(json).unwrap();
        assert_eq!(net.bridge, "br-int");
        assert!(!net.is_transit());
        assert!(!net.is_ovn_backed());
    }
}
