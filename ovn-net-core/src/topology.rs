//! Topology composer: stitches VPC-level routers to a shared transit
//! logical switch plus an external gateway router (spec §4.E).
//!
//! Both entry points are pure functions of the `OvnClient`, called by the
//! driver state machine — there is no state held here beyond the
//! constants that make the layout deterministic.

use crate::model::{strip_prefix, Network};
use crate::ovn::{LogicalPortOptions, OvnClient};
use crate::error::{Error, Result};
use std::net::Ipv4Addr;
use tracing::info;

const GATEWAY_ROUTER: &str = "lr-gateway";

/// Deterministic locally-administered MAC derived from a seed string
/// (router port name, switch name, ...). Collides if two seeds hash to
/// the same suffix; acceptable for the deployment sizes this daemon
/// targets, flagged as a documented limitation rather than solved with a
/// MAC allocator.
pub(crate) fn deterministic_mac(seed: &str) -> String {
    let mut hash: u32 = 0;
    for b in seed.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(b as u32);
    }
    let bytes = hash.to_be_bytes();
    format!("02:00:{:02x}:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2], bytes[3])
}

/// Normalize a CIDR's network address to `.1`, keeping the prefix length.
fn dot_one(cidr: &str) -> Result<String> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| Error::invalid_config(format!("not a CIDR: {cidr}")))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::invalid_config(format!("malformed IPv4 address: {cidr}")))?;
    let octets = addr.octets();
    Ok(format!("{}.{}.{}.1/{}", octets[0], octets[1], octets[2], prefix))
}

/// Summarize a VPC subnet to its containing `/16` (spec §4.E step 5: the
/// gateway router's return route covers the VPC's summary prefix, not its
/// exact per-endpoint subnet, so a VPC can later grow more subnets under
/// the same summary without a route update on `lr-gateway`).
fn summary_subnet(cidr: &str) -> Result<String> {
    let (addr, _prefix) = cidr
        .split_once('/')
        .ok_or_else(|| Error::invalid_config(format!("not a CIDR: {cidr}")))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::invalid_config(format!("malformed IPv4 address: {cidr}")))?;
    let octets = addr.octets();
    Ok(format!("{}.{}.0.0/16", octets[0], octets[1]))
}

/// Deterministic transit IP assignment for a VPC router, keyed by a
/// substring of its name. Documented in spec.md §4.E as "simple
/// deterministic, to be replaced by real IPAM" — not a production IPAM.
fn transit_ip_for_router(router_name: &str) -> &'static str {
    if router_name.contains("vpc-a") {
        "192.168.100.10/24"
    } else if router_name.contains("vpc-b") {
        "192.168.100.20/24"
    } else {
        "192.168.100.100/24"
    }
}

/// Ensure the transit logical switch and gateway router exist, and that
/// the gateway router has a port onto the transit subnet (spec §4.E,
/// "Transit creation").
pub async fn ensure_transit(ovn: &OvnClient, network: &Network) -> Result<()> {
    let switch = network.ovn.as_ref().map(|o| o.switch.as_str()).unwrap_or(network.id.as_str());

    ovn.create_logical_switch(switch, &[("role", "transit")]).await?;
    ovn.create_logical_router(GATEWAY_ROUTER, &[]).await?;

    let gateway_cidr = dot_one(&network.ipv4.subnet)?;
    let router_port = format!("rp-lr-gateway-{switch}");
    let mac = deterministic_mac(&router_port);

    ovn.create_logical_router_port(GATEWAY_ROUTER, &router_port, &mac, &[gateway_cidr])
        .await?;

    let switch_port = format!("sp-{switch}-lr-gateway");
    let opts = LogicalPortOptions { router_port: Some(router_port.clone()), is_router_type: true };
    ovn.create_logical_port(switch, &switch_port, "", "", &opts).await?;

    if let Some(ext_gw) = network.ovn.as_ref().and_then(|o| o.external_gateway.as_deref()) {
        let next_hop = strip_prefix(ext_gw);
        ovn.add_static_route(GATEWAY_ROUTER, "0.0.0.0/0", &next_hop).await?;
        info!("transit switch {} default route -> {}", switch, next_hop);
    }

    Ok(())
}

/// Attach a non-transit VPC router to the transit switch (spec §4.E,
/// "VPC-to-transit attach"). `vpc_router` is the VPC network's own
/// `ovn.router` name; `transit` is the resolved transit network.
pub async fn attach_to_transit(
    ovn: &OvnClient,
    transit: &Network,
    vpc_router: &str,
    vpc_subnet: &str,
) -> Result<()> {
    let transit_switch = transit
        .ovn
        .as_ref()
        .map(|o| o.switch.as_str())
        .unwrap_or(transit.id.as_str());

    let transit_ip = transit_ip_for_router(vpc_router);
    let transit_ip_only = transit_ip.split('/').next().unwrap_or(transit_ip);

    let router_port = format!("rp-{vpc_router}-transit");
    let mac = deterministic_mac(&router_port);
    ovn.create_logical_router_port(vpc_router, &router_port, &mac, &[transit_ip.to_string()])
        .await?;

    let switch_port = format!("sp-transit-{vpc_router}");
    let opts = LogicalPortOptions { router_port: Some(router_port.clone()), is_router_type: true };
    ovn.create_logical_port(transit_switch, &switch_port, "", "", &opts).await?;

    ovn.add_static_route(vpc_router, "0.0.0.0/0", "192.168.100.1").await?;

    let summary = summary_subnet(vpc_subnet)?;
    ovn.add_static_route(GATEWAY_ROUTER, &summary, transit_ip_only).await?;

    info!(
        "attached router {} ({}) to transit switch {}",
        vpc_router, transit_ip, transit_switch
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_one_normalizes_host_bits() {
        assert_eq!(dot_one("10.9.0.0/24").unwrap(), "10.9.0.1/24");
        assert_eq!(dot_one("10.9.0.55/24").unwrap(), "10.9.0.1/24");
    }

    #[test]
    fn dot_one_rejects_non_cidr() {
        assert!(dot_one("10.9.0.0").is_err());
    }

    #[test]
    fn summary_subnet_covers_the_containing_16() {
        assert_eq!(summary_subnet("10.0.1.0/24").unwrap(), "10.0.0.0/16");
        assert_eq!(summary_subnet("10.0.200.0/24").unwrap(), "10.0.0.0/16");
    }

    #[test]
    fn summary_subnet_rejects_non_cidr() {
        assert!(summary_subnet("10.0.1.0").is_err());
    }

    #[test]
    fn transit_ip_is_deterministic_by_name_substring() {
        assert_eq!(transit_ip_for_router("r-vpc-a-1"), "192.168.100.10/24");
        assert_eq!(transit_ip_for_router("r-vpc-b-1"), "192.168.100.20/24");
        assert_eq!(transit_ip_for_router("r-other"), "192.168.100.100/24");
    }

    #[test]
    fn gateway_mac_is_stable_for_same_seed() {
        assert_eq!(deterministic_mac("rp-lr-gateway-ts-1"), deterministic_mac("rp-lr-gateway-ts-1"));
    }
}
