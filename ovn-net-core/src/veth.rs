//! Kernel-level veth pair management via rtnetlink.
//!
//! Separate from `ovs.rs` because this talks rtnetlink, not OVSDB — same
//! §4.B responsibility ("all local OVSDB operations reachable via the
//! host's OVS control socket" plus veth pairs), different wire protocol.

use crate::error::{Error, Result};
use futures::TryStreamExt;
use netlink_packet_route::link::LinkAttribute;
use tracing::debug;

pub async fn create_veth_pair(host: &str, peer: &str) -> Result<()> {
    let (connection, handle, _) = rtnetlink::new_connection().map_err(Error::Io)?;
    tokio::spawn(connection);

    if link_index(&handle, host).await?.is_some() {
        return Err(Error::already_exists(format!("veth '{host}'")));
    }

    handle
        .link()
        .add()
        .veth(host.to_string(), peer.to_string())
        .execute()
        .await
        .map_err(|e| Error::unavailable(format!("create veth pair {host}/{peer}: {e}")))?;

    debug!("created veth pair {}/{}", host, peer);
    Ok(())
}

pub async fn delete_veth_pair(host: &str, _peer: &str) -> Result<()> {
    let (connection, handle, _) = rtnetlink::new_connection().map_err(Error::Io)?;
    tokio::spawn(connection);

    // Deleting either end of a veth pair removes both.
    match link_index(&handle, host).await? {
        Some(index) => {
            handle
                .link()
                .del(index)
                .execute()
                .await
                .map_err(|e| Error::unavailable(format!("delete veth '{host}': {e}")))?;
            Ok(())
        }
        None => Ok(()), // idempotent
    }
}

pub async fn link_up(name: &str) -> Result<()> {
    let (connection, handle, _) = rtnetlink::new_connection().map_err(Error::Io)?;
    tokio::spawn(connection);

    let index = link_index(&handle, name)
        .await?
        .ok_or_else(|| Error::not_found(format!("interface '{name}'")))?;

    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .map_err(|e| Error::unavailable(format!("bring up '{name}': {e}")))?;
    Ok(())
}

/// Kernel-assigned MAC address of a link, in colon-separated lowercase hex.
pub async fn link_mac(name: &str) -> Result<String> {
    let (connection, handle, _) = rtnetlink::new_connection().map_err(Error::Io)?;
    tokio::spawn(connection);

    let mut links = handle.link().get().match_name(name.to_string()).execute();
    let link = links
        .try_next()
        .await
        .map_err(|e| Error::unavailable(format!("query link '{name}': {e}")))?
        .ok_or_else(|| Error::not_found(format!("interface '{name}'")))?;

    for attr in &link.attributes {
        if let LinkAttribute::Address(bytes) = attr {
            return Ok(bytes
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(":"));
        }
    }

    Err(Error::internal(format!("no MAC address reported for '{name}'")))
}

async fn link_index(handle: &rtnetlink::Handle, name: &str) -> Result<Option<u32>> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(Some(link)) => Ok(Some(link.header.index)),
        Ok(None) => Ok(None),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Smoke test against loopback, which always exists — mirrors the
    // teacher's rtnetlink test style (no mocking library, real kernel
    // state on a known-present interface).
    #[tokio::test(flavor = "current_thread")]
    async fn link_mac_on_loopback_is_well_formed() {
        let mac = link_mac("lo").await.expect("loopback always exists");
        assert_eq!(mac.split(':').count(), 6);
    }
}
