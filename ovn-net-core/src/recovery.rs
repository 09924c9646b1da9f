//! Recovery: rehydrate the driver's in-memory index from the persistent
//! store at process start (spec §4.G). Runs before the driver accepts
//! traffic; failure here is non-fatal — the daemon starts with whatever
//! it managed to load and reconstructs the rest on demand.

use crate::model::{Endpoint, Network};
use crate::ovs::OvsClient;
use crate::store::Store;
use std::collections::HashMap;
use tracing::{info, warn};

pub struct Recovered {
    pub networks: HashMap<String, Network>,
    pub endpoints: HashMap<(String, String), Endpoint>,
}

/// Load networks and endpoints from `store`, verifying (but not
/// recreating) each network's OVS bridge. Veth pairs and OVS ports are
/// never recreated here — the container engine re-issues `Join` for
/// every live container at startup, which regenerates that state.
pub async fn rehydrate(store: &Store, ovs: &OvsClient) -> Recovered {
    let mut networks = HashMap::new();
    let mut endpoints = HashMap::new();

    match store.list_networks() {
        Ok(loaded) => {
            let existing_bridges = ovs.list_bridges().await.unwrap_or_else(|e| {
                warn!("recovery: could not list OVS bridges: {}", e);
                Vec::new()
            });
            for net in loaded {
                if !existing_bridges.iter().any(|b| b == &net.bridge) {
                    warn!(
                        "recovery: bridge '{}' for network {} is missing, deferring recreation",
                        net.bridge, net.id
                    );
                }
                networks.insert(net.id.clone(), net);
            }
        }
        Err(e) => warn!("recovery: failed to list networks: {}", e),
    }

    match store.list_endpoints() {
        Ok(loaded) => {
            for ep in loaded {
                endpoints.insert((ep.network_id.clone(), ep.id.clone()), ep);
            }
        }
        Err(e) => warn!("recovery: failed to list endpoints: {}", e),
    }

    info!(
        "recovery: rehydrated {} network(s), {} endpoint(s)",
        networks.len(),
        endpoints.len()
    );

    Recovered { networks, endpoints }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PoolDescriptor;

    #[tokio::test]
    async fn rehydrate_on_empty_store_yields_empty_index() {
        let dir = std::env::temp_dir().join("ovn-net-recovery-test-empty");
        let store = Store::new(dir);
        let ovs = OvsClient::with_socket_path("/nonexistent/ovsdb.sock");
        let recovered = rehydrate(&store, &ovs).await;
        assert!(recovered.networks.is_empty());
        assert!(recovered.endpoints.is_empty());
    }

    #[tokio::test]
    async fn rehydrate_loads_persisted_network() {
        let dir = std::env::temp_dir().join("ovn-net-recovery-test-net");
        let store = Store::new(&dir);
        store
            .save_network(&Network {
                id: "N1".to_string(),
                bridge: "br-int".to_string(),
                vlan: None,
                mtu: None,
                tenant_id: None,
                ovn: None,
                ipv4: PoolDescriptor { subnet: "10.0.0.0/24".to_string(), gateway: "10.0.0.1".to_string() },
                ipv6: None,
                dhcp_enabled: false,
                options: std::collections::HashMap::new(),
            })
            .unwrap();

        let ovs = OvsClient::with_socket_path("/nonexistent/ovsdb.sock");
        let recovered = rehydrate(&store, &ovs).await;
        assert_eq!(recovered.networks.len(), 1);
        assert!(recovered.networks.contains_key("N1"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
