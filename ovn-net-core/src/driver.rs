//! Driver state machine: the network-driver RPC surface, serialized
//! through one mutex (spec §4.F). Binds the store, OVS client, OVN
//! client(s), bootstrapper and topology composer together.

use crate::bootstrap::{self, ContainerEngine};
use crate::error::{Error, Result};
use crate::model::{strip_prefix, Endpoint, Network, NetworkRole, OvnConfig, PoolDescriptor};
use crate::ovn::{LogicalPortOptions, OvnClient};
use crate::ovs::{OvsClient, PortOptions};
use crate::store::Store;
use crate::topology;
use crate::veth;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Reported on `NetworkDriver.GetCapabilities` — both scopes are local,
/// per spec §4.F (this is not a swarm-wide/global-scope driver).
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Capabilities {
    pub scope: &'static str,
    pub connectivity_scope: &'static str,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self { scope: "local", connectivity_scope: "local" }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateNetworkRequest {
    pub network_id: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
    #[serde(default, rename = "IPv4Data")]
    pub ipv4_data: Vec<IpamData>,
    #[serde(default, rename = "IPv6Data")]
    pub ipv6_data: Vec<IpamData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpamData {
    pub pool: String,
    pub gateway: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteNetworkRequest {
    pub network_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateEndpointRequest {
    pub network_id: String,
    pub endpoint_id: String,
    #[serde(default)]
    pub interface: InterfaceHint,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InterfaceHint {
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default, rename = "AddressIPv6")]
    pub address_ipv6: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateEndpointResponse {
    pub interface: InterfaceHint,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinRequest {
    pub network_id: String,
    pub endpoint_id: String,
    pub sandbox_key: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinResponse {
    pub interface_name: InterfaceName,
    pub gateway: String,
    #[serde(rename = "GatewayIPv6")]
    pub gateway_ipv6: String,
    pub disable_gateway_service: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InterfaceName {
    pub src_name: String,
    pub dst_prefix: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LeaveRequest {
    pub network_id: String,
    pub endpoint_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteEndpointRequest {
    pub network_id: String,
    pub endpoint_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointInfoRequest {
    pub network_id: String,
    pub endpoint_id: String,
}

#[derive(Debug, Serialize)]
pub struct EndpointInfoResponse {
    #[serde(rename = "Value")]
    pub value: HashMap<String, String>,
}

struct DriverState {
    networks: HashMap<String, Network>,
    endpoints: HashMap<(String, String), Endpoint>,
    ovn_clients: HashMap<(String, String), Arc<OvnClient>>,
}

pub struct Driver {
    store: Store,
    ovs: OvsClient,
    engine: Arc<dyn ContainerEngine>,
    state: Mutex<DriverState>,
}

impl Driver {
    pub fn new(store: Store, ovs: OvsClient, engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            store,
            ovs,
            engine,
            state: Mutex::new(DriverState {
                networks: HashMap::new(),
                endpoints: HashMap::new(),
                ovn_clients: HashMap::new(),
            }),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Rehydrate in-memory state from the store (spec §4.G). Failure is
    /// non-fatal: the daemon starts with whatever index it managed to
    /// build and reconstructs the rest on demand.
    pub async fn recover(&self) {
        let recovered = crate::recovery::rehydrate(&self.store, &self.ovs).await;
        let mut state = self.state.lock().await;
        state.networks = recovered.networks;
        state.endpoints = recovered.endpoints;
    }

    pub async fn create_network(&self, req: CreateNetworkRequest) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.networks.contains_key(&req.network_id) {
            return Err(Error::already_exists(format!("network '{}'", req.network_id)));
        }

        let ipv4 = req
            .ipv4_data
            .first()
            .map(|d| PoolDescriptor { subnet: d.pool.clone(), gateway: strip_prefix(&d.gateway) })
            .ok_or_else(|| Error::invalid_config("CreateNetwork requires at least one IPv4Data entry"))?;
        let ipv6 = req
            .ipv6_data
            .first()
            .map(|d| PoolDescriptor { subnet: d.pool.clone(), gateway: strip_prefix(&d.gateway) });

        let mut options = req.options;
        let bridge = options.remove("bridge").unwrap_or_else(crate::model::default_bridge);
        let tenant_id = options.remove("tenant_id");
        let vlan = options
            .remove("vlan")
            .map(|v| v.parse::<u16>())
            .transpose()
            .map_err(|_| Error::invalid_config("vlan must be a decimal integer"))?;
        let mtu = options
            .remove("mtu")
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|_| Error::invalid_config("mtu must be a decimal integer"))?;

        let switch = options.remove("ovn.switch");
        let router = options.remove("ovn.router");
        let role = match options.remove("ovn.role").as_deref() {
            Some("transit") => Some(NetworkRole::Transit),
            Some(other) => return Err(Error::invalid_config(format!("unknown ovn.role '{other}'"))),
            None => None,
        };
        let external_gateway = options.remove("ovn.external_gateway");
        let transit_network = options.remove("ovn.transit_network");
        let nb_connection = options.remove("ovn.nb_connection");
        let sb_connection = options.remove("ovn.sb_connection");
        let auto_create = options
            .remove("ovn.auto_create")
            .map(|v| v == "true")
            .unwrap_or(false);
        let mirror_ports = options.remove("mirror.ports");
        let mirror_dest = options.remove("mirror.dest");
        let dhcp = options.remove("dhcp");

        let ovn_backed = switch.is_some() || role.is_some();
        let is_transit = matches!(role, Some(NetworkRole::Transit));

        let ovn_config = if ovn_backed {
            let switch = switch.ok_or_else(|| Error::invalid_config("ovn.switch is required"))?;
            let nb_connection = nb_connection
                .ok_or_else(|| Error::invalid_config("ovn.nb_connection is required when ovn.switch is set"))?;
            let sb_connection = sb_connection
                .ok_or_else(|| Error::invalid_config("ovn.sb_connection is required when ovn.switch is set"))?;
            Some(OvnConfig {
                switch,
                router: router.clone(),
                role,
                external_gateway,
                transit_network: transit_network.clone(),
                nb_connection,
                sb_connection,
                auto_create,
            })
        } else if !is_transit {
            None
        } else {
            return Err(Error::invalid_config("ovn.switch is required for a transit network"));
        };

        let network = Network {
            id: req.network_id.clone(),
            bridge: bridge.clone(),
            vlan,
            mtu,
            tenant_id,
            ovn: ovn_config,
            ipv4,
            ipv6,
            dhcp_enabled: dhcp.as_deref() == Some("ovn"),
            options,
        };

        self.ovs.ensure_bridge(&bridge).await?;

        if let Some(ovn) = network.ovn.clone() {
            let ovn_client = self.ovn_client_for(&mut state, &ovn).await?;

            if network.is_transit() {
                topology::ensure_transit(&ovn_client, &network).await?;
            } else {
                ovn_client
                    .create_logical_switch(&ovn.switch, &[("network_id", network.id.as_str())])
                    .await?;

                if dhcp.as_deref() == Some("ovn") {
                    let server_mac = topology::deterministic_mac(&format!("dhcp-{}", ovn.switch));
                    ovn_client
                        .create_dhcp_options(&network.ipv4.subnet, &server_mac, &network.ipv4.gateway, &[])
                        .await?;
                }

                if let Some(router_name) = &router {
                    ovn_client.create_logical_router(router_name, &[]).await?;
                    let router_port = format!("rp-{router_name}-{}", ovn.switch);
                    let mac = topology::deterministic_mac(&router_port);
                    let gateway_cidr = format!(
                        "{}/{}",
                        network.ipv4.gateway,
                        network.ipv4.subnet.rsplit('/').next().unwrap_or("24")
                    );
                    ovn_client
                        .create_logical_router_port(router_name, &router_port, &mac, &[gateway_cidr])
                        .await?;
                    let switch_port = format!("sp-{}-{router_name}", ovn.switch);
                    let opts = LogicalPortOptions {
                        router_port: Some(router_port.clone()),
                        is_router_type: true,
                    };
                    ovn_client
                        .create_logical_port(&ovn.switch, &switch_port, "", "", &opts)
                        .await?;

                    if let Some(transit_name) = &transit_network {
                        let transit = state
                            .networks
                            .get(transit_name)
                            .cloned()
                            .ok_or_else(|| Error::invalid_config(format!("transit network '{transit_name}' not known")))?;
                        topology::attach_to_transit(&ovn_client, &transit, router_name, &network.ipv4.subnet)
                            .await?;
                    }
                }
            }
        }

        if let (Some(ports), Some(dest)) = (&mirror_ports, &mirror_dest) {
            for port in ports.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let mirror_name = format!("mirror-{}-{port}", network.id);
                if let Err(e) = self.ovs.create_mirror(&bridge, &mirror_name, port, dest).await {
                    warn!("mirror setup for {} failed: {}", port, e);
                }
            }
        }

        if let Err(e) = self.store.save_network(&network) {
            warn!("failed to persist network {}: {}", network.id, e);
        }
        state.networks.insert(network.id.clone(), network);
        Ok(())
    }

    pub async fn delete_network(&self, req: DeleteNetworkRequest) -> Result<()> {
        let mut state = self.state.lock().await;
        if state
            .endpoints
            .keys()
            .any(|(network_id, _)| network_id == &req.network_id)
        {
            return Err(Error::busy(format!("network '{}' has live endpoints", req.network_id)));
        }

        state.networks.remove(&req.network_id);
        self.store.delete_network(&req.network_id)?;
        Ok(())
    }

    pub async fn create_endpoint(&self, req: CreateEndpointRequest) -> Result<CreateEndpointResponse> {
        let mut state = self.state.lock().await;
        if !state.networks.contains_key(&req.network_id) {
            return Err(Error::not_found(format!("network '{}'", req.network_id)));
        }

        let endpoint = Endpoint {
            id: req.endpoint_id.clone(),
            network_id: req.network_id.clone(),
            ipv4: req.interface.address.clone(),
            ipv6: req.interface.address_ipv6.clone(),
            mac: req.interface.mac_address.clone(),
            host_veth: None,
            peer_veth: None,
            options: req.options,
        };

        let response_mac = endpoint.mac.clone();
        if let Err(e) = self.store.save_endpoint(&endpoint) {
            warn!("failed to persist endpoint {}: {}", endpoint.id, e);
        }
        state
            .endpoints
            .insert((req.network_id, req.endpoint_id), endpoint);

        Ok(CreateEndpointResponse {
            interface: InterfaceHint { mac_address: response_mac, address: None, address_ipv6: None },
        })
    }

    pub async fn join(&self, req: JoinRequest) -> Result<JoinResponse> {
        let mut state = self.state.lock().await;
        let network = state
            .networks
            .get(&req.network_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("network '{}'", req.network_id)))?;
        let mut endpoint = state
            .endpoints
            .get(&(req.network_id.clone(), req.endpoint_id.clone()))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("endpoint '{}'", req.endpoint_id)))?;

        let (host_veth, peer_veth) = endpoint.veth_names();
        veth::create_veth_pair(&host_veth, &peer_veth).await?;

        let logical_port = endpoint.logical_port_name();
        let mut port_options = PortOptions {
            container_id: endpoint.options.get("container_id").cloned(),
            network_id: Some(network.id.clone()),
            tenant_id: network.tenant_id.clone(),
            iface_id: None,
            tag: network.vlan,
        };
        if network.is_ovn_backed() {
            port_options.iface_id = Some(logical_port.clone());
        }

        if let Err(e) = self.ovs.add_port(&network.bridge, &peer_veth, &port_options).await {
            let _ = veth::delete_veth_pair(&host_veth, &peer_veth).await;
            return Err(e);
        }

        if let Some(ovn) = network.ovn.clone() {
            let ovn_client = self.ovn_client_for(&mut state, &ovn).await?;

            let join_result: Result<()> = async {
                let mac = veth::link_mac(&host_veth).await?;
                endpoint.mac.get_or_insert_with(|| mac.clone());
                let ip = endpoint.ipv4.clone().unwrap_or_default();

                ovn_client
                    .create_logical_port(&ovn.switch, &logical_port, &mac, &ip, &LogicalPortOptions::default())
                    .await?;

                if network.is_transit() {
                    if let (Some(ext_gw), Some(ip)) = (&ovn.external_gateway, &endpoint.ipv4) {
                        if strip_prefix(ip) == strip_prefix(ext_gw) {
                            ovn_client.disable_port_security(&logical_port).await?;
                        }
                    }
                }
                Ok(())
            }
            .await;

            if let Err(e) = join_result {
                let _ = self.ovs.delete_port(&network.bridge, &peer_veth).await;
                let _ = veth::delete_veth_pair(&host_veth, &peer_veth).await;
                return Err(Error::unavailable(format!("OVN bind for {logical_port} failed: {e}")));
            }
        }

        endpoint.host_veth = Some(host_veth.clone());
        endpoint.peer_veth = Some(peer_veth.clone());
        if let Err(e) = self.store.save_endpoint(&endpoint) {
            warn!("failed to persist endpoint {}: {}", endpoint.id, e);
        }

        let disable_gateway_service = network.dhcp_enabled;

        state
            .endpoints
            .insert((req.network_id, req.endpoint_id), endpoint);

        Ok(JoinResponse {
            interface_name: InterfaceName { src_name: host_veth, dst_prefix: "eth".to_string() },
            gateway: network.ipv4.gateway.clone(),
            gateway_ipv6: network.ipv6.as_ref().map(|p| p.gateway.clone()).unwrap_or_default(),
            disable_gateway_service,
        })
    }

    pub async fn leave(&self, req: LeaveRequest) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = (req.network_id.clone(), req.endpoint_id.clone());
        let Some(endpoint) = state.endpoints.get(&key).cloned() else {
            return Ok(()); // idempotent
        };
        let network = state.networks.get(&req.network_id).cloned();

        if let Some(network) = &network {
            if network.is_ovn_backed() {
                if let Some(ovn) = network.ovn.clone() {
                    if let Ok(ovn_client) = self.ovn_client_for(&mut state, &ovn).await {
                        let _ = ovn_client.delete_logical_port(&endpoint.logical_port_name()).await;
                    }
                }
            }
        }

        if let (Some(network), Some(peer)) = (&network, &endpoint.peer_veth) {
            let _ = self.ovs.delete_port(&network.bridge, peer).await;
        }
        if let (Some(host), Some(peer)) = (&endpoint.host_veth, &endpoint.peer_veth) {
            let _ = veth::delete_veth_pair(host, peer).await;
        }

        if let Some(mut ep) = state.endpoints.remove(&key) {
            ep.host_veth = None;
            ep.peer_veth = None;
            state.endpoints.insert(key, ep.clone());
            if let Err(e) = self.store.save_endpoint(&ep) {
                warn!("failed to persist endpoint {} after leave: {}", ep.id, e);
            }
        }
        Ok(())
    }

    pub async fn delete_endpoint(&self, req: DeleteEndpointRequest) -> Result<()> {
        let key = (req.network_id.clone(), req.endpoint_id.clone());
        self.leave(LeaveRequest { network_id: req.network_id.clone(), endpoint_id: req.endpoint_id.clone() })
            .await?;

        let mut state = self.state.lock().await;
        state.endpoints.remove(&key);
        self.store.delete_endpoint(&req.network_id, &req.endpoint_id)?;
        Ok(())
    }

    pub async fn endpoint_info(&self, req: EndpointInfoRequest) -> Result<EndpointInfoResponse> {
        let state = self.state.lock().await;
        let endpoint = state
            .endpoints
            .get(&(req.network_id, req.endpoint_id))
            .ok_or_else(|| Error::not_found("endpoint"))?;

        let mut value = HashMap::new();
        if let Some(mac) = &endpoint.mac {
            value.insert("mac_address".to_string(), mac.clone());
        }
        if let Some(ipv4) = &endpoint.ipv4 {
            value.insert("ipv4_address".to_string(), ipv4.clone());
        }
        if let Some(ipv6) = &endpoint.ipv6 {
            value.insert("ipv6_address".to_string(), ipv6.clone());
        }
        if let Some(peer) = &endpoint.peer_veth {
            value.insert("ovs_port".to_string(), peer.clone());
        }
        Ok(EndpointInfoResponse { value })
    }

    async fn ovn_client_for(&self, state: &mut DriverState, ovn: &OvnConfig) -> Result<Arc<OvnClient>> {
        let key = (ovn.nb_connection.clone(), ovn.sb_connection.clone());
        if let Some(client) = state.ovn_clients.get(&key) {
            return Ok(client.clone());
        }

        bootstrap::ensure_ovn_central(self.engine.as_ref(), &ovn.nb_connection, &ovn.sb_connection, ovn.auto_create)
            .await?;

        let client = Arc::new(OvnClient::connect_str(&ovn.nb_connection)?);
        state.ovn_clients.insert(key, client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;

    struct NoopEngine;

    #[async_trait]
    impl ContainerEngine for NoopEngine {
        async fn ensure_management_network(&self, candidates: &[&str]) -> Result<String> {
            Ok(candidates[0].to_string())
        }
        async fn container_exists(&self, _name: &str) -> Result<bool> {
            Ok(false)
        }
        async fn container_running(&self, _name: &str) -> Result<bool> {
            Ok(false)
        }
        async fn start_container(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn create_ovn_central(
            &self,
            _name: &str,
            _image: &str,
            _ip: Ipv4Addr,
            _nb_port: u16,
            _sb_port: u16,
        ) -> Result<()> {
            Err(Error::unavailable("not reachable in this test"))
        }
    }

    fn driver() -> Driver {
        let dir = std::env::temp_dir().join(format!("ovn-net-driver-test-{:?}", std::thread::current().id()));
        Driver::new(
            Store::new(dir),
            OvsClient::with_socket_path("/nonexistent/ovsdb.sock"),
            Arc::new(NoopEngine),
        )
    }

    #[tokio::test]
    async fn create_network_without_ipv4_data_is_invalid_config() {
        let d = driver();
        let req = CreateNetworkRequest {
            network_id: "N1".to_string(),
            options: HashMap::new(),
            ipv4_data: vec![],
            ipv6_data: vec![],
        };
        let err = d.create_network(req).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn delete_network_refuses_with_live_endpoint() {
        let d = driver();
        {
            let mut state = d.state.lock().await;
            state.networks.insert(
                "N1".to_string(),
                Network {
                    id: "N1".to_string(),
                    bridge: "br-int".to_string(),
                    vlan: None,
                    mtu: None,
                    tenant_id: None,
                    ovn: None,
                    ipv4: PoolDescriptor { subnet: "10.0.0.0/24".to_string(), gateway: "10.0.0.1".to_string() },
                    ipv6: None,
                    dhcp_enabled: false,
                    options: HashMap::new(),
                },
            );
            state.endpoints.insert(
                ("N1".to_string(), "E1".to_string()),
                Endpoint {
                    id: "E1".to_string(),
                    network_id: "N1".to_string(),
                    ipv4: None,
                    ipv6: None,
                    mac: None,
                    host_veth: None,
                    peer_veth: None,
                    options: HashMap::new(),
                },
            );
        }
        let err = d
            .delete_network(DeleteNetworkRequest { network_id: "N1".to_string() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
    }

    #[tokio::test]
    async fn leave_on_unknown_endpoint_is_idempotent() {
        let d = driver();
        d.leave(LeaveRequest { network_id: "N1".to_string(), endpoint_id: "E1".to_string() })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn endpoint_info_reports_not_found_for_unknown_endpoint() {
        let d = driver();
        let err = d
            .endpoint_info(EndpointInfoRequest { network_id: "N1".to_string(), endpoint_id: "E1".to_string() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
