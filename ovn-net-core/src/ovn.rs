//! OVN Northbound client: the same OVSDB JSON-RPC wire protocol as
//! `ovs.rs`, but over TCP against the `OVN_Northbound` schema. Every
//! method is idempotent on the NB object name it is given, and safe for
//! concurrent callers — each call opens its own TCP connection bounded by
//! a connect deadline, so there is no shared mutable connection state to
//! race on.

use crate::error::{Error, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// NAT rule kind, per spec §4.C.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatKind {
    Snat,
    Dnat,
    DnatAndSnat,
}

impl NatKind {
    fn as_str(self) -> &'static str {
        match self {
            NatKind::Snat => "snat",
            NatKind::Dnat => "dnat",
            NatKind::DnatAndSnat => "dnat_and_snat",
        }
    }
}

/// Options accepted by `create_logical_port`.
#[derive(Debug, Clone, Default)]
pub struct LogicalPortOptions {
    pub router_port: Option<String>,
    pub is_router_type: bool,
}

pub struct OvnClient {
    nb_host: String,
    nb_port: u16,
}

impl OvnClient {
    /// `nb_connection` must be `tcp:HOST:PORT`, per spec §4.D step 1.
    pub fn connect_str(nb_connection: &str) -> Result<Self> {
        let (host, port) = parse_tcp_connection(nb_connection)?;
        Ok(Self { nb_host: host, nb_port: port })
    }

    pub async fn create_logical_switch(&self, name: &str, ext_ids: &[(&str, &str)]) -> Result<()> {
        if self.find_uuid("Logical_Switch", name).await?.is_some() {
            return Ok(());
        }
        let ext_ids_map = ext_ids_to_map(ext_ids);
        let ops = json!([{
            "op": "insert",
            "table": "Logical_Switch",
            "row": { "name": name, "external_ids": ext_ids_map }
        }]);
        self.transact(ops).await?;
        Ok(())
    }

    pub async fn delete_logical_switch(&self, name: &str) -> Result<()> {
        let Some(uuid) = self.find_uuid("Logical_Switch", name).await? else {
            return Ok(());
        };
        let ops = json!([{
            "op": "delete",
            "table": "Logical_Switch",
            "where": [["_uuid", "==", ["uuid", uuid]]]
        }]);
        self.transact(ops).await?;
        Ok(())
    }

    pub async fn create_logical_router(&self, name: &str, ext_ids: &[(&str, &str)]) -> Result<()> {
        if self.find_uuid("Logical_Router", name).await?.is_some() {
            return Ok(());
        }
        let ext_ids_map = ext_ids_to_map(ext_ids);
        let ops = json!([{
            "op": "insert",
            "table": "Logical_Router",
            "row": { "name": name, "external_ids": ext_ids_map }
        }]);
        self.transact(ops).await?;
        Ok(())
    }

    pub async fn create_logical_port(
        &self,
        switch: &str,
        name: &str,
        mac: &str,
        ip: &str,
        opts: &LogicalPortOptions,
    ) -> Result<()> {
        if self.find_uuid("Logical_Switch_Port", name).await?.is_some() {
            return Ok(());
        }
        let switch_uuid = self
            .find_uuid("Logical_Switch", switch)
            .await?
            .ok_or_else(|| Error::not_found(format!("logical switch '{switch}'")))?;

        let addresses = if mac.is_empty() && ip.is_empty() {
            json!(["set", []])
        } else if ip.is_empty() {
            json!(["set", [mac]])
        } else {
            json!(["set", [format!("{mac} {ip}")]])
        };

        let mut row = json!({
            "name": name,
            "addresses": addresses,
        });
        if opts.is_router_type {
            row["type"] = json!("router");
            let router_port = opts
                .router_port
                .clone()
                .ok_or_else(|| Error::invalid_config("router-type port requires router_port"))?;
            row["options"] = json!(["map", [["router-port", router_port]]]);
        }

        let port_ref = format!("lsp-{}", sanitize_ref(name));
        let ops = json!([
            {
                "op": "insert",
                "table": "Logical_Switch_Port",
                "uuid-name": port_ref,
                "row": row
            },
            {
                "op": "mutate",
                "table": "Logical_Switch",
                "where": [["_uuid", "==", ["uuid", switch_uuid]]],
                "mutations": [["ports", "insert", ["set", [["named-uuid", port_ref]]]]]
            }
        ]);
        self.transact(ops).await?;
        Ok(())
    }

    pub async fn delete_logical_port(&self, name: &str) -> Result<()> {
        let Some(uuid) = self.find_uuid("Logical_Switch_Port", name).await? else {
            return Ok(());
        };
        let ops = json!([{
            "op": "delete",
            "table": "Logical_Switch_Port",
            "where": [["_uuid", "==", ["uuid", uuid]]]
        }]);
        self.transact(ops).await?;
        Ok(())
    }

    /// Clear the addresses field so a NAT gateway can source-NAT
    /// arbitrary subnets (spec §4.C).
    pub async fn disable_port_security(&self, name: &str) -> Result<()> {
        let ops = json!([{
            "op": "update",
            "table": "Logical_Switch_Port",
            "where": [["name", "==", name]],
            "row": { "addresses": ["set", []], "port_security": ["set", []] }
        }]);
        self.transact(ops).await?;
        Ok(())
    }

    pub async fn set_port_dhcp(&self, port: &str, dhcp_uuid: &str) -> Result<()> {
        let ops = json!([{
            "op": "update",
            "table": "Logical_Switch_Port",
            "where": [["name", "==", port]],
            "row": { "dhcpv4_options": ["set", [["uuid", dhcp_uuid]]] }
        }]);
        self.transact(ops).await?;
        Ok(())
    }

    pub async fn create_logical_router_port(
        &self,
        router: &str,
        name: &str,
        mac: &str,
        networks: &[String],
    ) -> Result<()> {
        if self.find_uuid("Logical_Router_Port", name).await?.is_some() {
            return Ok(());
        }
        let router_uuid = self
            .find_uuid("Logical_Router", router)
            .await?
            .ok_or_else(|| Error::not_found(format!("logical router '{router}'")))?;

        let port_ref = format!("lrp-{}", sanitize_ref(name));
        let ops = json!([
            {
                "op": "insert",
                "table": "Logical_Router_Port",
                "uuid-name": port_ref,
                "row": {
                    "name": name,
                    "mac": mac,
                    "networks": ["set", networks]
                }
            },
            {
                "op": "mutate",
                "table": "Logical_Router",
                "where": [["_uuid", "==", ["uuid", router_uuid]]],
                "mutations": [["ports", "insert", ["set", [["named-uuid", port_ref]]]]]
            }
        ]);
        self.transact(ops).await?;
        Ok(())
    }

    pub async fn create_dhcp_options(
        &self,
        cidr: &str,
        server_mac: &str,
        server_ip: &str,
        opts: &[(&str, &str)],
    ) -> Result<String> {
        let mut options_map: Vec<(&str, &str)> = vec![("server_mac", server_mac), ("server_id", server_ip)];
        options_map.extend(opts.iter().copied());
        let row = json!({
            "cidr": cidr,
            "options": ext_ids_to_map(&options_map)
        });
        let ops = json!([{
            "op": "insert",
            "table": "DHCP_Options",
            "uuid-name": "dhcpopts",
            "row": row
        }]);
        let result = self.transact(ops).await?;
        uuid_of(&result[0]["uuid"])
            .or_else(|| result[0].get("uuid").and_then(|v| v.as_str()).map(str::to_string))
            .ok_or_else(|| Error::internal("DHCP_Options insert returned no uuid"))
    }

    /// Duplicate prefix is folded into success, per spec §4.C.
    pub async fn add_static_route(&self, router: &str, prefix: &str, next_hop: &str) -> Result<()> {
        let router_uuid = self
            .find_uuid("Logical_Router", router)
            .await?
            .ok_or_else(|| Error::not_found(format!("logical router '{router}'")))?;

        if self.route_exists(&router_uuid, prefix).await? {
            return Ok(());
        }

        let route_ref = "route";
        let ops = json!([
            {
                "op": "insert",
                "table": "Logical_Router_Static_Route",
                "uuid-name": route_ref,
                "row": { "ip_prefix": prefix, "nexthop": next_hop }
            },
            {
                "op": "mutate",
                "table": "Logical_Router",
                "where": [["_uuid", "==", ["uuid", router_uuid]]],
                "mutations": [["static_routes", "insert", ["set", [["named-uuid", route_ref]]]]]
            }
        ]);
        match self.transact(ops).await {
            Ok(_) => Ok(()),
            Err(e) => Err(e), // already-exists races are caught by route_exists above
        }
    }

    pub async fn add_nat(
        &self,
        router: &str,
        kind: NatKind,
        external_ip: &str,
        logical_ip: &str,
    ) -> Result<()> {
        let router_uuid = self
            .find_uuid("Logical_Router", router)
            .await?
            .ok_or_else(|| Error::not_found(format!("logical router '{router}'")))?;

        let nat_ref = "nat";
        let ops = json!([
            {
                "op": "insert",
                "table": "NAT",
                "uuid-name": nat_ref,
                "row": {
                    "type": kind.as_str(),
                    "external_ip": external_ip,
                    "logical_ip": logical_ip
                }
            },
            {
                "op": "mutate",
                "table": "Logical_Router",
                "where": [["_uuid", "==", ["uuid", router_uuid]]],
                "mutations": [["nat", "insert", ["set", [["named-uuid", nat_ref]]]]]
            }
        ]);
        self.transact(ops).await?;
        Ok(())
    }

    /// A prefix is only a duplicate if it already belongs to *this*
    /// router's `static_routes` set — two different routers legitimately
    /// share a prefix (e.g. every VPC router's own default route).
    async fn route_exists(&self, router_uuid: &str, prefix: &str) -> Result<bool> {
        let ops = json!([{
            "op": "select",
            "table": "Logical_Router",
            "where": [["_uuid", "==", ["uuid", router_uuid]]],
            "columns": ["static_routes"]
        }]);
        let result = self.transact(ops).await?;
        let route_uuids = rows(&result, 0)
            .first()
            .map(|row| set_uuids(&row["static_routes"]))
            .unwrap_or_default();
        if route_uuids.is_empty() {
            return Ok(false);
        }

        let ops = json!([{
            "op": "select",
            "table": "Logical_Router_Static_Route",
            "where": [["ip_prefix", "==", prefix]],
            "columns": ["_uuid"]
        }]);
        let result = self.transact(ops).await?;
        Ok(rows(&result, 0)
            .iter()
            .filter_map(|row| uuid_of(&row["_uuid"]))
            .any(|u| route_uuids.contains(&u)))
    }

    async fn find_uuid(&self, table: &str, name: &str) -> Result<Option<String>> {
        let ops = json!([{
            "op": "select",
            "table": table,
            "where": [["name", "==", name]],
            "columns": ["_uuid"]
        }]);
        let result = self.transact(ops).await?;
        Ok(rows(&result, 0).first().and_then(|row| uuid_of(&row["_uuid"])))
    }

    async fn transact(&self, operations: Value) -> Result<Value> {
        let mut params = vec![json!("OVN_Northbound")];
        if let Some(ops) = operations.as_array() {
            params.extend(ops.iter().cloned());
        }
        self.rpc_call("transact", json!(params)).await
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value> {
        let addr = format!("{}:{}", self.nb_host, self.nb_port);
        let mut stream = tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::unavailable(format!("OVN NB connect timeout: {addr}")))?
            .map_err(|e| Error::unavailable(format!("OVN NB connect {addr}: {e}")))?;

        let request = json!({ "method": method, "params": params, "id": 0 });
        let request_str = serde_json::to_string(&request)?;
        debug!("ovn-nb -> {}", request_str);

        stream.write_all(request_str.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];
        let response: Value = loop {
            let n = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut chunk))
                .await
                .map_err(|_| Error::timeout(format!("OVN NB response to {method}")))?
                .map_err(Error::Io)?;
            if n == 0 {
                return Err(Error::unavailable("OVN NB connection closed by server"));
            }
            buffer.extend_from_slice(&chunk[..n]);
            if let Ok(v) = serde_json::from_slice::<Value>(&buffer) {
                break v;
            }
        };

        debug!("ovn-nb <- {}", response);
        if let Some(error) = response.get("error") {
            if !error.is_null() {
                return Err(Error::internal(format!("OVN NB error: {error}")));
            }
        }
        Ok(response["result"].clone())
    }
}

pub(crate) fn parse_tcp_connection(s: &str) -> Result<(String, u16)> {
    let rest = s
        .strip_prefix("tcp:")
        .ok_or_else(|| Error::invalid_config(format!("unsupported connection string: {s}")))?;
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| Error::invalid_config(format!("malformed tcp connection string: {s}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::invalid_config(format!("malformed port in: {s}")))?;
    Ok((host.to_string(), port))
}

fn sanitize_ref(name: &str) -> String {
    name.chars().filter(|c| c.is_alphanumeric()).collect()
}

fn ext_ids_to_map(pairs: &[(&str, &str)]) -> Value {
    json!(["map", pairs.iter().map(|(k, v)| json!([k, v])).collect::<Vec<_>>()])
}

fn rows(result: &Value, op_index: usize) -> Vec<Value> {
    result
        .get(op_index)
        .and_then(|r| r.get("rows"))
        .and_then(|r| r.as_array())
        .cloned()
        .unwrap_or_default()
}

fn uuid_of(value: &Value) -> Option<String> {
    let arr = value.as_array()?;
    if arr.len() == 2 && arr[0] == "uuid" {
        arr[1].as_str().map(str::to_string)
    } else {
        None
    }
}

/// Parse an OVSDB set-of-uuid column value: either a single `["uuid", x]`
/// pair or `["set", [["uuid", x], ...]]`.
fn set_uuids(value: &Value) -> Vec<String> {
    if let Some(u) = uuid_of(value) {
        return vec![u];
    }
    let Some(arr) = value.as_array() else { return Vec::new() };
    if arr.len() == 2 && arr[0] == "set" {
        if let Some(items) = arr[1].as_array() {
            return items.iter().filter_map(uuid_of).collect();
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_connection_string() {
        let (host, port) = parse_tcp_connection("tcp:127.0.0.1:6641").unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 6641);
    }

    #[test]
    fn rejects_non_tcp_connection_string() {
        assert!(parse_tcp_connection("ssl:127.0.0.1:6641").is_err());
    }

    #[test]
    fn nat_kind_strings() {
        assert_eq!(NatKind::Snat.as_str(), "snat");
        assert_eq!(NatKind::DnatAndSnat.as_str(), "dnat_and_snat");
    }

    #[test]
    fn set_uuids_handles_single_and_set_forms() {
        assert_eq!(set_uuids(&json!(["uuid", "a"])), vec!["a".to_string()]);
        assert_eq!(
            set_uuids(&json!(["set", [["uuid", "a"], ["uuid", "b"]]])),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(set_uuids(&json!(["set", []])).is_empty());
    }
}
