//! OVS client: local OVSDB JSON-RPC over the Unix control socket.
//!
//! Talks the `Open_vSwitch` schema directly — no `ovs-vsctl` shell-out.
//! Every verb is idempotent on the names it is given; transient transport
//! errors are retried with a short bounded backoff before surfacing
//! `Error::Unavailable`.

use crate::error::{Error, Result};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

const CANDIDATE_SOCKETS: &[&str] = &[
    "/var/run/openvswitch/db.sock",
    "/run/openvswitch/db.sock",
];

/// Options recognized by `add_port`; unrecognized keys are rejected by the
/// caller before reaching here (the driver owns option parsing).
#[derive(Debug, Clone, Default)]
pub struct PortOptions {
    pub container_id: Option<String>,
    pub network_id: Option<String>,
    pub tenant_id: Option<String>,
    /// Binds the port to an OVN logical port.
    pub iface_id: Option<String>,
    pub tag: Option<u16>,
}

pub struct OvsClient {
    socket_path: String,
}

impl OvsClient {
    pub fn new() -> Self {
        let socket_path = CANDIDATE_SOCKETS
            .iter()
            .find(|p| Path::new(p).exists())
            .copied()
            .unwrap_or(CANDIDATE_SOCKETS[0])
            .to_string();
        Self { socket_path }
    }

    pub fn with_socket_path(socket_path: impl Into<String>) -> Self {
        Self { socket_path: socket_path.into() }
    }

    pub async fn ping(&self) -> Result<()> {
        self.with_retry(|| self.list_dbs()).await?;
        Ok(())
    }

    pub async fn ensure_bridge(&self, name: &str) -> Result<()> {
        if self.bridge_exists(name).await? {
            return Ok(());
        }

        let bridge_ref = format!("row{}", sanitize_ref(name));
        let ops = json!([
            {
                "op": "insert",
                "table": "Bridge",
                "uuid-name": bridge_ref,
                "row": {
                    "name": name,
                    "datapath_type": "netdev",
                    "fail_mode": "secure",
                    "other_config": ["map", []],
                    "external_ids": ["map", []]
                }
            },
            {
                "op": "mutate",
                "table": "Open_vSwitch",
                "where": [],
                "mutations": [
                    ["bridges", "insert", ["set", [["named-uuid", bridge_ref]]]]
                ]
            }
        ]);

        self.with_retry(|| self.transact(ops.clone())).await?;
        Ok(())
    }

    pub async fn list_bridges(&self) -> Result<Vec<String>> {
        let ops = json!([{
            "op": "select",
            "table": "Bridge",
            "where": [],
            "columns": ["name"]
        }]);
        let result = self.with_retry(|| self.transact(ops.clone())).await?;
        Ok(rows(&result, 0)
            .iter()
            .filter_map(|row| row["name"].as_str().map(str::to_string))
            .collect())
    }

    pub async fn add_port(
        &self,
        bridge: &str,
        port_name: &str,
        options: &PortOptions,
    ) -> Result<()> {
        let bridge_uuid = self.find_bridge_uuid(bridge).await?;
        let port_uuid = format!("port-{}", sanitize_ref(port_name));
        let iface_uuid = format!("iface-{}", sanitize_ref(port_name));

        let mut ext_ids: BTreeMap<&str, String> = BTreeMap::new();
        if let Some(v) = &options.container_id {
            ext_ids.insert("container_id", v.clone());
        }
        if let Some(v) = &options.network_id {
            ext_ids.insert("network_id", v.clone());
        }
        if let Some(v) = &options.tenant_id {
            ext_ids.insert("tenant_id", v.clone());
        }
        if let Some(v) = &options.iface_id {
            ext_ids.insert("iface-id", v.clone());
        }
        let ext_ids_map = json!(["map", ext_ids.into_iter().map(|(k, v)| json!([k, v])).collect::<Vec<_>>()]);

        let mut port_row = json!({
            "name": port_name,
            "interfaces": ["set", [["named-uuid", iface_uuid]]],
        });
        if let Some(tag) = options.tag {
            port_row["tag"] = json!(tag as i64);
        }

        let ops = json!([
            {
                "op": "insert",
                "table": "Port",
                "uuid-name": port_uuid,
                "row": port_row
            },
            {
                "op": "insert",
                "table": "Interface",
                "uuid-name": iface_uuid,
                "row": {
                    "name": port_name,
                    "external_ids": ext_ids_map
                }
            },
            {
                "op": "mutate",
                "table": "Bridge",
                "where": [["_uuid", "==", ["uuid", bridge_uuid]]],
                "mutations": [
                    ["ports", "insert", ["set", [["named-uuid", port_uuid]]]]
                ]
            }
        ]);

        self.with_retry(|| self.transact(ops.clone())).await?;
        Ok(())
    }

    pub async fn delete_port(&self, bridge: &str, port_name: &str) -> Result<()> {
        let port_uuid = match self.find_port_uuid(port_name).await? {
            Some(uuid) => uuid,
            None => return Ok(()), // idempotent
        };
        let bridge_uuid = match self.find_bridge_uuid(bridge).await {
            Ok(uuid) => uuid,
            Err(_) => return Ok(()),
        };

        let ops = json!([
            {
                "op": "mutate",
                "table": "Bridge",
                "where": [["_uuid", "==", ["uuid", bridge_uuid]]],
                "mutations": [["ports", "delete", ["set", [["uuid", port_uuid]]]]]
            },
            {
                "op": "delete",
                "table": "Port",
                "where": [["_uuid", "==", ["uuid", port_uuid]]]
            },
            {
                "op": "delete",
                "table": "Interface",
                "where": [["name", "==", port_name]]
            }
        ]);

        self.with_retry(|| self.transact(ops.clone())).await?;
        Ok(())
    }

    pub async fn create_mirror(
        &self,
        bridge: &str,
        mirror_name: &str,
        src_port: &str,
        dst_port: &str,
    ) -> Result<()> {
        let bridge_uuid = self.find_bridge_uuid(bridge).await?;
        let src_uuid = self
            .find_port_uuid(src_port)
            .await?
            .ok_or_else(|| Error::not_found(format!("port '{src_port}'")))?;
        let dst_uuid = self
            .find_port_uuid(dst_port)
            .await?
            .ok_or_else(|| Error::not_found(format!("port '{dst_port}'")))?;
        let mirror_ref = format!("mirror-{}", sanitize_ref(mirror_name));

        let ops = json!([
            {
                "op": "insert",
                "table": "Mirror",
                "uuid-name": mirror_ref,
                "row": {
                    "name": mirror_name,
                    "select_src_port": ["set", [["uuid", src_uuid]]],
                    "select_dst_port": ["set", [["uuid", dst_uuid]]],
                    "output_port": ["set", [["uuid", dst_uuid]]]
                }
            },
            {
                "op": "mutate",
                "table": "Bridge",
                "where": [["_uuid", "==", ["uuid", bridge_uuid]]],
                "mutations": [["mirrors", "insert", ["set", [["named-uuid", mirror_ref]]]]]
            }
        ]);

        self.with_retry(|| self.transact(ops.clone())).await?;
        Ok(())
    }

    async fn bridge_exists(&self, name: &str) -> Result<bool> {
        match self.find_bridge_uuid(name).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn find_bridge_uuid(&self, name: &str) -> Result<String> {
        let ops = json!([{
            "op": "select",
            "table": "Bridge",
            "where": [["name", "==", name]],
            "columns": ["_uuid"]
        }]);
        let result = self.with_retry(|| self.transact(ops.clone())).await?;
        rows(&result, 0)
            .first()
            .and_then(|row| uuid_of(&row["_uuid"]))
            .ok_or_else(|| Error::not_found(format!("bridge '{name}'")))
    }

    async fn find_port_uuid(&self, name: &str) -> Result<Option<String>> {
        let ops = json!([{
            "op": "select",
            "table": "Port",
            "where": [["name", "==", name]],
            "columns": ["_uuid"]
        }]);
        let result = self.with_retry(|| self.transact(ops.clone())).await?;
        Ok(rows(&result, 0).first().and_then(|row| uuid_of(&row["_uuid"])))
    }

    async fn transact(&self, operations: Value) -> Result<Value> {
        let mut params = vec![json!("Open_vSwitch")];
        if let Some(ops) = operations.as_array() {
            params.extend(ops.iter().cloned());
        }
        self.rpc_call("transact", json!(params)).await
    }

    async fn list_dbs(&self) -> Result<Vec<String>> {
        let result = self.rpc_call("list_dbs", json!([])).await?;
        serde_json::from_value(result).map_err(Into::into)
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| Error::unavailable(format!("OVSDB socket {}: {}", self.socket_path, e)))?;

        let request = json!({ "method": method, "params": params, "id": 0 });
        let request_str = serde_json::to_string(&request)?;
        debug!("ovsdb -> {}", request_str);

        stream.write_all(request_str.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];
        let response: Value = loop {
            let n = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut chunk))
                .await
                .map_err(|_| Error::timeout(format!("OVSDB response to {method}")))?
                .map_err(Error::Io)?;
            if n == 0 {
                return Err(Error::unavailable("OVSDB connection closed by server"));
            }
            buffer.extend_from_slice(&chunk[..n]);
            if let Ok(v) = serde_json::from_slice::<Value>(&buffer) {
                break v;
            }
        };

        debug!("ovsdb <- {}", response);
        if let Some(error) = response.get("error") {
            if !error.is_null() {
                return Err(Error::internal(format!("OVSDB error: {error}")));
            }
        }
        Ok(response["result"].clone())
    }

    /// Bounded exponential backoff: ~100ms, 200ms, 400ms, 800ms, 1.6s,
    /// capped at a ~5s total budget, matching the contract in spec §4.B.
    async fn with_retry<F, Fut, T>(&self, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut delay = Duration::from_millis(100);
        let mut elapsed = Duration::ZERO;
        let budget = Duration::from_secs(5);

        loop {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) if is_transient(&e) && elapsed + delay <= budget => {
                    tokio::time::sleep(delay).await;
                    elapsed += delay;
                    delay *= 2;
                }
                Err(Error::Unavailable(msg)) | Err(Error::Timeout(msg)) => {
                    return Err(Error::unavailable(msg))
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_transient(err: &Error) -> bool {
    matches!(err, Error::Unavailable(_) | Error::Timeout(_) | Error::Io(_))
}

fn sanitize_ref(name: &str) -> String {
    name.chars().filter(|c| c.is_alphanumeric()).collect()
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

impl Default for OvsClient {
    fn default() -> Self {
        Self::new()
    }
}
