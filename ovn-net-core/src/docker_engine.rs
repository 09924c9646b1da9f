//! Production `ContainerEngine`: talks the Docker Engine API over its Unix
//! socket, the same "no wrappers, raw protocol over a local socket" idiom
//! as the OVSDB client — plain HTTP/1.1 requests written by hand rather
//! than shelling out to a CLI.

use crate::bootstrap::ContainerEngine;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

const DEFAULT_DOCKER_SOCK: &str = "/var/run/docker.sock";
const MANAGEMENT_NETWORK_NAME: &str = "ovn-mgmt";

pub struct DockerEngineClient {
    sock_path: String,
}

impl DockerEngineClient {
    pub fn new() -> Self {
        Self { sock_path: DEFAULT_DOCKER_SOCK.to_string() }
    }

    pub fn with_socket_path(sock_path: impl Into<String>) -> Self {
        Self { sock_path: sock_path.into() }
    }

    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> Result<Value> {
        let mut stream = UnixStream::connect(&self.sock_path)
            .await
            .map_err(|e| Error::unavailable(format!("docker socket {}: {}", self.sock_path, e)))?;

        let payload = body.map(|b| serde_json::to_vec(&b)).transpose()?.unwrap_or_default();
        let mut request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n"
        );
        if !payload.is_empty() {
            request.push_str("Content-Type: application/json\r\n");
            request.push_str(&format!("Content-Length: {}\r\n", payload.len()));
        }
        request.push_str("\r\n");

        debug!("docker -> {} {}", method, path);
        stream.write_all(request.as_bytes()).await?;
        stream.write_all(&payload).await?;
        stream.flush().await?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;
        let text = String::from_utf8_lossy(&raw);

        let mut parts = text.splitn(2, "\r\n\r\n");
        let status_line = parts.next().unwrap_or_default();
        let body_text = parts.next().unwrap_or_default();

        let status = status_line
            .lines()
            .next()
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(0);

        if status == 404 {
            return Err(Error::not_found(format!("{method} {path}")));
        }
        if status == 409 {
            return Err(Error::already_exists(format!("{method} {path}")));
        }
        if !(200..300).contains(&status) {
            return Err(Error::unavailable(format!(
                "docker API {method} {path} returned {status}: {body_text}"
            )));
        }

        if body_text.trim().is_empty() {
            Ok(Value::Null)
        } else {
            serde_json::from_str(body_text.trim()).map_err(Into::into)
        }
    }
}

impl Default for DockerEngineClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngineClient {
    async fn ensure_management_network(&self, candidates: &[&str]) -> Result<String> {
        let networks = self
            .request("GET", "/networks", None)
            .await
            .unwrap_or(Value::Array(vec![]));

        if let Some(arr) = networks.as_array() {
            for net in arr {
                if net["Name"].as_str() == Some(MANAGEMENT_NETWORK_NAME) {
                    if let Some(subnet) = net["IPAM"]["Config"][0]["Subnet"].as_str() {
                        return Ok(subnet.to_string());
                    }
                }
            }
        }

        let mut last_err = Error::internal("no candidate subnets supplied");
        for subnet in candidates {
            let body = json!({
                "Name": MANAGEMENT_NETWORK_NAME,
                "Driver": "bridge",
                "IPAM": { "Config": [{ "Subnet": subnet }] }
            });
            match self.request("POST", "/networks/create", Some(body)).await {
                Ok(_) => return Ok((*subnet).to_string()),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        match self.request("GET", &format!("/containers/{name}/json"), None).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn container_running(&self, name: &str) -> Result<bool> {
        let info = self.request("GET", &format!("/containers/{name}/json"), None).await?;
        Ok(info["State"]["Running"].as_bool().unwrap_or(false))
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        match self.request("POST", &format!("/containers/{name}/start"), None).await {
            Ok(_) => Ok(()),
            Err(Error::AlreadyExists(_)) => Ok(()), // already running
            Err(e) => Err(e),
        }
    }

    async fn create_ovn_central(
        &self,
        name: &str,
        image: &str,
        management_ip: Ipv4Addr,
        nb_port: u16,
        sb_port: u16,
    ) -> Result<()> {
        let body = json!({
            "Image": image,
            "ExposedPorts": {
                format!("{nb_port}/tcp"): {},
                format!("{sb_port}/tcp"): {},
            },
            "HostConfig": {
                "Privileged": true,
                "RestartPolicy": { "Name": "unless-stopped" },
                "Binds": [
                    "/var/lib/ovn-central/db:/etc/openvswitch",
                    "/var/log/ovn-central:/var/log/openvswitch",
                ],
                "NetworkMode": MANAGEMENT_NETWORK_NAME,
            },
            "NetworkingConfig": {
                "EndpointsConfig": {
                    MANAGEMENT_NETWORK_NAME: {
                        "IPAMConfig": { "IPv4Address": management_ip.to_string() }
                    }
                }
            }
        });

        self.request("POST", &format!("/containers/create?name={name}"), Some(body))
            .await?;
        self.request("POST", &format!("/containers/{name}/start"), None).await?;
        Ok(())
    }
}
