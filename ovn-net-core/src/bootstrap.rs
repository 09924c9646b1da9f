//! Central bootstrapper: ensures an OVN-central container exists and is
//! reachable when a network declares `ovn.auto_create=true` (spec §4.D).
//!
//! The "local container-engine API" spec.md names is factored into a
//! `ContainerEngine` trait so the algorithm is testable without a real
//! container runtime, the same way `ovs.rs`/`ovn.rs` are testable only
//! against a live daemon but the driver around them is not.

use crate::error::{Error, Result};
use crate::ovn::parse_tcp_connection;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{info, warn};

/// Candidate management-network subnets, tried first-wins (spec §4.D.4a).
const CANDIDATE_SUBNETS: &[&str] = &["172.30.0.0/24", "172.31.0.0/24", "192.168.253.0/24"];

const OVN_CENTRAL_IMAGE: &str = "ovn-org/ovn-central:latest";
const OVN_CENTRAL_CONTAINER: &str = "ovn-central";

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Ensure a management bridge network exists, returning the subnet in
    /// use (an existing compatible network wins over creating a new one).
    async fn ensure_management_network(&self, candidates: &[&str]) -> Result<String>;

    async fn container_exists(&self, name: &str) -> Result<bool>;
    async fn container_running(&self, name: &str) -> Result<bool>;
    async fn start_container(&self, name: &str) -> Result<()>;

    async fn create_ovn_central(
        &self,
        name: &str,
        image: &str,
        management_ip: Ipv4Addr,
        nb_port: u16,
        sb_port: u16,
    ) -> Result<()>;
}

pub async fn ensure_ovn_central(
    engine: &dyn ContainerEngine,
    nb_connection: &str,
    sb_connection: &str,
    auto_create: bool,
) -> Result<()> {
    let (nb_host, nb_port) = parse_tcp_connection(nb_connection)?;

    if probe(&nb_host, nb_port, Duration::from_secs(2)).await {
        return Ok(());
    }

    if !auto_create {
        return Err(Error::unavailable(format!(
            "OVN NB {nb_host}:{nb_port} unreachable and auto_create is disabled"
        )));
    }

    let (_, sb_port) = parse_tcp_connection(sb_connection)?;

    let subnet = engine.ensure_management_network(CANDIDATE_SUBNETS).await?;
    let management_ip = central_ip(&subnet)?;

    if engine.container_exists(OVN_CENTRAL_CONTAINER).await? {
        if !engine.container_running(OVN_CENTRAL_CONTAINER).await? {
            info!("starting existing {} container", OVN_CENTRAL_CONTAINER);
            engine.start_container(OVN_CENTRAL_CONTAINER).await?;
        }
    } else {
        info!(
            "creating {} container on management subnet {}",
            OVN_CENTRAL_CONTAINER, subnet
        );
        engine
            .create_ovn_central(
                OVN_CENTRAL_CONTAINER,
                OVN_CENTRAL_IMAGE,
                management_ip,
                nb_port,
                sb_port,
            )
            .await?;
    }

    poll_until_reachable(&nb_host, nb_port, Duration::from_secs(30)).await
}

/// `.5` of the chosen subnet, per spec §4.D.4a.
fn central_ip(subnet_cidr: &str) -> Result<Ipv4Addr> {
    let (base, _prefix) = subnet_cidr
        .split_once('/')
        .ok_or_else(|| Error::invalid_config(format!("malformed subnet: {subnet_cidr}")))?;
    let base: Ipv4Addr = base
        .parse()
        .map_err(|_| Error::invalid_config(format!("malformed subnet address: {subnet_cidr}")))?;
    let octets = base.octets();
    Ok(Ipv4Addr::new(octets[0], octets[1], octets[2], 5))
}

async fn probe(host: &str, port: u16, deadline: Duration) -> bool {
    let addr = format!("{host}:{port}");
    matches!(
        tokio::time::timeout(deadline, TcpStream::connect(&addr)).await,
        Ok(Ok(_))
    )
}

async fn poll_until_reachable(host: &str, port: u16, deadline: Duration) -> Result<()> {
    let start = tokio::time::Instant::now();
    loop {
        if probe(host, port, Duration::from_secs(1)).await {
            return Ok(());
        }
        if start.elapsed() >= deadline {
            return Err(Error::timeout(format!(
                "OVN NB {host}:{port} unreachable after {:?}",
                deadline
            )));
        }
        warn!("OVN NB {}:{} not yet reachable, retrying", host, port);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeEngine {
        exists: Mutex<bool>,
        running: Mutex<bool>,
        created: Mutex<bool>,
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn ensure_management_network(&self, candidates: &[&str]) -> Result<String> {
            Ok(candidates[0].to_string())
        }
        async fn container_exists(&self, _name: &str) -> Result<bool> {
            Ok(*self.exists.lock().unwrap())
        }
        async fn container_running(&self, _name: &str) -> Result<bool> {
            Ok(*self.running.lock().unwrap())
        }
        async fn start_container(&self, _name: &str) -> Result<()> {
            *self.running.lock().unwrap() = true;
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
            *self.created.lock().unwrap() = true;
            *self.exists.lock().unwrap() = true;
            *self.running.lock().unwrap() = true;
            Ok(())
        }
    }

    #[test]
    fn central_ip_is_dot_5_of_subnet() {
        assert_eq!(central_ip("172.30.0.0/24").unwrap(), Ipv4Addr::new(172, 30, 0, 5));
    }

    #[tokio::test]
    async fn fails_fast_when_unreachable_and_auto_create_disabled() {
        let engine = FakeEngine::default();
        let result = ensure_ovn_central(
            &engine,
            "tcp:127.0.0.1:1",
            "tcp:127.0.0.1:2",
            false,
        )
        .await;
        assert!(matches!(result, Err(Error::Unavailable(_))));
    }

    #[tokio::test]
    async fn rejects_non_tcp_nb_connection() {
        let engine = FakeEngine::default();
        let result = ensure_ovn_central(&engine, "ssl:127.0.0.1:6641", "tcp:127.0.0.1:6642", true)
            .await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
