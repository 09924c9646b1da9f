//! Persistent store: durable record of networks and endpoints.
//!
//! One JSON file per object under `$PLUGIN_DATA_DIR/{networks,endpoints}/`.
//! A save writes to a temp file in the same directory and renames it into
//! place, so a reader never observes a partial write. The store does not
//! enforce referential integrity between networks and endpoints — that is
//! the driver's job (spec §4.A).

use crate::error::Result;
use crate::model::{Endpoint, Network};
use std::path::{Path, PathBuf};
use tracing::warn;

pub struct Store {
    networks_dir: PathBuf,
    endpoints_dir: PathBuf,
}

impl Store {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            networks_dir: data_dir.join("networks"),
            endpoints_dir: data_dir.join("endpoints"),
        }
    }

    /// Create the store's directory tree if it doesn't exist yet.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.networks_dir)?;
        std::fs::create_dir_all(&self.endpoints_dir)?;
        Ok(())
    }

    pub fn save_network(&self, rec: &Network) -> Result<()> {
        self.ensure_dirs()?;
        let path = self.network_path(&rec.id);
        atomic_write_json(&self.networks_dir, &path, rec)
    }

    pub fn delete_network(&self, id: &str) -> Result<()> {
        let path = self.network_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_networks(&self) -> Result<Vec<Network>> {
        list_records(&self.networks_dir)
    }

    pub fn save_endpoint(&self, rec: &Endpoint) -> Result<()> {
        self.ensure_dirs()?;
        let path = self.endpoint_path(&rec.network_id, &rec.id);
        atomic_write_json(&self.endpoints_dir, &path, rec)
    }

    pub fn delete_endpoint(&self, network_id: &str, endpoint_id: &str) -> Result<()> {
        let path = self.endpoint_path(network_id, endpoint_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_endpoints(&self) -> Result<Vec<Endpoint>> {
        list_records(&self.endpoints_dir)
    }

    fn network_path(&self, id: &str) -> PathBuf {
        self.networks_dir.join(format!("{}.json", sanitize(id)))
    }

    fn endpoint_path(&self, network_id: &str, endpoint_id: &str) -> PathBuf {
        self.endpoints_dir.join(format!(
            "{}__{}.json",
            sanitize(network_id),
            sanitize(endpoint_id)
        ))
    }
}

/// Keys arrive as caller-supplied opaque strings; keep only what is safe in
/// a filename so a hostile network/endpoint id can't escape the data dir.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn atomic_write_json<T: serde::Serialize>(dir: &Path, dest: &Path, value: &T) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    use std::io::Write;
    tmp.flush()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

fn list_records<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match std::fs::read(&path)
            .map_err(Into::into)
            .and_then(|bytes| serde_json::from_slice::<T>(&bytes).map_err(Into::into))
        {
            Ok(rec) => out.push(rec),
            Err(e) => warn!("skipping unreadable store record {:?}: {}", path, e),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PoolDescriptor;
    use std::collections::HashMap;

    fn net(id: &str) -> Network {
        Network {
            id: id.to_string(),
            bridge: "br-int".to_string(),
            vlan: None,
            mtu: None,
            tenant_id: None,
            ovn: None,
            ipv4: PoolDescriptor {
                subnet: "10.9.0.0/24".to_string(),
                gateway: "10.9.0.1".to_string(),
            },
            ipv6: None,
            dhcp_enabled: false,
            options: HashMap::new(),
        }
    }

    #[test]
    fn save_then_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store.save_network(&net("N1")).unwrap();

        let nets = store.list_networks().unwrap();
        assert_eq!(nets.len(), 1);
        assert_eq!(nets[0].id, "N1");
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store.save_network(&net("N1")).unwrap();
        store.delete_network("N1").unwrap();
        store.delete_network("N1").unwrap();
        assert!(store.list_networks().unwrap().is_empty());
    }

    #[test]
    fn corrupt_record_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store.save_network(&net("N1")).unwrap();
        store.ensure_dirs().unwrap();
        std::fs::write(dir.path().join("networks/N2.json"), b"not json").unwrap();

        let nets = store.list_networks().unwrap();
        assert_eq!(nets.len(), 1);
        assert_eq!(nets[0].id, "N1");
    }

    #[test]
    fn restart_round_trip_preserves_endpoint_fields() {
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoint {
            id: "E1abcdef".to_string(),
            network_id: "N1".to_string(),
            ipv4: Some("10.9.0.10/24".to_string()),
            ipv6: None,
            mac: Some("02:aa:bb:cc:dd:ee".to_string()),
            host_veth: Some("vethE1abcd".to_string()),
            peer_veth: Some("vethE1abcd-p".to_string()),
            options: HashMap::new(),
        };
        {
            let store = Store::new(dir.path());
            store.save_endpoint(&ep).unwrap();
        }
        // simulate restart: fresh Store handle over the same directory
        let store = Store::new(dir.path());
        let loaded = store.list_endpoints().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].mac, ep.mac);
        assert_eq!(loaded[0].ipv4, ep.ipv4);
    }
}
