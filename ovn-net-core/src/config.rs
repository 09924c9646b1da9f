//! Environment-derived daemon configuration.

use std::path::PathBuf;

/// Default data directory when `PLUGIN_DATA_DIR` is unset.
const DEFAULT_DATA_DIR: &str = "/data";

/// Default Unix-socket path the daemon listens on.
const DEFAULT_SOCK_PATH: &str = "/run/docker/plugins/ovn-net.sock";

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub chassis_id: String,
    pub sock_path: PathBuf,
}

impl Config {
    /// Build configuration from the process environment, falling back to
    /// the documented defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("PLUGIN_DATA_DIR")
            .unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string())
            .into();

        let chassis_id = std::env::var("OVN_CHASSIS_ID").unwrap_or_else(|_| {
            gethostname::gethostname()
                .to_string_lossy()
                .to_string()
        });

        let sock_path = std::env::var("OVN_NET_PLUGIN_SOCK")
            .unwrap_or_else(|_| DEFAULT_SOCK_PATH.to_string())
            .into();

        Self {
            data_dir,
            chassis_id,
            sock_path,
        }
    }
}
