//! Entry point for the OVN container-network plugin daemon.

mod server;

use clap::Parser;
use ovn_net_core::bootstrap::ContainerEngine;
use ovn_net_core::docker_engine::DockerEngineClient;
use ovn_net_core::driver::Driver;
use ovn_net_core::{ovs::OvsClient, store::Store, Config};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ovn-net-daemon", about = "Container-network driver backed by OVS and OVN")]
struct Args {
    /// Override the Unix socket path the daemon listens on.
    #[arg(long)]
    sock_path: Option<String>,

    /// Override the persistent data directory.
    #[arg(long)]
    data_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(sock_path) = args.sock_path {
        config.sock_path = sock_path.into();
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir.into();
    }

    tracing::info!(
        chassis_id = %config.chassis_id,
        data_dir = %config.data_dir.display(),
        sock_path = %config.sock_path.display(),
        "starting ovn-net-daemon"
    );

    let store = Store::new(&config.data_dir);
    store.ensure_dirs()?;
    let ovs = OvsClient::new();
    let engine: Arc<dyn ContainerEngine> = Arc::new(DockerEngineClient::new());

    let driver = Arc::new(Driver::new(store, ovs, engine));
    driver.recover().await;

    server::serve(driver, &config.sock_path).await
}
