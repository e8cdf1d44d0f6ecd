#[macro_use]
extern crate log;

use std::env::var;
use std::sync::Arc;

mod codec;
mod config;
mod connection;
mod error;
mod overlay;
mod protocol;
mod service;
mod sinks;

use config::Config;
use overlay::Overlay;
use protocol::Role;
use sinks::{
    Ctx, LogArpTable, LogSessionSink, MemorySharedFileStore, MemoryTaskSink, StaticDirectory,
    StaticTopology,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config_loc = var("LABMESH_CONFIG").unwrap_or("config.toml".into());

    let config = Config::load(&config_loc)?;

    let role: Role = config.general.local_role.parse()?;

    let ctx = Ctx {
        topology: Arc::new(StaticTopology::new(config.general.local_uuid.clone(), role)),
        directory: Arc::new(StaticDirectory::from_entries(&config.peers)?),
        sessions: Arc::new(LogSessionSink),
        tasks: Arc::new(MemoryTaskSink::new()),
        shared_files: Arc::new(MemorySharedFileStore::new()),
        arp: Arc::new(LogArpTable),
        tmp_dir: config.paths.tmp_dir.clone().into(),
        group_dir: config.paths.group_dir.clone().into(),
        tcp_port: config.general.tcp_port,
    };

    let (mut overlay, _handle) = Overlay::bind(&config.general.bind_address, ctx).await?;

    overlay.up().await?;

    Ok(())
}
