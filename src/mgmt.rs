use std::io::{BufRead, BufReader, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use compact_str::CompactString;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;

#[derive(Debug, Deserialize)]
#[serde(tag = "command")]
pub enum MgmtRequest {
    #[serde(rename = "reload")]
    Reload,
    #[serde(rename = "status")]
    Status,
}

#[derive(Debug, Serialize)]
pub struct PoolStatus {
    pub network: CompactString,
    pub classification: &'static str,
    pub subnet: Ipv4Net,
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    pub total: u32,
    pub offered: u32,
    pub bound: u32,
}

#[derive(Debug, Default, Serialize)]
pub struct MgmtResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leases_carried: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pools: Option<Vec<PoolStatus>>,
}

/// Main management listener loop
pub fn listener(listener: TcpListener, config: Arc<ArcSwap<Config>>, config_path: PathBuf) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let peer = stream.peer_addr().ok();
                handle_client(stream, &config, &config_path);
                if let Some(addr) = peer {
                    info!(%addr, "handled management request");
                }
            }
            Err(e) => {
                warn!(%e, "failed to accept management connection");
            }
        }
    }
}

fn handle_client(stream: TcpStream, config: &ArcSwap<Config>, config_path: &Path) {
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
    stream.set_write_timeout(Some(Duration::from_secs(5))).ok();

    let mut reader = BufReader::new(&stream);
    let mut line = String::new();

    match reader.read_line(&mut line) {
        Ok(0) => return, // EOF
        Ok(_) => {}
        Err(e) => {
            warn!(%e, "failed to read from management client");
            return;
        }
    }

    let response = respond(&line, config, config_path);

    let mut writer = stream;
    if let Err(e) = serde_json::to_writer(&mut writer, &response) {
        warn!(%e, "failed to write response");
    }
    let _ = writer.write_all(b"\n");
}

/// Answer one request line.
pub fn respond(line: &str, config: &ArcSwap<Config>, config_path: &Path) -> MgmtResponse {
    match serde_json::from_str::<MgmtRequest>(line) {
        Ok(MgmtRequest::Reload) => match reload_from_disk(config, config_path) {
            Ok(carried) => MgmtResponse {
                success: true,
                message: Some(format!(
                    "Reloaded {}, carried over {} leases",
                    config_path.display(),
                    carried
                )),
                leases_carried: Some(carried),
                ..Default::default()
            },
            Err(e) => {
                warn!(%e, "reload failed, keeping running configuration");
                MgmtResponse {
                    success: false,
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        },
        Ok(MgmtRequest::Status) => MgmtResponse {
            success: true,
            message: Some("Status OK".into()),
            pools: Some(pool_status(&config.load(), SystemTime::now())),
            ..Default::default()
        },
        Err(e) => MgmtResponse {
            success: false,
            error: Some(format!("Invalid request: {}", e)),
            ..Default::default()
        },
    }
}

pub fn pool_status(config: &Config, now: SystemTime) -> Vec<PoolStatus> {
    config
        .networks
        .iter()
        .flat_map(|network| {
            network.pools().map(move |pool_ref| {
                let usage = pool_ref.pool.usage(now);
                PoolStatus {
                    network: network.name.clone(),
                    classification: pool_ref.classification.as_str(),
                    subnet: pool_ref.subnet.net,
                    start: pool_ref.pool.start(),
                    end: pool_ref.pool.end(),
                    total: usage.total,
                    offered: usage.offered,
                    bound: usage.bound,
                }
            })
        })
        .collect()
}

/// Parse the configuration file and swap it in, carrying every unexpired
/// lease over. A parse failure leaves the running tree in place.
pub fn reload_from_disk(config: &ArcSwap<Config>, config_path: &Path) -> Result<usize> {
    let new_config = Config::load(config_path)?;
    let previous = config.load_full();

    let now = SystemTime::now();
    let mut carried = new_config.inherit_leases(&previous, now);
    let new_config = Arc::new(new_config);
    config.store(Arc::clone(&new_config));
    // Workers still holding the previous tree may have leased in between.
    carried += new_config.inherit_leases(&previous, SystemTime::now());

    info!(carried, "reloaded configuration from disk");
    Ok(carried)
}
