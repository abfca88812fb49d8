use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use signal_hook::consts::SIGHUP;
use signal_hook::iterator::Signals;
use tracing::{error, info};

use crate::config::Config;
use crate::mgmt;

/// Spawn a thread that handles SIGHUP by reloading the configuration file
pub fn spawn_sighup_handler(
    config: Arc<ArcSwap<Config>>,
    config_path: PathBuf,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("sighup".to_string())
        .spawn(move || {
            let mut signals =
                Signals::new([SIGHUP]).expect("Failed to register SIGHUP handler");

            for sig in signals.forever() {
                if sig == SIGHUP {
                    info!(path = %config_path.display(), "received SIGHUP, reloading configuration");
                    match mgmt::reload_from_disk(&config, &config_path) {
                        Ok(carried) => info!(carried, "reloaded configuration"),
                        Err(e) => error!(%e, "failed to reload configuration, keeping previous"),
                    }
                }
            }
        })
        .expect("Failed to spawn SIGHUP handler thread")
}
