//! Ctrl-C handling
//!
//! The first interrupt asks the orchestrator to stop after the current step,
//! so no step is left half applied. A second interrupt exits immediately.

use std::thread;

use anyhow::{Context, Result};
use console::style;
use hostprep_provision::StopSignal;
use tracing::{info, warn};

/// Exit status for termination by SIGINT
const INTERRUPTED: i32 = 130;

/// Spawn a listener thread that forwards Ctrl-C to `stop`
pub fn forward_ctrl_c(stop: StopSignal) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start signal runtime")?;

    thread::Builder::new()
        .name("ctrl-c".into())
        .spawn(move || {
            runtime.block_on(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for Ctrl-C: {e}");
                    return;
                }
                warn!("interrupt received, stopping after the current step");
                eprintln!(
                    "\n{} Stopping after the current step (Ctrl-C again to exit now)",
                    style("!").yellow()
                );
                stop.stop();

                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("second interrupt, exiting");
                    std::process::exit(INTERRUPTED);
                }
            });
        })
        .context("Failed to spawn signal thread")?;

    Ok(())
}
