//! iceturn server
//!
//! Loads configuration from the environment, starts the TURN listener and
//! runs until Ctrl+C.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use anyhow::Result;
use iceturn::{listen_with, AllocationEvent};
use iceturn_config::{LogFormat, TurnConfig};
use iceturn_logging::{init_console_logging, init_logging, verbosity_filter};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "iceturn";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = TurnConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    // Initialize logging; a numeric level uses the 0-6 verbosity scale
    let level = match config.log_level().parse::<u8>() {
        Ok(verbosity) => verbosity_filter(verbosity).to_string(),
        Err(_) => config.log_level().to_string(),
    };
    match config.log_format {
        LogFormat::Json => init_logging(SERVICE_NAME, &level),
        LogFormat::Console => init_console_logging(SERVICE_NAME, &level),
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        listen = %config.listen_addr(),
        protocol = %config.listen_protocol,
        realm = %config.realm,
        "Configuration loaded"
    );

    let listener = listen_with(config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start TURN server: {}", e))?;

    // Log allocation lifecycle
    let mut events = listener.events();
    let events_handle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(AllocationEvent::AuthFailed { client, code }) => {
                    info!(client = %client, code, "Authentication challenge sent");
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    info!(addr = %listener.addr(), "iceturn running. Press Ctrl+C to stop.");
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received");
        }
        Err(err) => {
            error!(error = %err, "Unable to listen for shutdown signal");
        }
    }

    let stats = listener.stats();
    info!(
        allocations = stats.active_allocations,
        bytes_to_peer = stats.bytes_to_peer,
        bytes_to_client = stats.bytes_to_client,
        "Closing listener"
    );
    listener.close().await;
    events_handle.abort();
    info!("iceturn stopped");

    Ok(())
}
