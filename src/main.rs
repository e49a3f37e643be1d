//! corkboard server binary.
//!
//! Runs a bulletin-board replica, and, when a consistency policy is given
//! on the command line, the primary coordinator as well:
//!
//! ```bash
//! # Primary with two quorum replicas expected
//! corkboard 8000 8001 quorum 2 2
//!
//! # Additional replica (policy comes from the primary at registration)
//! corkboard 8100 8101
//!
//! # Emulate wide-area latency
//! corkboard 8000 8001 sequential --delay
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use corkboard::config::{self, Config};
use corkboard::constants::{DELAY_MAX_MS, DELAY_MIN_MS};
use corkboard::coordinator::{Coordinator, CoordinatorOptions};
use corkboard::net;
use corkboard::replica::Replica;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "corkboard=info".into()),
        )
        .init();

    let config = match Config::from_args(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("{}", config::USAGE);
            std::process::exit(1);
        }
    };

    if config.delay {
        net::enable_delay(DELAY_MIN_MS, DELAY_MAX_MS);
        info!(
            "Wide-area delay emulation enabled ({}-{} ms per send)",
            DELAY_MIN_MS, DELAY_MAX_MS
        );
    }

    if let Some(primary) = &config.primary_role {
        info!("Policy is: {}", primary.policy);
        let options = CoordinatorOptions {
            bind_addr: SocketAddr::new(
                Ipv4Addr::UNSPECIFIED.into(),
                config.primary_addr.port(),
            ),
            write_quorum: primary.write_quorum,
            read_quorum: primary.read_quorum,
            sync_interval: Duration::from_secs(config.sync_interval_secs),
        };
        match Coordinator::start(primary.policy, options).await {
            Ok(addr) => info!("Coordinator listening for servers on {}", addr),
            Err(e) => {
                error!("Cannot open coordinator socket: {}", e);
                std::process::exit(1);
            }
        }
    }

    let client_bind = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.client_port);
    let peer_bind = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.coordinator_port);
    let handle = match Replica::start(config.primary_addr, client_bind, peer_bind).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Cannot start replica: {}", e);
            std::process::exit(1);
        }
    };
    info!("Listening for clients on {}", handle.client_addr);
    info!("Listening for the coordinator on {}", handle.peer_addr);
    info!("Server is listening...");

    if let Err(e) = handle.client_task.await {
        error!("Client listener stopped: {}", e);
        std::process::exit(1);
    }
}
