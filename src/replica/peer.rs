//! The replica's coordinator-facing channel.
//!
//! One connection may carry many frames (fan-out sends one, sync batches
//! and transfers send a stream), so the handler loops until a blank line
//! or the peer closes. Updates are applied only if the id is not already
//! present, which makes every replication path idempotent.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::Replica;
use crate::error::{CorkboardError, Result};
use crate::net::Connection;
use crate::wire::{self, parse_frame, DataFrame, Frame};

/// Accepts coordinator and replica-to-replica connections, one task each.
pub(super) async fn run_peer_listener(replica: Arc<Replica>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let replica = replica.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_peer(&replica, stream).await {
                        warn!("Coordinator channel error: {}", e);
                    }
                });
            }
            Err(e) => warn!("Failed to accept coordinator connection: {}", e),
        }
    }
}

async fn serve_peer(replica: &Replica, stream: TcpStream) -> Result<()> {
    let mut conn = Connection::from_stream(stream);
    while let Some(line) = conn.read_line().await? {
        if line.is_empty() {
            break;
        }
        match parse_frame(&line)? {
            Frame::Data(data) => {
                apply_update(replica, data)?;
                conn.send_line(wire::OK).await?;
            }
            Frame::VersionQuery => {
                conn.send_line(&replica.version().to_string()).await?;
            }
            Frame::Transfer { ip, port } => {
                let dest = parse_transfer_target(&ip, port)?;
                push_range_to(replica, dest).await?;
                conn.send_line(wire::OK).await?;
            }
            Frame::SendUpdates { start_id } => {
                let updates = replica.snapshot_range(start_id);
                for message in &updates {
                    conn.send_line(&message.to_network_format()).await?;
                }
                // Blank line terminates the stream.
                conn.send_line("").await?;
            }
            _ => {
                warn!("Unexpected frame on coordinator channel: {}", line);
                break;
            }
        }
    }
    Ok(())
}

/// Applies a replicated update if it is not already present.
///
/// A reply whose parent has not reached this replica yet is dropped (the
/// periodic sync re-sends it after the parent has landed); the frame is
/// still acknowledged so the sender can make progress.
fn apply_update(replica: &Replica, data: DataFrame) -> Result<()> {
    let message = data.message()?;
    let id = message.id();
    let mut store = replica.store.write().unwrap();
    match store.insert(message) {
        Ok(true) => {
            info!("Applied update #{}", id);
        }
        Ok(false) => {
            debug!("Update #{} already present", id);
        }
        Err(CorkboardError::ParentMissing(parent)) => {
            warn!(
                "Dropping update #{}: reply target {} not present yet",
                id, parent
            );
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

/// Pushes this replica's entire board to another replica, waiting for an
/// acknowledgement after every frame.
async fn push_range_to(replica: &Replica, dest: SocketAddr) -> Result<()> {
    let updates = replica.snapshot_range(1);
    info!("Sending {} updates to replica at {}", updates.len(), dest);
    let mut conn = Connection::open(dest).await?;
    for message in &updates {
        conn.send_line(&message.to_network_format()).await?;
        let ack = conn.expect_line().await?;
        if ack != wire::OK {
            return Err(CorkboardError::protocol(format!(
                "transfer not acknowledged: '{}'",
                ack
            )));
        }
    }
    Ok(())
}

fn parse_transfer_target(ip: &str, port: u16) -> Result<SocketAddr> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| CorkboardError::protocol(format!("invalid transfer address '{}'", ip)))?;
    Ok(SocketAddr::new(ip, port))
}
