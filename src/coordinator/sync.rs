//! Periodic replica synchronization.
//!
//! The coordinator keeps no board state, so each cycle first pulls the
//! messages past the `last_sent` watermark back out of the replicas, then
//! broadcasts the union to everyone. Under quorum the pull set is a random
//! write-quorum-sized selection, which any write that reached a write
//! quorum must intersect. Under RYW the pull comes from the single replica
//! with the highest version, which by construction has seen every granted
//! write that completed.
//!
//! Applying is idempotent on the replica side, so re-broadcasting an
//! update a replica already has is harmless.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::Coordinator;
use crate::board::Message;
use crate::error::{CorkboardError, Result};
use crate::net::{self, Connection};
use crate::wire::{self, Frame, PolicyTag};

/// Spawns the background synchronization task.
pub(super) fn spawn_sync_task(coordinator: Arc<Coordinator>, interval: Duration) {
    info!(
        "Starting synchronization task (every {} s)",
        interval.as_secs_f64()
    );
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.tick().await; // Skip the immediate first tick.
        loop {
            timer.tick().await;
            match run_sync_cycle(&coordinator).await {
                Ok(sent) => {
                    if sent > 0 {
                        info!("Synchronization complete ({} updates)", sent);
                    }
                }
                Err(e) => warn!("Synchronization cycle failed: {}", e),
            }
        }
    });
}

/// Runs one pull-union-broadcast cycle. Returns the number of updates
/// broadcast; the watermark only advances when at least one pull
/// succeeded, so a cycle of dead peers is retried rather than skipped.
///
/// Holds the coordinator write lock for the whole cycle: the watermark
/// must never advance past an id whose fan-out is still in flight.
async fn run_sync_cycle(coordinator: &Coordinator) -> Result<usize> {
    let _write = coordinator.write_lock.lock().await;

    let (start_id, target_id) = {
        let state = coordinator.state.lock().unwrap();
        if state.last_sent >= state.next_message_id {
            return Ok(0);
        }
        (state.last_sent + 1, state.next_message_id)
    };
    debug!("Synchronizing from #{} through #{}", start_id, target_id);

    let sources = match coordinator.policy {
        PolicyTag::Ryw => highest_version_source(coordinator).await?,
        _ => coordinator
            .random_quorum(coordinator.write_quorum)
            .into_iter()
            .map(|(_, entry)| entry.addr)
            .collect(),
    };

    let mut updates: BTreeMap<u64, Message> = BTreeMap::new();
    let mut pulled = 0;
    for source in sources {
        match pull_updates(source, start_id, &mut updates).await {
            Ok(()) => pulled += 1,
            Err(e) => warn!("Failed to pull updates from {}: {}", source, e),
        }
    }
    if pulled == 0 {
        return Err(CorkboardError::protocol(
            "no replica could be reached for updates",
        ));
    }

    for (index, entry) in coordinator.all_replicas() {
        match broadcast_updates(entry.addr, &updates).await {
            Ok(()) => coordinator.record_ack(index, target_id),
            Err(e) => warn!("Failed to synchronize replica at {}: {}", entry.addr, e),
        }
    }

    let mut state = coordinator.state.lock().unwrap();
    state.last_sent = state.last_sent.max(target_id);
    Ok(updates.len())
}

/// Queries every replica's version and returns the freshest one.
async fn highest_version_source(coordinator: &Coordinator) -> Result<Vec<SocketAddr>> {
    let mut best: Option<(SocketAddr, u64)> = None;
    for (_, entry) in coordinator.all_replicas() {
        let reply = match net::request_line(entry.addr, &Frame::VersionQuery.encode()).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Version query to {} failed: {}", entry.addr, e);
                continue;
            }
        };
        let version: u64 = reply
            .trim()
            .parse()
            .map_err(|_| CorkboardError::protocol(format!("bad version reply '{}'", reply)))?;
        if best.map_or(true, |(_, v)| version > v) {
            best = Some((entry.addr, version));
        }
    }
    match best {
        Some((addr, _)) => Ok(vec![addr]),
        None => Err(CorkboardError::protocol("no replicas reachable")),
    }
}

/// Pulls every message with id >= `start_id` from one replica into the
/// union, keyed by id.
async fn pull_updates(
    source: SocketAddr,
    start_id: u64,
    updates: &mut BTreeMap<u64, Message>,
) -> Result<()> {
    let mut conn = Connection::open(source).await?;
    conn.send_line(&Frame::SendUpdates { start_id }.encode())
        .await?;
    while let Some(line) = conn.read_line().await? {
        if line.is_empty() {
            break;
        }
        if let Frame::Data(data) = wire::parse_frame(&line)? {
            let message = data.message()?;
            updates.insert(message.id(), message);
        }
    }
    Ok(())
}

/// Re-sends the union to one replica in id order, an ack per frame.
/// Id order means a reply never precedes its parent, so replicas that
/// dropped an orphaned reply pick it up here.
async fn broadcast_updates(dest: SocketAddr, updates: &BTreeMap<u64, Message>) -> Result<()> {
    if updates.is_empty() {
        return Ok(());
    }
    let mut conn = Connection::open(dest).await?;
    for message in updates.values() {
        conn.send_line(&message.to_network_format()).await?;
        let ack = conn.expect_line().await?;
        if ack != wire::OK {
            return Err(CorkboardError::protocol(format!(
                "synchronization not acknowledged: '{}'",
                ack
            )));
        }
    }
    Ok(())
}
