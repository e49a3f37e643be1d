//! The consistency policy layer.
//!
//! Each replica runs exactly one policy, dispatched by tag. Writes always
//! involve the coordinator; the policies differ in how:
//!
//! - **sequential**: forward the frame, the coordinator applies it
//!   everywhere before acknowledging.
//! - **quorum**: forward the frame, the coordinator applies it to a write
//!   quorum; reads first ask the coordinator to assemble a read quorum and
//!   bring this replica up to date.
//! - **ryw**: acquire the coordinator's token, write locally choosing the
//!   next id, then return the token together with the update; reads poll
//!   `CHECK` until the coordinator sees no newer updates.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::Replica;
use crate::constants::CHECK_POLL_INTERVAL_MS;
use crate::error::{CorkboardError, Result};
use crate::net::{self, Connection};
use crate::wire::{self, parse_frame, DataFrame, Frame, PolicyTag};

/// Performs a POST or REPLY under the replica's policy, returning the
/// success code for the client.
pub(super) async fn post(replica: &Replica, frame: DataFrame) -> i32 {
    let outcome = match replica.policy() {
        PolicyTag::Sequential | PolicyTag::Quorum => forward_post(replica, frame).await,
        PolicyTag::Ryw => local_write(replica, frame).await,
    };
    outcome.unwrap_or_else(|e| {
        warn!("Write failed: {}", e);
        wire::CODE_FAILURE
    })
}

/// Runs the policy's read precondition; afterwards the caller may serve
/// READ or CHOOSE from the local store.
pub(super) async fn before_read(replica: &Replica) -> Result<()> {
    match replica.policy() {
        PolicyTag::Sequential => Ok(()),
        PolicyTag::Quorum => quorum_read(replica).await,
        PolicyTag::Ryw => check_for_updates(replica).await,
    }
}

/// Default write path: hand the frame to the coordinator and relay its
/// success code.
///
/// Whether a reply's parent exists is the coordinator's call: its id
/// counter is the authority, while this replica's own board may lag any
/// write quorum it was not part of.
async fn forward_post(replica: &Replica, frame: DataFrame) -> Result<i32> {
    if frame.parent_id == Some(0) {
        // Ids start at 1; zero needs no round trip to refuse.
        return Ok(wire::CODE_FAILURE);
    }
    let reply = net::request_line(replica.primary(), &Frame::Data(frame).encode()).await?;
    parse_code(&reply)
}

/// RYW write path: the token makes this replica the only writer in the
/// system, so it may choose the next id itself.
async fn local_write(replica: &Replica, frame: DataFrame) -> Result<i32> {
    if let Some(parent) = frame.parent_id {
        if !replica.contains(parent) {
            return Ok(wire::CODE_FAILURE);
        }
    }

    let mut conn = Connection::open(replica.primary()).await?;
    debug!("Requesting token from coordinator...");
    conn.send_line(&Frame::AcquireLock.encode()).await?;
    let grant = conn.expect_line().await?;
    if parse_frame(&grant)? != Frame::GrantLock {
        return Err(CorkboardError::protocol(format!(
            "expected GRANT_LOCK, got '{}'",
            grant
        )));
    }
    debug!("Token received");

    // This replica is the first to make the update and must choose an id.
    let message = {
        let mut store = replica.store.write().unwrap();
        let id = store.version() + 1;
        let message = frame.into_message(id)?;
        store.insert(message.clone())?;
        message
    };
    info!("Posting message #{}", message.id());

    debug!("Returning token to coordinator...");
    conn.send_line(&Frame::Unlock.encode()).await?;
    conn.send_line(&message.to_network_format()).await?;
    let reply = conn.expect_line().await?;
    parse_code(&reply)
}

/// Quorum read precondition: blocks until the coordinator has assembled a
/// read quorum and transferred the freshest board to this replica.
async fn quorum_read(replica: &Replica) -> Result<()> {
    let frame = Frame::QuorumRead {
        replica_id: replica.replica_id(),
    };
    let reply = net::request_line(replica.primary(), &frame.encode()).await?;
    if reply == wire::OK {
        Ok(())
    } else {
        Err(CorkboardError::protocol(format!(
            "read quorum failed: '{}'",
            reply
        )))
    }
}

/// RYW read precondition: polls the coordinator until it confirms this
/// replica has seen every update. Healing of a lagging replica is driven
/// by the coordinator's sync task, so the poll converges.
async fn check_for_updates(replica: &Replica) -> Result<()> {
    debug!("Checking coordinator for updates...");
    loop {
        let frame = Frame::Check {
            version: replica.version(),
        };
        let reply = net::request_line(replica.primary(), &frame.encode()).await?;
        if reply == wire::OK {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(CHECK_POLL_INTERVAL_MS)).await;
    }
}

fn parse_code(reply: &str) -> Result<i32> {
    reply
        .trim()
        .parse()
        .map_err(|_| CorkboardError::protocol(format!("expected a success code, got '{}'", reply)))
}
