//! The replication coordinator hosted by the primary process.
//!
//! A single role parameterized by the consistency policy tag: the same
//! listener, registry, and fan-out machinery serve all three policies,
//! which differ only in write-target selection, the QUORUM_READ and
//! ACQUIRE_LOCK handlers, and whether the sync task runs.
//!
//! The coordinator keeps no bulletin-board state of its own, only the
//! replica registry and the message-id counters.

mod sync;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::{CONNECTION_QUEUE_CAPACITY, WORKER_POOL_SIZE};
use crate::error::{CorkboardError, Result};
use crate::net::{self, Connection};
use crate::wire::{self, parse_frame, DataFrame, Frame, PolicyTag};

/// Startup options for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Where to listen for replica connections.
    pub bind_addr: SocketAddr,
    /// Configured write-quorum size; 0 means "use the floor".
    pub write_quorum: usize,
    /// Configured read-quorum size; 0 means "use the floor".
    pub read_quorum: usize,
    /// Period of the synchronization task (quorum and RYW policies).
    pub sync_interval: Duration,
}

/// A registered replica server.
#[derive(Debug, Clone)]
struct ReplicaEntry {
    addr: SocketAddr,
    /// Highest message id this replica has acknowledged.
    version: u64,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    replicas: Vec<ReplicaEntry>,
    /// Incremented before each assignment; ids start at 1.
    next_message_id: u64,
    /// Highest id the sync task has already broadcast.
    last_sent: u64,
}

/// The coordinator role.
pub struct Coordinator {
    policy: PolicyTag,
    write_quorum: usize,
    read_quorum: usize,
    state: Mutex<CoordinatorState>,
    /// Serializes every write in the system. Under RYW this lock *is* the
    /// token: holding it across the ACQUIRE_LOCK dialog is the GRANTED
    /// state, and sequential/quorum writes queue behind it the same way
    /// concurrent token requests do.
    write_lock: tokio::sync::Mutex<()>,
}

impl Coordinator {
    /// Binds the listener and starts the coordinator: the accept loop, its
    /// worker pool, and (for quorum and RYW) the periodic sync task.
    /// Returns the bound address.
    pub async fn start(policy: PolicyTag, options: CoordinatorOptions) -> Result<SocketAddr> {
        let listener = TcpListener::bind(options.bind_addr).await?;
        let addr = listener.local_addr()?;

        let coordinator = Arc::new(Coordinator {
            policy,
            write_quorum: options.write_quorum,
            read_quorum: options.read_quorum,
            state: Mutex::new(CoordinatorState::default()),
            write_lock: tokio::sync::Mutex::new(()),
        });

        tokio::spawn(run_listener(coordinator.clone(), listener));
        if policy != PolicyTag::Sequential {
            sync::spawn_sync_task(coordinator, options.sync_interval);
        }

        Ok(addr)
    }

    // =========================================================================
    // Registry
    // =========================================================================

    fn register_replica(&self, addr: SocketAddr) -> u64 {
        let mut state = self.state.lock().unwrap();
        let id = state.replicas.len() as u64;
        state.replicas.push(ReplicaEntry { addr, version: 0 });
        id
    }

    fn all_replicas(&self) -> Vec<(usize, ReplicaEntry)> {
        let state = self.state.lock().unwrap();
        state.replicas.iter().cloned().enumerate().collect()
    }

    /// A random selection of `quorum_size(configured)` registered replicas.
    fn random_quorum(&self, configured: usize) -> Vec<(usize, ReplicaEntry)> {
        let state = self.state.lock().unwrap();
        let mut members: Vec<(usize, ReplicaEntry)> =
            state.replicas.iter().cloned().enumerate().collect();
        members.shuffle(&mut rand::thread_rng());
        members.truncate(quorum_size(configured, state.replicas.len()));
        members
    }

    fn record_ack(&self, index: usize, id: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.replicas.get_mut(index) {
            entry.version = entry.version.max(id);
        }
    }

    // =========================================================================
    // Write Propagation
    // =========================================================================

    /// Assigns the next id to a client write and propagates it, returning
    /// the success code for the originating replica.
    ///
    /// A reply to an id that was never assigned is refused before an id
    /// is consumed. The id counter is the only state that can decide
    /// this: the forwarding replica's board may lag write quorums it
    /// missed, so replicas do not judge parents themselves.
    async fn propagate_write(&self, data: DataFrame) -> i32 {
        let _write = self.write_lock.lock().await;

        let id = {
            let mut state = self.state.lock().unwrap();
            if let Some(parent) = data.parent_id {
                if parent == 0 || parent > state.next_message_id {
                    warn!("Rejecting reply to unassigned message {}", parent);
                    return wire::CODE_FAILURE;
                }
            }
            state.next_message_id += 1;
            state.next_message_id
        };
        let targets = match self.policy {
            PolicyTag::Quorum => self.random_quorum(self.write_quorum),
            _ => self.all_replicas(),
        };
        let line = Frame::Data(data.with_id(id)).encode();

        match self.fan_out(&line, id, targets).await {
            Ok(()) => wire::CODE_SUCCESS,
            Err(e) => {
                warn!("Write #{} failed: {}", id, e);
                wire::CODE_FAILURE
            }
        }
    }

    /// Sends an update to every target in parallel and joins the legs.
    ///
    /// Targets that already acknowledged this id are skipped. Any failed
    /// leg fails the write as a whole; survivors keep the update with no
    /// rollback (under quorum and RYW the sync task heals stragglers).
    async fn fan_out(&self, line: &str, id: u64, targets: Vec<(usize, ReplicaEntry)>) -> Result<()> {
        info!("Propagating message #{} to {} replicas", id, targets.len());
        let mut legs: Vec<JoinHandle<Result<usize>>> = Vec::with_capacity(targets.len());
        for (index, entry) in targets {
            if entry.version == id {
                continue;
            }
            let line = line.to_string();
            legs.push(tokio::spawn(async move {
                let mut conn = Connection::open(entry.addr).await?;
                conn.send_line(&line).await?;
                let ack = conn.expect_line().await?;
                if ack != wire::OK {
                    return Err(CorkboardError::protocol(format!(
                        "replica at {} answered '{}'",
                        entry.addr, ack
                    )));
                }
                Ok(index)
            }));
        }

        let mut failed = None;
        for leg in legs {
            match leg.await {
                Ok(Ok(index)) => self.record_ack(index, id),
                Ok(Err(e)) => failed = Some(e),
                Err(e) => failed = Some(CorkboardError::protocol(format!("fan-out task: {}", e))),
            }
        }
        match failed {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    // =========================================================================
    // Read Quorum
    // =========================================================================

    /// Queries a read quorum for versions, then directs the freshest
    /// member to push its board to the requesting replica.
    async fn serve_quorum_read(&self, dest_id: u64) -> Result<()> {
        let dest = {
            let state = self.state.lock().unwrap();
            state
                .replicas
                .get(dest_id as usize)
                .cloned()
                .ok_or_else(|| {
                    CorkboardError::protocol(format!("unknown replica id {}", dest_id))
                })?
        };

        let members = self.random_quorum(self.read_quorum);
        if members.is_empty() {
            return Err(CorkboardError::protocol("no replicas registered"));
        }

        debug!(
            "Querying read quorum for versions: {:?}",
            members.iter().map(|(i, _)| i).collect::<Vec<_>>()
        );
        let mut best: Option<(usize, SocketAddr, u64)> = None;
        for (index, entry) in members {
            let reply = net::request_line(entry.addr, &Frame::VersionQuery.encode()).await?;
            let version: u64 = reply.trim().parse().map_err(|_| {
                CorkboardError::protocol(format!("bad version reply '{}'", reply))
            })?;
            self.record_ack(index, version);
            if best.map_or(true, |(_, _, v)| version > v) {
                best = Some((index, entry.addr, version));
            }
        }

        let Some((source_id, source_addr, version)) = best else {
            return Err(CorkboardError::protocol("read quorum returned no versions"));
        };
        debug!("Freshest quorum member: #{} at version {}", source_id, version);
        self.arrange_transfer(source_addr, dest.addr).await
    }

    /// Tells the source replica to stream its board to the destination.
    async fn arrange_transfer(&self, source: SocketAddr, dest: SocketAddr) -> Result<()> {
        info!("Arranging board transfer from {} to {}", source, dest);
        let frame = Frame::Transfer {
            ip: dest.ip().to_string(),
            port: dest.port(),
        };
        let reply = net::request_line(source, &frame.encode()).await?;
        if reply == wire::OK {
            Ok(())
        } else {
            Err(CorkboardError::protocol(format!(
                "transfer not acknowledged: '{}'",
                reply
            )))
        }
    }

    // =========================================================================
    // RYW Token
    // =========================================================================

    /// Grants the token to the requesting replica and completes the write
    /// dialog: wait for UNLOCK, receive the update (with the id the
    /// token-holder chose), adopt that id, fan out to every replica, and
    /// answer with the success code. The token returns when this method's
    /// lock guard drops.
    async fn grant_token(&self, conn: &mut Connection) -> Result<()> {
        let _token = self.write_lock.lock().await;
        info!("Granting token...");
        conn.send_line(&Frame::GrantLock.encode()).await?;

        loop {
            let line = conn.expect_line().await?;
            if parse_frame(&line)? == Frame::Unlock {
                break;
            }
        }
        info!("Token returned");

        let update = conn.expect_line().await?;
        let Frame::Data(data) = parse_frame(&update)? else {
            return Err(CorkboardError::protocol(format!(
                "expected an update after UNLOCK, got '{}'",
                update
            )));
        };
        let id = data
            .id
            .ok_or_else(|| CorkboardError::protocol("token-holder update carries no id"))?;

        {
            let mut state = self.state.lock().unwrap();
            state.next_message_id = state.next_message_id.max(id);
        }

        let targets = self.all_replicas();
        let code = match self.fan_out(&update, id, targets).await {
            Ok(()) => wire::CODE_SUCCESS,
            Err(e) => {
                warn!("Token-holder write #{} failed: {}", id, e);
                wire::CODE_FAILURE
            }
        };
        conn.send_line(&code.to_string()).await?;
        Ok(())
    }
}

/// Effective quorum size: never below the majority floor, never above the
/// number of registered replicas.
fn quorum_size(configured: usize, replica_count: usize) -> usize {
    let floor = replica_count / 2 + 1;
    configured.max(floor).min(replica_count)
}

// =============================================================================
// Listener
// =============================================================================

/// Accepts replica connections into the bounded queue and runs the worker
/// pool that drains it.
async fn run_listener(coordinator: Arc<Coordinator>, listener: TcpListener) {
    let (tx, rx) = mpsc::channel::<TcpStream>(CONNECTION_QUEUE_CAPACITY);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    for _ in 0..WORKER_POOL_SIZE {
        let coordinator = coordinator.clone();
        let rx = rx.clone();
        tokio::spawn(async move {
            loop {
                let stream = {
                    let mut queue = rx.lock().await;
                    match queue.recv().await {
                        Some(stream) => stream,
                        None => return,
                    }
                };
                if let Err(e) = handle_query(&coordinator, stream).await {
                    warn!("Replica connection error: {}", e);
                }
            }
        });
    }

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                if tx.send(stream).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!("Failed to accept replica connection: {}", e),
        }
    }
}

/// Serves one replica query.
async fn handle_query(coordinator: &Coordinator, stream: TcpStream) -> Result<()> {
    let peer_ip = stream.peer_addr()?.ip();
    let mut conn = Connection::from_stream(stream);
    let line = match conn.read_line().await? {
        Some(line) if !line.is_empty() => line,
        _ => return Ok(()),
    };
    debug!("Replica query: {}", line);

    match parse_frame(&line)? {
        Frame::Data(data) if data.id.is_none() => {
            let code = coordinator.propagate_write(data).await;
            conn.send_line(&code.to_string()).await?;
        }
        Frame::Register { port } => {
            let id = coordinator.register_replica(SocketAddr::new(peer_ip, port));
            info!("Registering server #{} at {}:{}", id, peer_ip, port);
            conn.send_line(&wire::encode_registration(coordinator.policy, id))
                .await?;
        }
        Frame::Policy => {
            conn.send_line(&coordinator.policy.to_string()).await?;
        }
        Frame::QuorumRead { replica_id } => {
            coordinator.serve_quorum_read(replica_id).await?;
            conn.send_line(wire::OK).await?;
        }
        Frame::Check { version } => {
            let next = coordinator.state.lock().unwrap().next_message_id;
            let reply = if version == next { wire::OK } else { wire::WAIT };
            conn.send_line(reply).await?;
        }
        Frame::AcquireLock => {
            coordinator.grant_token(&mut conn).await?;
        }
        _ => {
            warn!("Invalid coordinator command: {}", line);
        }
    }
    Ok(())
}
