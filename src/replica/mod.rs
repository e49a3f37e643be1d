//! The replica server: a local bulletin board behind a client-facing
//! listener, kept consistent with its peers through the coordinator.
//!
//! Client connections are accepted into a bounded queue drained by a fixed
//! pool of workers; each connection carries a single request (POST, REPLY,
//! READ, or CHOOSE) which is routed through the policy layer before it
//! touches the local store. A second, coordinator-facing listener applies
//! replication traffic (see the `peer` module).

mod peer;
mod policy;

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::board::{BulletinBoard, Message};
use crate::constants::{CONNECTION_QUEUE_CAPACITY, FIELD_SEPARATOR, WORKER_POOL_SIZE};
use crate::error::Result;
use crate::net::{self, Connection};
use crate::wire::{self, parse_frame, Frame, PolicyTag};

/// A running replica's shared state.
pub struct Replica {
    store: RwLock<BulletinBoard>,
    policy: PolicyTag,
    replica_id: u64,
    primary: SocketAddr,
}

/// Handle returned by [`Replica::start`], carrying the bound addresses and
/// the client accept-loop task.
pub struct ReplicaHandle {
    pub replica_id: u64,
    pub policy: PolicyTag,
    /// Where clients connect.
    pub client_addr: SocketAddr,
    /// Where the coordinator and other replicas connect.
    pub peer_addr: SocketAddr,
    /// The client accept loop; runs until the process exits.
    pub client_task: JoinHandle<()>,
}

impl Replica {
    /// Binds both listeners, registers with the primary, and starts
    /// serving. The policy is whatever the coordinator advertises in the
    /// registration reply; any locally configured policy is ignored.
    pub async fn start(
        primary: SocketAddr,
        client_bind: SocketAddr,
        peer_bind: SocketAddr,
    ) -> Result<ReplicaHandle> {
        // The peer listener must be up before registration: the
        // coordinator may fan out to us as soon as we are in its registry.
        let peer_listener = TcpListener::bind(peer_bind).await?;
        let peer_addr = peer_listener.local_addr()?;

        let (policy, replica_id) = register_with_primary(primary, peer_addr.port()).await?;
        info!(
            "Registered with primary as replica #{} under the {} policy",
            replica_id, policy
        );

        let replica = Arc::new(Replica {
            store: RwLock::new(BulletinBoard::new()),
            policy,
            replica_id,
            primary,
        });

        tokio::spawn(peer::run_peer_listener(replica.clone(), peer_listener));

        let client_listener = TcpListener::bind(client_bind).await?;
        let client_addr = client_listener.local_addr()?;
        let client_task = tokio::spawn(run_client_listener(replica, client_listener));

        Ok(ReplicaHandle {
            replica_id,
            policy,
            client_addr,
            peer_addr,
            client_task,
        })
    }

    pub fn policy(&self) -> PolicyTag {
        self.policy
    }

    pub fn replica_id(&self) -> u64 {
        self.replica_id
    }

    fn primary(&self) -> SocketAddr {
        self.primary
    }

    fn version(&self) -> u64 {
        self.store.read().unwrap().version()
    }

    fn contains(&self, id: u64) -> bool {
        self.store.read().unwrap().contains(id)
    }

    fn page_lines(&self, page: usize) -> Vec<String> {
        self.store
            .read()
            .unwrap()
            .page(page)
            .iter()
            .map(Message::to_network_format)
            .collect()
    }

    fn choose_line(&self, id: u64) -> Option<String> {
        self.store
            .read()
            .unwrap()
            .get(id)
            .map(Message::to_network_format)
    }

    fn snapshot_range(&self, start_id: u64) -> Vec<Message> {
        self.store.read().unwrap().range_from(start_id)
    }
}

/// Registers with the primary and returns the advertised policy and the
/// assigned replica id.
async fn register_with_primary(primary: SocketAddr, peer_port: u16) -> Result<(PolicyTag, u64)> {
    let reply = net::request_line(primary, &Frame::Register { port: peer_port }.encode())
        .await
        .map_err(|e| {
            crate::error::CorkboardError::registration(format!(
                "cannot reach primary at {}: {}",
                primary, e
            ))
        })?;
    wire::parse_registration(&reply)
}

/// Accepts client connections into the bounded queue and runs the worker
/// pool that drains it.
async fn run_client_listener(replica: Arc<Replica>, listener: TcpListener) {
    let (tx, rx) = mpsc::channel::<TcpStream>(CONNECTION_QUEUE_CAPACITY);
    let rx = Arc::new(Mutex::new(rx));

    for _ in 0..WORKER_POOL_SIZE {
        let replica = replica.clone();
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
                if let Err(e) = handle_client(&replica, stream).await {
                    warn!("Client connection error: {}", e);
                }
            }
        });
    }

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                // Blocks when the queue is full, pushing back on accepts.
                if tx.send(stream).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!("Failed to accept client connection: {}", e),
        }
    }
}

/// Serves a single one-shot client request.
async fn handle_client(replica: &Replica, stream: TcpStream) -> Result<()> {
    let mut conn = Connection::from_stream(stream);
    let line = match conn.read_line().await? {
        Some(line) if !line.is_empty() => line,
        _ => return Ok(()),
    };
    debug!("Client request: {}", line);

    let frame = match parse_frame(&line) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Invalid client request ({}): {}", e, line);
            respond_to_malformed(&mut conn, &line).await?;
            return Ok(());
        }
    };

    match frame {
        Frame::Data(data) => {
            // Ids are assigned by the system; a client-supplied one is
            // refused with a failure code, never with silence.
            let code = if data.id.is_some() {
                warn!("Rejecting client write that carries an id: {}", line);
                wire::CODE_FAILURE
            } else {
                policy::post(replica, data).await
            };
            conn.send_line(&code.to_string()).await?;
        }
        Frame::Read { page } => {
            let lines = match policy::before_read(replica).await {
                Ok(()) => replica.page_lines(page),
                Err(e) => {
                    warn!("Read precondition failed: {}", e);
                    Vec::new()
                }
            };
            for line in lines {
                conn.send_line(&line).await?;
            }
            conn.send_line("").await?;
        }
        Frame::Choose { id } => {
            let found = match policy::before_read(replica).await {
                Ok(()) => replica.choose_line(id),
                Err(e) => {
                    warn!("Choose precondition failed: {}", e);
                    None
                }
            };
            match found {
                Some(line) => conn.send_line(&line).await?,
                None => {
                    conn.send_line(&format!("Does not exist. Message with ID: {}", id))
                        .await?
                }
            }
        }
        _ => {
            warn!("Invalid client command: {}", line);
        }
    }
    Ok(())
}

/// Keeps the per-operation response shape even when the request line does
/// not parse: writes get a failure code, reads an empty page.
async fn respond_to_malformed(conn: &mut Connection, line: &str) -> Result<()> {
    match line.split(FIELD_SEPARATOR).next() {
        Some("POST") | Some("REPLY") => {
            conn.send_line(&wire::CODE_FAILURE.to_string()).await?;
        }
        Some("READ") => {
            conn.send_line("").await?;
        }
        _ => {}
    }
    Ok(())
}
