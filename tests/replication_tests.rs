//! End-to-end tests for the replicated bulletin board.
//!
//! Each test stands up a real primary (coordinator + co-located replica)
//! and, where needed, extra replicas on loopback sockets, then drives the
//! system through the client and replication wire protocols. Delay
//! emulation stays off and sync intervals are shortened through the
//! coordinator options, so the tests run at full speed.

use std::net::SocketAddr;
use std::time::Duration;

use corkboard::coordinator::{Coordinator, CoordinatorOptions};
use corkboard::net::{self, Connection};
use corkboard::replica::{Replica, ReplicaHandle};
use corkboard::wire::PolicyTag;

/// A sync period long enough to never fire during a test.
const SYNC_NEVER: Duration = Duration::from_secs(3600);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().expect("loopback address")
}

/// Starts a coordinator on an ephemeral port and returns its address.
async fn start_primary(
    policy: PolicyTag,
    write_quorum: usize,
    read_quorum: usize,
    sync_interval: Duration,
) -> SocketAddr {
    Coordinator::start(
        policy,
        CoordinatorOptions {
            bind_addr: loopback(),
            write_quorum,
            read_quorum,
            sync_interval,
        },
    )
    .await
    .expect("Failed to start coordinator")
}

async fn start_replica(primary: SocketAddr) -> ReplicaHandle {
    Replica::start(primary, loopback(), loopback())
        .await
        .expect("Failed to start replica")
}

/// One-shot client request returning the single reply line.
async fn send_request(addr: SocketAddr, line: &str) -> String {
    net::request_line(addr, line)
        .await
        .expect("Client request failed")
}

/// Issues READ and collects the page lines up to the blank terminator.
async fn read_page(addr: SocketAddr, page: usize) -> Vec<String> {
    let mut conn = Connection::open(addr).await.expect("Failed to connect");
    conn.send_line(&format!("READ::{}", page))
        .await
        .expect("Failed to send READ");
    let mut lines = Vec::new();
    loop {
        match conn.read_line().await.expect("Failed to read page line") {
            Some(line) if line.is_empty() => break,
            Some(line) => lines.push(line),
            None => break,
        }
    }
    lines
}

/// Queries a replica's version through its coordinator-facing port.
async fn peer_version(peer_addr: SocketAddr) -> u64 {
    send_request(peer_addr, "VERSION_QUERY")
        .await
        .trim()
        .parse()
        .expect("Version reply was not a number")
}

/// Pulls a replica's full board through its coordinator-facing port.
async fn peer_updates(peer_addr: SocketAddr) -> Vec<String> {
    let mut conn = Connection::open(peer_addr).await.expect("Failed to connect");
    conn.send_line("SEND_UPDATES::1")
        .await
        .expect("Failed to send SEND_UPDATES");
    let mut lines = Vec::new();
    loop {
        match conn.read_line().await.expect("Failed to read update line") {
            Some(line) if line.is_empty() => break,
            Some(line) => lines.push(line),
            None => break,
        }
    }
    lines
}

// =============================================================================
// Sequential Consistency
// =============================================================================

#[tokio::test]
async fn test_sequential_single_replica_post_and_read() {
    let primary = start_primary(PolicyTag::Sequential, 0, 0, SYNC_NEVER).await;
    let replica = start_replica(primary).await;
    assert_eq!(replica.policy, PolicyTag::Sequential);
    assert_eq!(replica.replica_id, 0);

    let code = send_request(replica.client_addr, "POST::Weather::Alice::Sunny").await;
    assert_eq!(code, "0");

    let page = read_page(replica.client_addr, 0).await;
    assert_eq!(page, vec!["POST::Weather::Alice::Sunny::1".to_string()]);

    // Pages past the end are empty.
    assert!(read_page(replica.client_addr, 1).await.is_empty());
}

#[tokio::test]
async fn test_reply_to_missing_parent_rejected() {
    let primary = start_primary(PolicyTag::Sequential, 0, 0, SYNC_NEVER).await;
    let replica = start_replica(primary).await;

    let code = send_request(replica.client_addr, "POST::Weather::Alice::Sunny").await;
    assert_eq!(code, "0");

    let code = send_request(replica.client_addr, "REPLY::99::Re::Bob::Nope").await;
    assert_eq!(code, "1");

    // The board is unchanged.
    let page = read_page(replica.client_addr, 0).await;
    assert_eq!(page, vec!["POST::Weather::Alice::Sunny::1".to_string()]);
}

#[tokio::test]
async fn test_sequential_fan_out_to_second_replica() {
    let primary = start_primary(PolicyTag::Sequential, 0, 0, SYNC_NEVER).await;
    let first = start_replica(primary).await;
    let second = start_replica(primary).await;
    assert_eq!(second.replica_id, 1);

    let code = send_request(first.client_addr, "POST::A::x::a").await;
    assert_eq!(code, "0");

    // The write is applied everywhere before the client is acknowledged.
    let page = read_page(second.client_addr, 0).await;
    assert_eq!(page, vec!["POST::A::x::a::1".to_string()]);
}

#[tokio::test]
async fn test_sequential_replies_thread_under_parent() {
    let primary = start_primary(PolicyTag::Sequential, 0, 0, SYNC_NEVER).await;
    let replica = start_replica(primary).await;

    assert_eq!(send_request(replica.client_addr, "POST::First::a::1").await, "0");
    assert_eq!(send_request(replica.client_addr, "POST::Second::b::2").await, "0");
    assert_eq!(send_request(replica.client_addr, "REPLY::1::Re::c::3").await, "0");

    // Threaded order: the reply follows its parent, before the second post.
    let page = read_page(replica.client_addr, 0).await;
    assert_eq!(
        page,
        vec![
            "POST::First::a::1::1".to_string(),
            "REPLY::1::Re::c::3::3".to_string(),
            "POST::Second::b::2::2".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_choose_returns_message_or_error() {
    let primary = start_primary(PolicyTag::Sequential, 0, 0, SYNC_NEVER).await;
    let replica = start_replica(primary).await;

    send_request(replica.client_addr, "POST::Weather::Alice::Sunny").await;

    let found = send_request(replica.client_addr, "CHOOSE::1").await;
    assert_eq!(found, "POST::Weather::Alice::Sunny::1");

    let missing = send_request(replica.client_addr, "CHOOSE::42").await;
    assert_eq!(missing, "Does not exist. Message with ID: 42");
}

// =============================================================================
// Quorum Consistency
// =============================================================================

#[tokio::test]
async fn test_quorum_read_recovers_missing_updates() {
    // Three replicas, Nw = Nr = 2, so every read quorum intersects every
    // write quorum.
    let primary = start_primary(PolicyTag::Quorum, 2, 2, SYNC_NEVER).await;
    let first = start_replica(primary).await;
    let second = start_replica(primary).await;
    let third = start_replica(primary).await;

    let code = send_request(first.client_addr, "POST::T::u::b").await;
    assert_eq!(code, "0");

    // The write reached a quorum of two replicas; whichever replica we
    // read from, the read-quorum step pulls the freshest board first.
    for replica in [&first, &second, &third] {
        let page = read_page(replica.client_addr, 0).await;
        assert_eq!(
            page,
            vec!["POST::T::u::b::1".to_string()],
            "replica #{} did not recover the update",
            replica.replica_id
        );
    }
}

#[tokio::test]
async fn test_quorum_reply_accepted_from_lagging_replica() {
    // Nw = 2 of 3: every post misses one replica, so at least one of the
    // repliers below lags behind the parent it replies to.
    let primary = start_primary(PolicyTag::Quorum, 2, 2, SYNC_NEVER).await;
    let first = start_replica(primary).await;
    let second = start_replica(primary).await;
    let third = start_replica(primary).await;

    let code = send_request(first.client_addr, "POST::Root::u::b").await;
    assert_eq!(code, "0");

    // The parent exists system-wide; no replica may reject a reply to
    // it, however stale its own board is.
    for replica in [&first, &second, &third] {
        let code = send_request(replica.client_addr, "REPLY::1::Re::v::c").await;
        assert_eq!(
            code, "0",
            "replica #{} rejected a reply to an existing message",
            replica.replica_id
        );
    }

    // A reply to an id the coordinator never assigned still fails.
    let code = send_request(second.client_addr, "REPLY::99::Re::v::c").await;
    assert_eq!(code, "1");
}

#[tokio::test]
async fn test_quorum_sync_converges_all_replicas() {
    let sync_interval = Duration::from_millis(300);
    let primary = start_primary(PolicyTag::Quorum, 2, 2, sync_interval).await;
    let first = start_replica(primary).await;
    let second = start_replica(primary).await;
    let third = start_replica(primary).await;

    let code = send_request(first.client_addr, "POST::T::u::b").await;
    assert_eq!(code, "0");

    // At least the write quorum holds the update already.
    let mut versions = 0;
    for replica in [&first, &second, &third] {
        versions += peer_version(replica.peer_addr).await;
    }
    assert!(versions >= 2, "write quorum too small: {}", versions);

    // After a sync period every replica has converged, without any read
    // quorum being involved.
    tokio::time::sleep(4 * sync_interval).await;
    for replica in [&first, &second, &third] {
        assert_eq!(peer_version(replica.peer_addr).await, 1);
        assert_eq!(
            peer_updates(replica.peer_addr).await,
            vec!["POST::T::u::b::1".to_string()]
        );
    }
}

// =============================================================================
// Read-Your-Writes
// =============================================================================

#[tokio::test]
async fn test_ryw_write_is_locally_visible() {
    let primary = start_primary(PolicyTag::Ryw, 0, 0, SYNC_NEVER).await;
    let replica = start_replica(primary).await;
    assert_eq!(replica.policy, PolicyTag::Ryw);

    let code = send_request(replica.client_addr, "POST::Note::me::hello").await;
    assert_eq!(code, "0");

    let page = read_page(replica.client_addr, 0).await;
    assert_eq!(page, vec!["POST::Note::me::hello::1".to_string()]);
}

#[tokio::test]
async fn test_ryw_concurrent_writes_converge() {
    let primary = start_primary(PolicyTag::Ryw, 0, 0, SYNC_NEVER).await;
    let first = start_replica(primary).await;
    let second = start_replica(primary).await;

    // Two concurrent posts, one per replica. The token serializes them.
    let (a, b) = tokio::join!(
        send_request(first.client_addr, "POST::One::alice::from-first"),
        send_request(second.client_addr, "POST::Two::bob::from-second"),
    );
    assert_eq!(a, "0");
    assert_eq!(b, "0");

    // Every replica ends up with both messages, ids 1 and 2 in some order.
    let mut boards = Vec::new();
    for replica in [&first, &second] {
        let mut lines = read_page(replica.client_addr, 0).await;
        assert_eq!(lines.len(), 2, "replica #{}", replica.replica_id);
        lines.sort();
        boards.push(lines);
    }
    assert_eq!(boards[0], boards[1]);

    let joined = boards[0].join("\n");
    assert!(joined.contains("::from-first::"));
    assert!(joined.contains("::from-second::"));
    assert!(joined.contains("::1") && joined.contains("::2"));
}

// =============================================================================
// Input Errors
// =============================================================================

#[tokio::test]
async fn test_malformed_writes_fail_cleanly() {
    let primary = start_primary(PolicyTag::Sequential, 0, 0, SYNC_NEVER).await;
    let replica = start_replica(primary).await;

    // Wrong field count.
    assert_eq!(send_request(replica.client_addr, "POST::only::two").await, "1");
    // Non-numeric parent id.
    assert_eq!(
        send_request(replica.client_addr, "REPLY::abc::t::a::b").await,
        "1"
    );
    // A client-supplied id is refused, not silently dropped.
    assert_eq!(
        send_request(replica.client_addr, "POST::t::a::b::9").await,
        "1"
    );
    // A malformed READ yields an empty page.
    assert!(read_page_raw(replica.client_addr, "READ::notanumber").await.is_empty());

    // The server is still healthy afterwards.
    assert_eq!(
        send_request(replica.client_addr, "POST::Still::Works::Fine").await,
        "0"
    );
}

async fn read_page_raw(addr: SocketAddr, request: &str) -> Vec<String> {
    let mut conn = Connection::open(addr).await.expect("Failed to connect");
    conn.send_line(request).await.expect("Failed to send");
    let mut lines = Vec::new();
    loop {
        match conn.read_line().await.expect("Failed to read") {
            Some(line) if line.is_empty() => break,
            Some(line) => lines.push(line),
            None => break,
        }
    }
    lines
}
