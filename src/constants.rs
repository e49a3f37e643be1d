//! Shared constants for the wire protocol and server tuning.
//!
//! These are used by both the replica and coordinator sides so that every
//! process in the system agrees on protocol shape and timing.

// =============================================================================
// Wire Protocol
// =============================================================================

/// Field separator inside a frame. Message fields must never contain it.
pub const FIELD_SEPARATOR: &str = "::";

// =============================================================================
// Bulletin Board
// =============================================================================

/// Number of messages per page served by the READ operation.
pub const PAGE_SIZE: usize = 5;

// =============================================================================
// Connection Handling
// =============================================================================

/// Fixed number of worker tasks draining each connection queue.
pub const WORKER_POOL_SIZE: usize = 5;

/// Capacity of the bounded queue of accepted connections.
pub const CONNECTION_QUEUE_CAPACITY: usize = 10;

// =============================================================================
// Coordinator Defaults
// =============================================================================

/// Address at which replicas expect to find the coordinator.
pub const DEFAULT_PRIMARY_ADDR: &str = "localhost:10000";

/// Seconds between synchronization cycles on a quorum or RYW primary.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;

// =============================================================================
// Consistency Dialogs
// =============================================================================

/// Sleep between CHECK retries while the coordinator answers WAIT.
pub const CHECK_POLL_INTERVAL_MS: u64 = 100;

// =============================================================================
// WAN Delay Emulation
// =============================================================================

/// Lower bound of the simulated wide-area delay, in milliseconds.
pub const DELAY_MIN_MS: u64 = 100;

/// Upper bound (inclusive) of the simulated wide-area delay, in milliseconds.
pub const DELAY_MAX_MS: u64 = 399;
