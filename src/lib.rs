//! # corkboard - Replicated Bulletin Board
//!
//! A distributed bulletin-board service: a primary coordinator plus any
//! number of replica servers, kept consistent under one of three pluggable
//! policies over a simple post/read/choose/reply API.
//!
//! ## Consistency Policies
//!
//! - **Sequential**: every write is applied to every replica in the same
//!   total order before the client is acknowledged; reads are local.
//! - **Quorum (Nr/Nw)**: writes land on a random write quorum; reads first
//!   pull the freshest board from a read quorum, and a periodic sync task
//!   converges the stragglers.
//! - **Read-your-writes**: a coordinator-held token serializes writers,
//!   who write locally and then hand the update back for fan-out; reads
//!   poll the coordinator until no newer updates exist.
//!
//! ## Roles
//!
//! Every process is a replica: a local in-memory message tree behind a
//! client-facing listener. The primary process additionally runs the
//! coordinator, which holds the replica registry and drives replication
//! but keeps no board state of its own.
//!
//! The wire protocol is newline-terminated frames of `::`-separated
//! fields, one request per connection; see the `wire` module.

pub mod board;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod error;
pub mod net;
pub mod replica;
pub mod wire;

pub use error::{CorkboardError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
