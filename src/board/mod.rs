//! The bulletin-board data model.
//!
//! A board is a forest of POST roots, each carrying a subtree of REPLY
//! descendants. Messages are created once and never mutated; the store
//! tracks the highest message id it has ever written as its `version`.

pub mod message;
pub mod store;

pub use message::{Message, MessageKind};
pub use store::BulletinBoard;
