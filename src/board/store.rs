//! In-memory bulletin-board store.
//!
//! ## Indexing Strategy
//!
//! Messages live in an arena keyed by id for O(1) lookup. The threaded
//! ordering is kept as secondary indexes: the ordered list of root ids and
//! a per-parent list of reply ids, both maintained on insert. The threaded
//! view is a pre-order walk over those indexes, so it is always a
//! permutation of the arena's members.

use std::collections::HashMap;

use crate::board::message::Message;
use crate::constants::PAGE_SIZE;
use crate::error::{CorkboardError, Result};

/// A single replica's copy of the bulletin board.
///
/// Mutation goes through `insert` under the owner's write lock; readers
/// take the read lock and observe a consistent snapshot.
#[derive(Debug, Default)]
pub struct BulletinBoard {
    /// All messages, keyed by id.
    messages: HashMap<u64, Message>,
    /// Root (POST) ids in insertion order.
    roots: Vec<u64>,
    /// Reply ids per parent, in insertion order.
    children: HashMap<u64, Vec<u64>>,
    /// Highest id ever written to this store.
    version: u64,
}

impl BulletinBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest message id this store has written.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Adds a message to the board.
    ///
    /// Returns `Ok(true)` if the message was new, `Ok(false)` if a message
    /// with the same id already existed (the board is unchanged), which
    /// makes coordinator re-deliveries idempotent.
    ///
    /// # Errors
    /// Returns `ParentMissing` for a reply whose target is not present;
    /// the message is not stored and the version does not advance.
    pub fn insert(&mut self, message: Message) -> Result<bool> {
        let id = message.id();
        if self.messages.contains_key(&id) {
            return Ok(false);
        }

        match message.parent_id() {
            None => self.roots.push(id),
            Some(parent) => {
                if !self.messages.contains_key(&parent) {
                    return Err(CorkboardError::ParentMissing(parent));
                }
                self.children.entry(parent).or_default().push(id);
            }
        }

        self.version = self.version.max(id);
        self.messages.insert(id, message);
        Ok(true)
    }

    /// Looks up a message by id.
    pub fn get(&self, id: u64) -> Option<&Message> {
        self.messages.get(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.messages.contains_key(&id)
    }

    /// The threaded view: pre-order walk of the forest, each message
    /// followed by its reply subtree.
    pub fn threaded(&self) -> Vec<&Message> {
        let mut ordered = Vec::with_capacity(self.messages.len());
        for &root in &self.roots {
            self.collect_subtree(root, &mut ordered);
        }
        ordered
    }

    fn collect_subtree<'a>(&'a self, id: u64, out: &mut Vec<&'a Message>) {
        if let Some(message) = self.messages.get(&id) {
            out.push(message);
            if let Some(replies) = self.children.get(&id) {
                for &reply in replies {
                    self.collect_subtree(reply, out);
                }
            }
        }
    }

    /// Returns up to `PAGE_SIZE` messages from the threaded view, starting
    /// at offset `page_number * PAGE_SIZE`. Past-the-end pages are empty.
    pub fn page(&self, page_number: usize) -> Vec<Message> {
        let Some(start) = page_number.checked_mul(PAGE_SIZE) else {
            return Vec::new();
        };
        self.threaded()
            .into_iter()
            .skip(start)
            .take(PAGE_SIZE)
            .cloned()
            .collect()
    }

    /// Returns every message with `id >= start_id`, in threaded order.
    ///
    /// Used by the synchronization and transfer paths; threaded order puts
    /// parents before their replies, so receivers can apply the result as
    /// a stream.
    pub fn range_from(&self, start_id: u64) -> Vec<Message> {
        self.threaded()
            .into_iter()
            .filter(|m| m.id() >= start_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(id: u64, title: &str) -> Message {
        Message::post(id, title.to_string(), "author".to_string(), "body".to_string())
            .expect("Failed to create post")
    }

    fn reply(id: u64, parent: u64) -> Message {
        Message::reply(
            id,
            parent,
            "re".to_string(),
            "author".to_string(),
            "body".to_string(),
        )
        .expect("Failed to create reply")
    }

    #[test]
    fn test_insert_and_get() {
        let mut board = BulletinBoard::new();
        assert!(board.insert(post(1, "first")).expect("insert failed"));
        assert_eq!(board.get(1).map(|m| m.title()), Some("first"));
        assert_eq!(board.get(2), None);
        assert_eq!(board.version(), 1);
    }

    #[test]
    fn test_duplicate_insert_is_idempotent() {
        let mut board = BulletinBoard::new();
        assert!(board.insert(post(1, "first")).unwrap());
        assert!(!board.insert(post(1, "again")).unwrap());
        assert_eq!(board.len(), 1);
        assert_eq!(board.get(1).map(|m| m.title()), Some("first"));
    }

    #[test]
    fn test_reply_to_missing_parent_rejected() {
        let mut board = BulletinBoard::new();
        let result = board.insert(reply(1, 99));
        assert!(matches!(result, Err(CorkboardError::ParentMissing(99))));
        assert!(board.is_empty());
        // A dropped reply must not advance the version.
        assert_eq!(board.version(), 0);
    }

    #[test]
    fn test_version_tracks_max_id() {
        let mut board = BulletinBoard::new();
        board.insert(post(3, "late")).unwrap();
        assert_eq!(board.version(), 3);
        board.insert(post(1, "early")).unwrap();
        assert_eq!(board.version(), 3);
        board.insert(post(7, "later")).unwrap();
        assert_eq!(board.version(), 7);
    }

    #[test]
    fn test_threaded_order_puts_replies_after_parent() {
        let mut board = BulletinBoard::new();
        board.insert(post(1, "a")).unwrap();
        board.insert(post(2, "b")).unwrap();
        board.insert(reply(3, 1)).unwrap();
        board.insert(reply(4, 3)).unwrap();
        board.insert(reply(5, 2)).unwrap();

        let ids: Vec<u64> = board.threaded().iter().map(|m| m.id()).collect();
        assert_eq!(ids, vec![1, 3, 4, 2, 5]);
    }

    #[test]
    fn test_threaded_is_permutation_of_store() {
        let mut board = BulletinBoard::new();
        board.insert(post(1, "a")).unwrap();
        board.insert(reply(2, 1)).unwrap();
        board.insert(post(3, "b")).unwrap();

        let mut ids: Vec<u64> = board.threaded().iter().map(|m| m.id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(board.len(), 3);
    }

    #[test]
    fn test_page_boundaries() {
        let mut board = BulletinBoard::new();
        for id in 1..=7 {
            board.insert(post(id, &format!("m{}", id))).unwrap();
        }

        let first: Vec<u64> = board.page(0).iter().map(|m| m.id()).collect();
        assert_eq!(first, vec![1, 2, 3, 4, 5]);

        let second: Vec<u64> = board.page(1).iter().map(|m| m.id()).collect();
        assert_eq!(second, vec![6, 7]);

        assert!(board.page(2).is_empty());
        assert!(board.page(usize::MAX).is_empty());
    }

    #[test]
    fn test_range_from_filters_by_id_in_threaded_order() {
        let mut board = BulletinBoard::new();
        board.insert(post(1, "a")).unwrap();
        board.insert(post(2, "b")).unwrap();
        board.insert(reply(3, 1)).unwrap();

        let ids: Vec<u64> = board.range_from(2).iter().map(|m| m.id()).collect();
        // Threaded order is [1, 3, 2]; the filter keeps 3 then 2.
        assert_eq!(ids, vec![3, 2]);

        let all: Vec<u64> = board.range_from(1).iter().map(|m| m.id()).collect();
        assert_eq!(all, vec![1, 3, 2]);

        assert!(board.range_from(4).is_empty());
    }
}
