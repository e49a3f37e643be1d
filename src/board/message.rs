//! Message representation for the bulletin board.
//!
//! A message is either a top-level POST or a REPLY to an existing message.
//! The network format is one line of `::`-separated fields:
//!
//! - `POST::title::author::body::id`
//! - `REPLY::parent_id::title::author::body::id`

use crate::constants::FIELD_SEPARATOR;
use crate::error::{CorkboardError, Result};

/// Whether a message starts a new thread or replies to an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Post,
    Reply,
}

impl MessageKind {
    /// Returns the leading tag used on the wire for this kind.
    pub fn tag(self) -> &'static str {
        match self {
            MessageKind::Post => "POST",
            MessageKind::Reply => "REPLY",
        }
    }
}

/// A single bulletin-board message.
///
/// Ids are positive and globally unique; they are assigned by the
/// coordinator (or by the token-holding replica under read-your-writes)
/// before the message reaches any store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: u64,
    kind: MessageKind,
    title: String,
    author: String,
    body: String,
    parent_id: Option<u64>,
}

impl Message {
    /// Creates a new top-level post.
    ///
    /// # Errors
    /// Returns a validation error if the id is zero or any field contains
    /// the field separator or a line break.
    pub fn post(id: u64, title: String, author: String, body: String) -> Result<Self> {
        validate_id(id)?;
        validate_field("title", &title)?;
        validate_field("author", &author)?;
        validate_field("body", &body)?;
        Ok(Self {
            id,
            kind: MessageKind::Post,
            title,
            author,
            body,
            parent_id: None,
        })
    }

    /// Creates a new reply to the message identified by `parent_id`.
    ///
    /// The store, not this constructor, checks that the parent exists.
    pub fn reply(
        id: u64,
        parent_id: u64,
        title: String,
        author: String,
        body: String,
    ) -> Result<Self> {
        validate_id(id)?;
        validate_id(parent_id)?;
        validate_field("title", &title)?;
        validate_field("author", &author)?;
        validate_field("body", &body)?;
        Ok(Self {
            id,
            kind: MessageKind::Reply,
            title,
            author,
            body,
            parent_id: Some(parent_id),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Returns the id of the message this one replies to, if any.
    pub fn parent_id(&self) -> Option<u64> {
        self.parent_id
    }

    /// Converts the message to its one-line network format, id included.
    pub fn to_network_format(&self) -> String {
        match self.parent_id {
            None => [
                self.kind.tag(),
                &self.title,
                &self.author,
                &self.body,
                &self.id.to_string(),
            ]
            .join(FIELD_SEPARATOR),
            Some(parent) => [
                self.kind.tag(),
                &parent.to_string(),
                &self.title,
                &self.author,
                &self.body,
                &self.id.to_string(),
            ]
            .join(FIELD_SEPARATOR),
        }
    }
}

fn validate_id(id: u64) -> Result<()> {
    if id == 0 {
        return Err(CorkboardError::validation("message ids start at 1"));
    }
    Ok(())
}

fn validate_field(name: &str, value: &str) -> Result<()> {
    if value.contains(FIELD_SEPARATOR) {
        return Err(CorkboardError::validation(format!(
            "{} must not contain the field separator '{}'",
            name, FIELD_SEPARATOR
        )));
    }
    if value.contains('\n') || value.contains('\r') {
        return Err(CorkboardError::validation(format!(
            "{} must not contain line breaks",
            name
        )));
    }
    Ok(())
}
