//! Line codec for the client and replication protocols.
//!
//! Every frame is one newline-terminated line of fields separated by the
//! literal `::`. Two data shapes carry messages:
//!
//! - `POST::title::author::body[::id]`
//! - `REPLY::parent_id::title::author::body[::id]`
//!
//! The id suffix is present once the coordinator (or the token-holding
//! replica) has assigned one; client submissions arrive without it.
//! Everything else is a control frame exchanged on the replica↔coordinator
//! channel. The codec rejects frames whose field count does not match the
//! leading tag, and unknown tags.

use std::fmt;
use std::str::FromStr;

use crate::board::message::{Message, MessageKind};
use crate::constants::FIELD_SEPARATOR;
use crate::error::{CorkboardError, Result};

/// Acknowledgement reply.
pub const OK: &str = "OK";

/// Reply telling a CHECK poller to retry.
pub const WAIT: &str = "WAIT";

/// Success code returned to clients for accepted writes.
pub const CODE_SUCCESS: i32 = 0;

/// Failure code returned to clients for rejected or failed writes.
pub const CODE_FAILURE: i32 = 1;

// =============================================================================
// Consistency Policy Tags
// =============================================================================

/// The consistency policy a system runs under.
///
/// The primary advertises its tag in the registration reply and every
/// replica adopts it, so the whole system agrees on a single policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyTag {
    Sequential,
    Quorum,
    Ryw,
}

impl fmt::Display for PolicyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            PolicyTag::Sequential => "sequential",
            PolicyTag::Quorum => "quorum",
            PolicyTag::Ryw => "ryw",
        };
        f.write_str(tag)
    }
}

impl FromStr for PolicyTag {
    type Err = CorkboardError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sequential" => Ok(PolicyTag::Sequential),
            "quorum" => Ok(PolicyTag::Quorum),
            "ryw" => Ok(PolicyTag::Ryw),
            other => Err(CorkboardError::protocol(format!(
                "unknown consistency policy '{}'",
                other
            ))),
        }
    }
}

// =============================================================================
// Frames
// =============================================================================

/// A POST or REPLY payload as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub kind: MessageKind,
    /// Present iff this is a REPLY.
    pub parent_id: Option<u64>,
    pub title: String,
    pub author: String,
    pub body: String,
    /// Present once an id has been assigned.
    pub id: Option<u64>,
}

impl DataFrame {
    /// Builds the wire form of an already-stored message.
    pub fn from_message(message: &Message) -> Self {
        Self {
            kind: message.kind(),
            parent_id: message.parent_id(),
            title: message.title().to_string(),
            author: message.author().to_string(),
            body: message.body().to_string(),
            id: Some(message.id()),
        }
    }

    /// Returns a copy of the frame carrying the given assigned id.
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Converts the frame into a `Message`, overriding any carried id.
    pub fn into_message(self, id: u64) -> Result<Message> {
        match self.parent_id {
            None => Message::post(id, self.title, self.author, self.body),
            Some(parent) => Message::reply(id, parent, self.title, self.author, self.body),
        }
    }

    /// Converts a frame that already carries its id into a `Message`.
    ///
    /// # Errors
    /// Returns a protocol error when the id is absent, which means the
    /// frame came from a client rather than the coordinator.
    pub fn message(self) -> Result<Message> {
        let id = self
            .id
            .ok_or_else(|| CorkboardError::protocol("data frame carries no id"))?;
        self.into_message(id)
    }

    fn encode(&self) -> String {
        let mut fields: Vec<String> = vec![self.kind.tag().to_string()];
        if let Some(parent) = self.parent_id {
            fields.push(parent.to_string());
        }
        fields.push(self.title.clone());
        fields.push(self.author.clone());
        fields.push(self.body.clone());
        if let Some(id) = self.id {
            fields.push(id.to_string());
        }
        fields.join(FIELD_SEPARATOR)
    }
}

/// Every frame understood by the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A POST or REPLY payload.
    Data(DataFrame),
    /// Client request for a 5-message page of the threaded view.
    Read { page: usize },
    /// Client request for a single message by id.
    Choose { id: u64 },
    /// Replica introducing itself; the port is its coordinator-facing
    /// listener, the ip is taken from the connection's peer address.
    Register { port: u16 },
    /// Query for the coordinator's policy tag.
    Policy,
    /// Query for a replica's current version.
    VersionQuery,
    /// RYW read precondition: is this version current?
    Check { version: u64 },
    /// Quorum read precondition: bring the given replica up to date.
    QuorumRead { replica_id: u64 },
    /// RYW write: request the token.
    AcquireLock,
    /// RYW write: the coordinator hands over the token.
    GrantLock,
    /// RYW write: the replica returns the token.
    Unlock,
    /// Instruct a replica to push its board to another replica.
    Transfer { ip: String, port: u16 },
    /// Instruct a replica to stream every message with id >= start_id.
    SendUpdates { start_id: u64 },
}

impl Frame {
    /// Encodes the frame as a line (without the trailing newline).
    pub fn encode(&self) -> String {
        match self {
            Frame::Data(data) => data.encode(),
            Frame::Read { page } => format!("READ{}{}", FIELD_SEPARATOR, page),
            Frame::Choose { id } => format!("CHOOSE{}{}", FIELD_SEPARATOR, id),
            Frame::Register { port } => format!("REGISTER{}{}", FIELD_SEPARATOR, port),
            Frame::Policy => "POLICY".to_string(),
            Frame::VersionQuery => "VERSION_QUERY".to_string(),
            Frame::Check { version } => format!("CHECK{}{}", FIELD_SEPARATOR, version),
            Frame::QuorumRead { replica_id } => {
                format!("QUORUM_READ{}{}", FIELD_SEPARATOR, replica_id)
            }
            Frame::AcquireLock => "ACQUIRE_LOCK".to_string(),
            Frame::GrantLock => "GRANT_LOCK".to_string(),
            Frame::Unlock => "UNLOCK".to_string(),
            Frame::Transfer { ip, port } => format!(
                "SERVER_TO_SERVER_TRANSFER{}{}{}{}",
                FIELD_SEPARATOR, ip, FIELD_SEPARATOR, port
            ),
            Frame::SendUpdates { start_id } => {
                format!("SEND_UPDATES{}{}", FIELD_SEPARATOR, start_id)
            }
        }
    }
}

/// Parses one line into a frame.
///
/// # Errors
/// Returns a protocol error for unknown tags, field counts that do not
/// match the tag, and non-numeric fields where numbers are required.
pub fn parse_frame(line: &str) -> Result<Frame> {
    let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
    match fields[0] {
        "POST" => match fields.len() {
            4 | 5 => Ok(Frame::Data(DataFrame {
                kind: MessageKind::Post,
                parent_id: None,
                title: fields[1].to_string(),
                author: fields[2].to_string(),
                body: fields[3].to_string(),
                id: parse_optional_id(&fields, 4)?,
            })),
            n => Err(bad_field_count("POST", n)),
        },
        "REPLY" => match fields.len() {
            5 | 6 => Ok(Frame::Data(DataFrame {
                kind: MessageKind::Reply,
                parent_id: Some(parse_number(fields[1], "parent id")?),
                title: fields[2].to_string(),
                author: fields[3].to_string(),
                body: fields[4].to_string(),
                id: parse_optional_id(&fields, 5)?,
            })),
            n => Err(bad_field_count("REPLY", n)),
        },
        "READ" => {
            expect_fields("READ", &fields, 2)?;
            Ok(Frame::Read {
                page: parse_number(fields[1], "page number")?,
            })
        }
        "CHOOSE" => {
            expect_fields("CHOOSE", &fields, 2)?;
            Ok(Frame::Choose {
                id: parse_number(fields[1], "message id")?,
            })
        }
        "REGISTER" => {
            expect_fields("REGISTER", &fields, 2)?;
            Ok(Frame::Register {
                port: parse_number(fields[1], "port")?,
            })
        }
        "POLICY" => {
            expect_fields("POLICY", &fields, 1)?;
            Ok(Frame::Policy)
        }
        "VERSION_QUERY" => {
            expect_fields("VERSION_QUERY", &fields, 1)?;
            Ok(Frame::VersionQuery)
        }
        "CHECK" => {
            expect_fields("CHECK", &fields, 2)?;
            Ok(Frame::Check {
                version: parse_number(fields[1], "version")?,
            })
        }
        "QUORUM_READ" => {
            expect_fields("QUORUM_READ", &fields, 2)?;
            Ok(Frame::QuorumRead {
                replica_id: parse_number(fields[1], "replica id")?,
            })
        }
        "ACQUIRE_LOCK" => {
            expect_fields("ACQUIRE_LOCK", &fields, 1)?;
            Ok(Frame::AcquireLock)
        }
        "GRANT_LOCK" => {
            expect_fields("GRANT_LOCK", &fields, 1)?;
            Ok(Frame::GrantLock)
        }
        "UNLOCK" => {
            expect_fields("UNLOCK", &fields, 1)?;
            Ok(Frame::Unlock)
        }
        "SERVER_TO_SERVER_TRANSFER" => {
            // An IPv6 host contains the field separator itself, so the port
            // is the last field and the host is everything in between.
            if fields.len() < 3 {
                return Err(bad_field_count("SERVER_TO_SERVER_TRANSFER", fields.len()));
            }
            let port = parse_number(fields[fields.len() - 1], "port")?;
            let ip = fields[1..fields.len() - 1].join(FIELD_SEPARATOR);
            Ok(Frame::Transfer { ip, port })
        }
        "SEND_UPDATES" => {
            expect_fields("SEND_UPDATES", &fields, 2)?;
            Ok(Frame::SendUpdates {
                start_id: parse_number(fields[1], "start id")?,
            })
        }
        other => Err(CorkboardError::protocol(format!(
            "unknown frame tag '{}'",
            other
        ))),
    }
}

// =============================================================================
// Registration Reply
// =============================================================================

/// Encodes the coordinator's reply to a REGISTER frame.
pub fn encode_registration(policy: PolicyTag, replica_id: u64) -> String {
    format!("{}{}{}", policy, FIELD_SEPARATOR, replica_id)
}

/// Parses the `policy_tag::replica_id` registration reply.
pub fn parse_registration(line: &str) -> Result<(PolicyTag, u64)> {
    let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
    if fields.len() != 2 {
        return Err(CorkboardError::protocol(format!(
            "malformed registration reply '{}'",
            line
        )));
    }
    let policy = fields[0].parse()?;
    let replica_id = parse_number(fields[1], "replica id")?;
    Ok((policy, replica_id))
}

// =============================================================================
// Helpers
// =============================================================================

fn expect_fields(tag: &str, fields: &[&str], expected: usize) -> Result<()> {
    if fields.len() != expected {
        return Err(bad_field_count(tag, fields.len()));
    }
    Ok(())
}

fn bad_field_count(tag: &str, got: usize) -> CorkboardError {
    CorkboardError::protocol(format!("wrong field count {} for {} frame", got, tag))
}

fn parse_number<T: FromStr>(value: &str, what: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CorkboardError::protocol(format!("invalid {} '{}'", what, value)))
}

fn parse_optional_id(fields: &[&str], index: usize) -> Result<Option<u64>> {
    match fields.get(index) {
        Some(value) => Ok(Some(parse_number(value, "message id")?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_post_without_id() {
        let frame = parse_frame("POST::Weather::Alice::Sunny").expect("parse failed");
        let Frame::Data(data) = frame else {
            panic!("expected data frame");
        };
        assert_eq!(data.kind, MessageKind::Post);
        assert_eq!(data.title, "Weather");
        assert_eq!(data.author, "Alice");
        assert_eq!(data.body, "Sunny");
        assert_eq!(data.id, None);
    }

    #[test]
    fn test_parse_post_with_id() {
        let frame = parse_frame("POST::Weather::Alice::Sunny::7").expect("parse failed");
        let Frame::Data(data) = frame else {
            panic!("expected data frame");
        };
        assert_eq!(data.id, Some(7));
    }

    #[test]
    fn test_parse_reply() {
        let frame = parse_frame("REPLY::3::Re::Bob::Nope::9").expect("parse failed");
        let Frame::Data(data) = frame else {
            panic!("expected data frame");
        };
        assert_eq!(data.kind, MessageKind::Reply);
        assert_eq!(data.parent_id, Some(3));
        assert_eq!(data.id, Some(9));
    }

    #[test]
    fn test_field_count_enforced() {
        assert!(parse_frame("POST::only::three").is_err());
        assert!(parse_frame("POST::a::b::c::1::extra").is_err());
        assert!(parse_frame("REPLY::1::a::b").is_err());
        assert!(parse_frame("READ").is_err());
        assert!(parse_frame("READ::1::2").is_err());
        assert!(parse_frame("POLICY::extra").is_err());
        assert!(parse_frame("ACQUIRE_LOCK::extra").is_err());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(parse_frame("DELETE::1").is_err());
        assert!(parse_frame("").is_err());
    }

    #[test]
    fn test_non_numeric_fields_rejected() {
        assert!(parse_frame("READ::abc").is_err());
        assert!(parse_frame("CHOOSE::x").is_err());
        assert!(parse_frame("REPLY::x::a::b::c").is_err());
        assert!(parse_frame("POST::a::b::c::notanid").is_err());
    }

    #[test]
    fn test_control_frames_round_trip() {
        let frames = vec![
            Frame::Read { page: 2 },
            Frame::Choose { id: 14 },
            Frame::Register { port: 9321 },
            Frame::Policy,
            Frame::VersionQuery,
            Frame::Check { version: 12 },
            Frame::QuorumRead { replica_id: 3 },
            Frame::AcquireLock,
            Frame::GrantLock,
            Frame::Unlock,
            Frame::Transfer {
                ip: "10.0.0.2".to_string(),
                port: 8000,
            },
            Frame::SendUpdates { start_id: 6 },
        ];
        for frame in frames {
            let line = frame.encode();
            assert_eq!(parse_frame(&line).expect("parse failed"), frame);
        }
    }

    #[test]
    fn test_transfer_with_ipv6_host() {
        let frame = Frame::Transfer {
            ip: "::1".to_string(),
            port: 9000,
        };
        let line = frame.encode();
        assert_eq!(parse_frame(&line).expect("parse failed"), frame);
    }

    #[test]
    fn test_registration_round_trip() {
        let line = encode_registration(PolicyTag::Quorum, 4);
        assert_eq!(line, "quorum::4");
        let (policy, id) = parse_registration(&line).expect("parse failed");
        assert_eq!(policy, PolicyTag::Quorum);
        assert_eq!(id, 4);
        assert!(parse_registration("nonsense").is_err());
        assert!(parse_registration("banana::1").is_err());
    }

    #[test]
    fn test_data_frame_message_conversion() {
        let frame = parse_frame("POST::T::A::B::5").expect("parse failed");
        let Frame::Data(data) = frame else {
            panic!("expected data frame");
        };
        let message = data.message().expect("conversion failed");
        assert_eq!(message.id(), 5);
        assert_eq!(message.to_network_format(), "POST::T::A::B::5");

        let frame = parse_frame("POST::T::A::B").expect("parse failed");
        let Frame::Data(data) = frame else {
            panic!("expected data frame");
        };
        assert!(data.message().is_err());
    }
}
