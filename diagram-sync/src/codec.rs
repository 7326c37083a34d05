//! Binary wire codec for the room sync channel.
//!
//! Every message is a varuint discriminator followed by its payload.
//! Document messages carry a second varuint selecting the sync step:
//!
//! ```text
//! ┌────────────────┬────────────────┬───────────────────────────┐
//! │ kind (varuint) │ step (varuint) │ payload (varuint len + N) │
//! └────────────────┴────────────────┴───────────────────────────┘
//!   0 = sync         0 = step 1       state vector
//!                    1 = step 2       state diff
//!                    2 = update       incremental delta
//!   1 = awareness    -                presence update
//!   3 = query        -                (empty)
//! ```
//!
//! The layout matches the y-protocols framing spoken by browser clients.
//! Several messages may share one frame; [`MessageReader`] walks them in
//! order. Any decode failure is connection-fatal; callers drop the socket.

use thiserror::Error;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

const MSG_SYNC: u64 = 0;
const MSG_AWARENESS: u64 = 1;
const MSG_QUERY_AWARENESS: u64 = 3;

const SYNC_STEP1: u64 = 0;
const SYNC_STEP2: u64 = 1;
const SYNC_UPDATE: u64 = 2;

/// Decoder failures. All of them close the offending connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl From<yrs::encoding::read::Error> for CodecError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        CodecError::Malformed(e.to_string())
    }
}

/// Discriminates the five message kinds carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Sender's state vector; the receiver answers with the missing diff.
    SyncStep1,
    /// Reply to a step 1: everything the requester lacks.
    SyncStep2,
    /// Incremental delta produced by a local edit.
    Update,
    /// Presence delta (changed clients only).
    Awareness,
    /// Request for the full presence snapshot.
    QueryAwareness,
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    SyncStep1(Vec<u8>),
    SyncStep2(Vec<u8>),
    Update(Vec<u8>),
    Awareness(Vec<u8>),
    QueryAwareness,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::SyncStep1(_) => MessageKind::SyncStep1,
            Message::SyncStep2(_) => MessageKind::SyncStep2,
            Message::Update(_) => MessageKind::Update,
            Message::Awareness(_) => MessageKind::Awareness,
            Message::QueryAwareness => MessageKind::QueryAwareness,
        }
    }

    /// Payload bytes, empty for [`Message::QueryAwareness`].
    pub fn payload(&self) -> &[u8] {
        match self {
            Message::SyncStep1(p)
            | Message::SyncStep2(p)
            | Message::Update(p)
            | Message::Awareness(p) => p,
            Message::QueryAwareness => &[],
        }
    }

    /// Serialize to a standalone frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload().len() + 6);
        self.encode_into(&mut buf);
        buf
    }

    /// Append this message to `buf`. Repeated calls build a multi-message frame.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Message::SyncStep1(sv) => {
                buf.write_var(MSG_SYNC);
                buf.write_var(SYNC_STEP1);
                buf.write_buf(sv);
            }
            Message::SyncStep2(diff) => {
                buf.write_var(MSG_SYNC);
                buf.write_var(SYNC_STEP2);
                buf.write_buf(diff);
            }
            Message::Update(delta) => {
                buf.write_var(MSG_SYNC);
                buf.write_var(SYNC_UPDATE);
                buf.write_buf(delta);
            }
            Message::Awareness(update) => {
                buf.write_var(MSG_AWARENESS);
                buf.write_buf(update);
            }
            Message::QueryAwareness => {
                buf.write_var(MSG_QUERY_AWARENESS);
            }
        }
    }

    /// Decode the first message of `bytes`, returning it with the unread tail.
    pub fn decode(bytes: &[u8]) -> Result<(Message, &[u8]), CodecError> {
        let mut cursor = Cursor::new(bytes);
        let msg = Self::read(&mut cursor)?;
        let consumed = cursor.next.min(bytes.len());
        Ok((msg, &bytes[consumed..]))
    }

    fn read(cursor: &mut Cursor<'_>) -> Result<Message, CodecError> {
        let kind: u64 = cursor.read_var()?;
        match kind {
            MSG_SYNC => {
                let step: u64 = cursor.read_var()?;
                match step {
                    SYNC_STEP1 => Ok(Message::SyncStep1(read_payload(cursor)?)),
                    SYNC_STEP2 => Ok(Message::SyncStep2(read_payload(cursor)?)),
                    SYNC_UPDATE => Ok(Message::Update(read_payload(cursor)?)),
                    other => Err(CodecError::Malformed(format!("unknown sync step {other}"))),
                }
            }
            MSG_AWARENESS => Ok(Message::Awareness(read_payload(cursor)?)),
            MSG_QUERY_AWARENESS => Ok(Message::QueryAwareness),
            other => Err(CodecError::Malformed(format!("unknown message kind {other}"))),
        }
    }
}

/// Read a varuint length prefix and exactly that many bytes.
///
/// The length is checked against the remaining buffer before slicing so a
/// lying prefix fails cleanly instead of reading past the frame.
fn read_payload(cursor: &mut Cursor<'_>) -> Result<Vec<u8>, CodecError> {
    let len: u64 = cursor.read_var()?;
    let remaining = cursor.buf.len().saturating_sub(cursor.next) as u64;
    if len > remaining {
        return Err(CodecError::Malformed(format!(
            "declared payload of {len} bytes exceeds remaining {remaining}"
        )));
    }
    let bytes = cursor.read_exact(len as usize)?;
    Ok(bytes.to_vec())
}

/// Iterates every message packed into one frame.
///
/// Stops after the first error; the caller is expected to drop the socket.
pub struct MessageReader<'a> {
    rest: &'a [u8],
    failed: bool,
}

impl<'a> MessageReader<'a> {
    pub fn new(frame: &'a [u8]) -> Self {
        Self { rest: frame, failed: false }
    }
}

impl<'a> Iterator for MessageReader<'a> {
    type Item = Result<Message, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.is_empty() {
            return None;
        }
        match Message::decode(self.rest) {
            Ok((msg, rest)) => {
                self.rest = rest;
                Some(Ok(msg))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
