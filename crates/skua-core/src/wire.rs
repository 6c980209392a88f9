//! Framed wire format spoken on every TLS session and helper socket.
//!
//! Each frame consists of a fixed 8-byte header followed by an opaque body:
//!
//! ```text
//! +-----------------+-----------------+-------------------------+------...
//! | version (u16 BE)| tag (u16 BE)    | length (u32 BE)         | body
//! +-----------------+-----------------+-------------------------+------...
//! ```
//!
//! Tags partition into a command space, a reply space, and an event space.
//! Command and reply bodies start with a 4-byte big-endian request id the
//! peer echoes back; event bodies carry id 0. The remainder of the body is
//! a JSON document described by [`Request`], [`Reply`], or [`Event`].
//!
//! The frame length is validated before any allocation; frames larger than
//! [`MAX_FRAME_SIZE`] are rejected in both directions.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::id::VmId;

/// Protocol version `AV0`.
pub const WIRE_VERSION: u16 = 0;

/// Length of the fixed frame header.
pub const HEADER_LEN: usize = 8;

/// Length of the request-id word leading command and reply bodies.
pub const ID_LEN: usize = 4;

/// Maximum body size accepted on any transport (16 MiB).
///
/// The header field could express up to `u32::MAX`, but nothing legitimate
/// approaches that; the cap bounds allocation on untrusted input.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame tags.
///
/// `0x0xxx` are commands, `0x8xxx` replies, `0x4xxx` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Tag {
    /// List live VMs under the caller's prefix.
    Info = 0x0001,
    /// Create a VM from the presented certificate.
    Create = 0x0002,
    /// Create, pre-empting an existing VM with the same id.
    ForceCreate = 0x0003,
    /// Destroy a live VM.
    Destroy = 0x0004,
    /// One-shot statistics request; also subscribes to periodic samples.
    Statistics = 0x0005,
    /// Subscribe to a VM's console stream.
    Console = 0x0006,
    /// Subscribe to a VM's log stream, optionally replaying history.
    Log = 0x0007,
    /// Download the stored revocation list for an issuer.
    CrlFetch = 0x0008,
    /// Register a pid with the statistics helper.
    StatAdd = 0x0010,
    /// Remove a pid from the statistics helper.
    StatRemove = 0x0011,
    /// Ask the console helper to start relaying a VM's console.
    ConsoleAttach = 0x0012,
    /// Ask the console helper to stop relaying a VM's console.
    ConsoleDetach = 0x0013,

    /// Successful reply.
    Success = 0x8000,
    /// Failure reply carrying a human-readable message.
    Failure = 0x8001,

    /// A console line pushed by the console helper.
    ConsoleLine = 0x4001,
    /// A log line pushed by the log helper (or synthesized on VM exit).
    LogLine = 0x4002,
    /// A periodic statistics sample pushed by the stats helper.
    StatsSample = 0x4003,
}

impl Tag {
    /// Decodes a tag from its wire value.
    #[must_use]
    pub fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            0x0001 => Self::Info,
            0x0002 => Self::Create,
            0x0003 => Self::ForceCreate,
            0x0004 => Self::Destroy,
            0x0005 => Self::Statistics,
            0x0006 => Self::Console,
            0x0007 => Self::Log,
            0x0008 => Self::CrlFetch,
            0x0010 => Self::StatAdd,
            0x0011 => Self::StatRemove,
            0x0012 => Self::ConsoleAttach,
            0x0013 => Self::ConsoleDetach,
            0x8000 => Self::Success,
            0x8001 => Self::Failure,
            0x4001 => Self::ConsoleLine,
            0x4002 => Self::LogLine,
            0x4003 => Self::StatsSample,
            _ => return None,
        })
    }

    /// Returns `true` for tags in the event space.
    #[must_use]
    pub const fn is_event(self) -> bool {
        (self as u16) & 0x4000 != 0 && (self as u16) & 0x8000 == 0
    }

    /// Returns `true` for tags in the reply space.
    #[must_use]
    pub const fn is_reply(self) -> bool {
        (self as u16) & 0x8000 != 0
    }
}

/// Frame header: version, tag, body length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Negotiated protocol version.
    pub version: u16,
    /// Raw tag value; may be outside the known [`Tag`] set.
    pub tag: u16,
    /// Body length in bytes.
    pub length: u32,
}

impl Header {
    /// Parses a header from exactly [`HEADER_LEN`] bytes.
    #[must_use]
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            version: u16::from_be_bytes([buf[0], buf[1]]),
            tag: u16::from_be_bytes([buf[2], buf[3]]),
            length: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }

    /// Serializes the header.
    #[must_use]
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&self.version.to_be_bytes());
        out[2..4].copy_from_slice(&self.tag.to_be_bytes());
        out[4..8].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    /// The decoded tag, if known.
    #[must_use]
    pub fn known_tag(&self) -> Option<Tag> {
        Tag::from_u16(self.tag)
    }
}

/// Wire codec errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WireError {
    /// A frame body exceeded [`MAX_FRAME_SIZE`].
    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Claimed or actual body size.
        size: usize,
        /// The enforced limit.
        max: usize,
    },

    /// A body was shorter than the request-id word.
    #[error("frame body truncated: {0} bytes")]
    Truncated(usize),

    /// The JSON document in a body failed to decode.
    #[error("malformed frame body: {0}")]
    Body(#[from] serde_json::Error),

    /// Underlying I/O error surfaced through the codec.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A decoded frame: header plus raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The frame header.
    pub header: Header,
    /// The opaque body, including any leading request id.
    pub body: Bytes,
}

impl Frame {
    /// Splits the body into request id and payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] if the body is shorter than the id
    /// word.
    pub fn request_id(&self) -> Result<(u32, &[u8]), WireError> {
        if self.body.len() < ID_LEN {
            return Err(WireError::Truncated(self.body.len()));
        }
        let id = u32::from_be_bytes([self.body[0], self.body[1], self.body[2], self.body[3]]);
        Ok((id, &self.body[ID_LEN..]))
    }

    /// Decodes the JSON payload following the request id.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on a truncated body or malformed JSON.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<(u32, T), WireError> {
        let (id, rest) = self.request_id()?;
        let value = if rest.is_empty() {
            serde_json::from_slice(b"null")?
        } else {
            serde_json::from_slice(rest)?
        };
        Ok((id, value))
    }
}

/// Encodes a complete frame.
///
/// # Errors
///
/// Returns [`WireError::FrameTooLarge`] if the encoded body would exceed
/// [`MAX_FRAME_SIZE`], and [`WireError::Body`] on serialization failure.
pub fn encode<T: Serialize>(
    version: u16,
    tag: Tag,
    request_id: u32,
    payload: &T,
) -> Result<Bytes, WireError> {
    let json = serde_json::to_vec(payload)?;
    let body_len = ID_LEN + json.len();
    if body_len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: body_len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_SIZE
    let header = Header {
        version,
        tag: tag as u16,
        length: body_len as u32,
    };
    buf.put_slice(&header.to_bytes());
    buf.put_u32(request_id);
    buf.put_slice(&json);
    Ok(buf.freeze())
}

/// Builds a failure reply frame.
///
/// Infallible: the message is truncated rather than allowed to overflow the
/// frame limit.
#[must_use]
pub fn fail(message: &str, request_id: u32, version: u16) -> Bytes {
    let mut cut = message.len().min(4096);
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    let message = message[..cut].to_string();
    encode(version, Tag::Failure, request_id, &FailureReply { message })
        .expect("bounded failure reply always encodes")
}

/// Builds an empty success reply frame.
#[must_use]
pub fn ok(request_id: u32, version: u16) -> Bytes {
    encode(version, Tag::Success, request_id, &SuccessReply::Empty)
        .expect("empty success reply always encodes")
}

// ---------------------------------------------------------------------------
// Typed bodies
// ---------------------------------------------------------------------------

/// Command bodies, by tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// `Tag::Info`
    Info {
        /// Glob evaluated under the caller's prefix.
        #[serde(default)]
        glob: String,
    },
    /// `Tag::Destroy`
    Destroy {
        /// Full id of the VM to destroy.
        id: VmId,
    },
    /// `Tag::Console`
    Console {
        /// Full id of the VM whose console to stream.
        id: VmId,
    },
    /// `Tag::Log`
    Log {
        /// Full id of the VM whose log to stream.
        id: VmId,
        /// Replay ring entries strictly after this instant before streaming.
        #[serde(default)]
        since: Option<DateTime<Utc>>,
    },
    /// `Tag::Statistics`
    Statistics {
        /// Full id of the VM to sample.
        id: VmId,
    },
    /// `Tag::CrlFetch`
    CrlFetch {
        /// Common name of the issuer whose list is requested.
        issuer: String,
    },
    /// `Tag::StatAdd` (engine to stats helper)
    StatAdd {
        /// Full id of the VM.
        id: VmId,
        /// Pid of the monitor process.
        pid: u32,
    },
    /// `Tag::StatRemove` (engine to stats helper)
    StatRemove {
        /// Pid previously registered.
        pid: u32,
    },
    /// `Tag::ConsoleAttach` / `Tag::ConsoleDetach` (engine to console helper)
    ConsoleCtl {
        /// Full id of the VM.
        id: VmId,
    },
}

/// A statistics sample for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSample {
    /// Full id of the VM.
    pub id: VmId,
    /// Pid of the monitor process.
    pub pid: u32,
    /// Sample time.
    pub timestamp: DateTime<Utc>,
    /// Cumulative CPU time in nanoseconds.
    pub cpu_ns: u64,
    /// Resident set size in bytes.
    pub rss_bytes: u64,
}

/// The subset of a VM's configuration reported by `info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSummary {
    /// Full id.
    pub id: VmId,
    /// Delegated CPU the VM is pinned to.
    pub cpuid: u16,
    /// Requested memory in MB.
    pub memory: u32,
    /// Bridge names the VM is attached to.
    pub networks: Vec<String>,
    /// Block device name, if any.
    pub block_device: Option<String>,
    /// Monitor pid; `None` while the spawn is in flight.
    pub pid: Option<u32>,
    /// Wall-clock start, `None` while the spawn is in flight.
    pub started: Option<DateTime<Utc>>,
}

/// Success reply bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessReply {
    /// Acknowledgement with no payload.
    Empty,
    /// Reply to `info`.
    Info(Vec<VmSummary>),
    /// Reply to `create`: the id the VM now runs under.
    Created(VmId),
    /// Reply to `crl` download: DER bytes of the stored list.
    Crl(Vec<u8>),
    /// Reply to a one-shot `statistics` request.
    Stats(StatsSample),
}

/// Failure reply body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReply {
    /// Human-readable reason.
    pub message: String,
}

/// Event bodies, by tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// `Tag::ConsoleLine`
    Console {
        /// Full id of the VM the line belongs to.
        id: VmId,
        /// When the helper captured the line.
        timestamp: DateTime<Utc>,
        /// The line, without trailing newline.
        line: String,
    },
    /// `Tag::LogLine`
    Log {
        /// Full id of the VM the line belongs to.
        id: VmId,
        /// When the line was produced.
        timestamp: DateTime<Utc>,
        /// The line, without trailing newline.
        line: String,
    },
    /// `Tag::StatsSample`
    Stats(StatsSample),
}

// ---------------------------------------------------------------------------
// tokio-util codec
// ---------------------------------------------------------------------------

/// Frame codec for use with [`tokio_util::codec::Framed`].
///
/// The body length is validated before any allocation occurs.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut head = [0u8; HEADER_LEN];
        head.copy_from_slice(&src[..HEADER_LEN]);
        let header = Header::parse(&head);
        let length = header.length as usize;
        if length > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }
        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let body = src.split_to(length).freeze();
        Ok(Some(Frame { header, body }))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), WireError> {
        // items produced by `encode()` already carry their header
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = Header {
            version: WIRE_VERSION,
            tag: Tag::Info as u16,
            length: 42,
        };
        assert_eq!(Header::parse(&header.to_bytes()), header);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let frame_bytes = encode(
            WIRE_VERSION,
            Tag::Destroy,
            7,
            &Request::Destroy {
                id: "t/v".parse().unwrap(),
            },
        )
        .unwrap();

        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&frame_bytes[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.known_tag(), Some(Tag::Destroy));
        let (id, req): (u32, Request) = frame.decode_payload().unwrap();
        assert_eq!(id, 7);
        assert_eq!(
            req,
            Request::Destroy {
                id: "t/v".parse().unwrap()
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn two_concatenated_frames_decode_separately() {
        let a = fail("first", 1, WIRE_VERSION);
        let b = ok(2, WIRE_VERSION);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);

        let mut codec = FrameCodec;
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.header.known_tag(), Some(Tag::Failure));
        assert_eq!(second.header.known_tag(), Some(Tag::Success));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let frame = ok(1, WIRE_VERSION);
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&frame[..HEADER_LEN + 2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), HEADER_LEN + 2);
    }

    #[test]
    fn oversized_length_is_rejected_before_allocation() {
        let header = Header {
            version: WIRE_VERSION,
            tag: Tag::Info as u16,
            length: u32::MAX,
        };
        let mut buf = BytesMut::from(&header.to_bytes()[..]);
        let mut codec = FrameCodec;
        assert!(matches!(
            codec.decode(&mut buf),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn fail_constructs_failure_reply() {
        let frame_bytes = fail("no such vm", 3, WIRE_VERSION);
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&frame_bytes[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        let (id, reply): (u32, FailureReply) = frame.decode_payload().unwrap();
        assert_eq!(id, 3);
        assert_eq!(reply.message, "no such vm");
    }

    #[test]
    fn event_frames_carry_id_zero() {
        let event = Event::Log {
            id: "t/v".parse().unwrap(),
            timestamp: Utc::now(),
            line: "booted".into(),
        };
        let frame_bytes = encode(WIRE_VERSION, Tag::LogLine, 0, &event).unwrap();
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&frame_bytes[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        let (id, decoded): (u32, Event) = frame.decode_payload().unwrap();
        assert_eq!(id, 0);
        assert_eq!(decoded, event);
    }
}
