//! Wire packet model and schema-driven binary codec.
//!
//! Four packet shapes, each registered under a fixed schema id:
//!
//! | id | packet              | fields (fixed order)                                  |
//! |----|---------------------|-------------------------------------------------------|
//! | 1  | `HandshakeRequest`  | version, payload                                      |
//! | 2  | `HandshakeResponse` | version, id, success, payload                         |
//! | 3  | `HandshakeAck`      | version, success, payload                             |
//! | 10 | `Message`           | version, source, direction, id, name, args, metadata  |
//!
//! A frame is `[u8 schema_id][u32 BE body_len][body][u32 BE crc32(body)]`.
//! The body writes the declared fields in fixed order; the format is
//! schema-driven, not self-describing. Strings are `u32 BE` length-prefixed
//! UTF-8; open values (payload, args, metadata) are length-prefixed JSON.
//!
//! Decoding is strict: unknown schema id, truncation, trailing bytes, or a
//! checksum mismatch are terminal for that frame, and the caller must treat
//! the connection as desynchronized.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::error::{Result, SockError};

/// Protocol version spoken by this build. Carried in every packet.
pub const PROTOCOL_VERSION: u8 = 1;

/// Open key-value metadata attached to packets.
pub type Metadata = serde_json::Map<String, Value>;

const SCHEMA_HS_REQUEST: u8 = 1;
const SCHEMA_HS_RESPONSE: u8 = 2;
const SCHEMA_HS_ACK: u8 = 3;
const SCHEMA_MESSAGE: u8 = 10;

/// Frame prefix: schema id (1) + body length (4). The crc32 trailer adds 4.
const FRAME_OVERHEAD: usize = 9;

/// Origin of a [`Message`].
///
/// `Local` is synthetic: it marks an invocation that must be satisfied
/// in-process and is never serialized onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Source {
    /// Originated on the server endpoint.
    Server = 0,
    /// Originated on a client endpoint.
    Client = 1,
    /// Intentionally local-only; never crosses the wire.
    Local = 2,
}

impl Source {
    /// Wire byte for this source. `Local` has no wire representation.
    fn wire_byte(self) -> Result<u8> {
        // ---
        match self {
            Source::Server => Ok(0),
            Source::Client => Ok(1),
            Source::Local => Err(SockError::Decode {
                context: "packet.encode",
                detail: "LOCAL source is never serialized".into(),
            }),
        }
    }

    fn from_wire(byte: u8) -> Result<Self> {
        // ---
        match byte {
            0 => Ok(Source::Server),
            1 => Ok(Source::Client),
            other => Err(SockError::Decode {
                context: "packet.decode",
                detail: format!("unknown message source {other}"),
            }),
        }
    }
}

/// Whether a [`Message`] is a request or a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    /// Request leg of an RPC.
    Call = 0,
    /// Response leg, echoing the call's id and name.
    Return = 1,
}

impl Direction {
    fn from_wire(byte: u8) -> Result<Self> {
        // ---
        match byte {
            0 => Ok(Direction::Call),
            1 => Ok(Direction::Return),
            other => Err(SockError::UnknownDirection(other)),
        }
    }
}

/// Handshake step 1, client → server.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeRequest {
    /// Protocol version of the sender.
    pub version: u8,
    /// Open payload (reserved; empty in the reference exchange).
    pub payload: Metadata,
}

/// Handshake step 2 (and the final acknowledgment), server → client.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeResponse {
    /// Protocol version of the sender.
    pub version: u8,
    /// Connection identity assigned by the server.
    pub id: String,
    /// Whether the step succeeded; `false` fails the handshake closed.
    pub success: bool,
    /// Open payload.
    pub payload: Metadata,
}

/// Handshake step 3, client → server; carries the credential.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeAck {
    /// Protocol version of the sender.
    pub version: u8,
    /// Whether the client accepts the assigned identity.
    pub success: bool,
    /// Open payload; the credential travels under `"authToken"`.
    pub payload: Metadata,
}

/// A CALL or RETURN envelope for one RPC.
///
/// A RETURN must echo the CALL's `id` and `name`; `args` holds the call
/// arguments on the way out and the result values on the way back.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Protocol version of the sender.
    pub version: u8,
    /// Originating side.
    pub source: Source,
    /// CALL or RETURN.
    pub direction: Direction,
    /// Correlation id chosen by the call initiator.
    pub id: String,
    /// Named operation being invoked.
    pub name: String,
    /// Arguments (CALL) or result values (RETURN).
    pub args: Vec<Value>,
    /// Application metadata, opaque to the engine.
    pub metadata: Metadata,
}

/// One wire packet of any shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Schema id 1.
    HandshakeRequest(HandshakeRequest),
    /// Schema id 2.
    HandshakeResponse(HandshakeResponse),
    /// Schema id 3.
    HandshakeAck(HandshakeAck),
    /// Schema id 10.
    Message(Message),
}

impl Packet {
    /// Schema id this packet is registered under.
    pub fn schema_id(&self) -> u8 {
        // ---
        match self {
            Packet::HandshakeRequest(_) => SCHEMA_HS_REQUEST,
            Packet::HandshakeResponse(_) => SCHEMA_HS_RESPONSE,
            Packet::HandshakeAck(_) => SCHEMA_HS_ACK,
            Packet::Message(_) => SCHEMA_MESSAGE,
        }
    }

    /// Encode this packet into a complete wire frame.
    ///
    /// # Errors
    ///
    /// Returns an error if a `Message` carries the `Local` source (which is
    /// never serialized) or if an open value fails to serialize.
    pub fn encode(&self) -> Result<Bytes> {
        // ---
        let mut body = BytesMut::new();

        match self {
            Packet::HandshakeRequest(p) => {
                body.put_u8(p.version);
                put_json(&mut body, &Value::Object(p.payload.clone()))?;
            }
            Packet::HandshakeResponse(p) => {
                body.put_u8(p.version);
                put_str(&mut body, &p.id);
                body.put_u8(p.success as u8);
                put_json(&mut body, &Value::Object(p.payload.clone()))?;
            }
            Packet::HandshakeAck(p) => {
                body.put_u8(p.version);
                body.put_u8(p.success as u8);
                put_json(&mut body, &Value::Object(p.payload.clone()))?;
            }
            Packet::Message(p) => {
                body.put_u8(p.version);
                body.put_u8(p.source.wire_byte()?);
                body.put_u8(p.direction as u8);
                put_str(&mut body, &p.id);
                put_str(&mut body, &p.name);
                put_json(&mut body, &Value::Array(p.args.clone()))?;
                put_json(&mut body, &Value::Object(p.metadata.clone()))?;
            }
        }

        let mut frame = BytesMut::with_capacity(FRAME_OVERHEAD + body.len());
        frame.put_u8(self.schema_id());
        frame.put_u32(body.len() as u32);
        frame.put_slice(&body);
        frame.put_u32(crc32fast::hash(&body));

        Ok(frame.freeze())
    }

    /// Decode a complete wire frame.
    ///
    /// # Errors
    ///
    /// - [`SockError::Decode`] on truncation, trailing bytes, checksum
    ///   mismatch, unknown schema id, or a malformed field.
    /// - [`SockError::WrongVersion`] when the packet declares a protocol
    ///   version this build does not speak.
    /// - [`SockError::UnknownDirection`] for a direction outside
    ///   {CALL, RETURN}.
    pub fn decode(frame: &[u8]) -> Result<Packet> {
        // ---
        if frame.len() < FRAME_OVERHEAD {
            return Err(decode_err("frame shorter than minimum envelope"));
        }

        let schema_id = frame[0];
        let body_len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;

        if frame.len() != FRAME_OVERHEAD + body_len {
            return Err(decode_err(format!(
                "frame length {} does not match declared body length {body_len}",
                frame.len()
            )));
        }

        let body = &frame[5..5 + body_len];
        let declared_crc = u32::from_be_bytes([
            frame[5 + body_len],
            frame[6 + body_len],
            frame[7 + body_len],
            frame[8 + body_len],
        ]);
        let actual_crc = crc32fast::hash(body);
        if declared_crc != actual_crc {
            return Err(decode_err(format!(
                "checksum mismatch: declared {declared_crc:#010x}, actual {actual_crc:#010x}"
            )));
        }

        let mut reader = FieldReader::new(body);

        let version = reader.u8()?;
        if version != PROTOCOL_VERSION {
            return Err(SockError::WrongVersion {
                got: version,
                supported: PROTOCOL_VERSION,
            });
        }

        let packet = match schema_id {
            SCHEMA_HS_REQUEST => Packet::HandshakeRequest(HandshakeRequest {
                version,
                payload: reader.object()?,
            }),
            SCHEMA_HS_RESPONSE => Packet::HandshakeResponse(HandshakeResponse {
                version,
                id: reader.string()?,
                success: reader.u8()? != 0,
                payload: reader.object()?,
            }),
            SCHEMA_HS_ACK => Packet::HandshakeAck(HandshakeAck {
                version,
                success: reader.u8()? != 0,
                payload: reader.object()?,
            }),
            SCHEMA_MESSAGE => {
                let source = Source::from_wire(reader.u8()?)?;
                let direction = Direction::from_wire(reader.u8()?)?;
                Packet::Message(Message {
                    version,
                    source,
                    direction,
                    id: reader.string()?,
                    name: reader.string()?,
                    args: reader.array()?,
                    metadata: reader.object()?,
                })
            }
            other => {
                return Err(decode_err(format!("unknown schema id {other}")));
            }
        };

        reader.finish()?;

        Ok(packet)
    }
}

fn decode_err(detail: impl Into<String>) -> SockError {
    // ---
    SockError::Decode {
        context: "packet.decode",
        detail: detail.into(),
    }
}

fn put_str(buf: &mut BytesMut, value: &str) {
    // ---
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn put_json(buf: &mut BytesMut, value: &Value) -> Result<()> {
    // ---
    let bytes = serde_json::to_vec(value)?;
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(&bytes);
    Ok(())
}

/// Sequential field reader over a frame body.
///
/// Every read is bounds-checked; running out of bytes mid-field is a
/// `Decode` error, and [`finish`](FieldReader::finish) rejects frames with
/// bytes left over after the last declared field.
struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        // ---
        if self.buf.len() - self.pos < len {
            return Err(decode_err("body truncated mid-field"));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> Result<String> {
        // ---
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| decode_err("string field is not valid UTF-8"))
    }

    fn json(&mut self) -> Result<Value> {
        // ---
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        serde_json::from_slice(raw).map_err(|err| decode_err(format!("invalid JSON field: {err}")))
    }

    fn object(&mut self) -> Result<Metadata> {
        // ---
        match self.json()? {
            Value::Object(map) => Ok(map),
            other => Err(decode_err(format!("expected object field, got {other}"))),
        }
    }

    fn array(&mut self) -> Result<Vec<Value>> {
        // ---
        match self.json()? {
            Value::Array(items) => Ok(items),
            other => Err(decode_err(format!("expected array field, got {other}"))),
        }
    }

    fn finish(&self) -> Result<()> {
        // ---
        if self.pos != self.buf.len() {
            return Err(decode_err(format!(
                "{} trailing bytes after last field",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}
