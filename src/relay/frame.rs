//! # Realtime Frame Codec
//!
//! Binary framing spoken by the vendor speech service. The relay uses the same
//! framing towards the browser, so every WebSocket binary message on either
//! side carries exactly one frame.
//!
//! ## Layout:
//! ```text
//! byte 0   protocol version (high nibble) | header size in 4-byte units (low nibble)
//! byte 1   message type (high nibble)     | flags (low nibble)
//! byte 2   serialization (high nibble)    | compression (low nibble)
//! byte 3   reserved
//! [i32 BE sequence]                       flags & 0b0010
//! [u32 BE event code]                     flags & 0b0100
//! [u32 BE length + session id bytes]      flags & 0b0001
//! u32 BE payload length
//! payload
//! ```
//!
//! Optional fields always appear in that order. Decoding never tries to
//! resynchronise: a frame that does not parse is a fatal stream error.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::io::Cursor;
use thiserror::Error;

/// Protocol version carried in the high nibble of byte 0.
pub const PROTOCOL_VERSION: u8 = 0x1;

/// Header size indicator written on encode (one 4-byte unit).
pub const HEADER_SIZE_UNITS: u8 = 0x1;

const BASIC_HEADER_LEN: usize = 4;

pub const FLAG_SESSION_ID: u8 = 0b0001;
pub const FLAG_SEQUENCE: u8 = 0b0010;
pub const FLAG_EVENT: u8 = 0b0100;
const FLAG_RESERVED: u8 = 0b1000;

/// Errors raised while encoding or decoding a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame truncated while reading {field}")]
    Truncated { field: &'static str },

    #[error("unsupported protocol version {0:#x}")]
    UnsupportedVersion(u8),

    #[error("invalid header size indicator {0:#x}")]
    InvalidHeaderSize(u8),

    #[error("unknown message type {0:#x}")]
    UnknownMessageType(u8),

    #[error("reserved flag bits set ({0:#06b})")]
    ReservedFlags(u8),

    #[error("unknown serialization method {0:#x}")]
    UnknownSerialization(u8),

    #[error("unsupported compression method {0:#x}")]
    UnsupportedCompression(u8),

    #[error("session id is not valid UTF-8")]
    InvalidSessionId,

    #[error("field of {0} bytes does not fit a 32-bit length prefix")]
    PayloadTooLarge(usize),

    #[error("{0} trailing bytes after frame payload")]
    TrailingBytes(usize),

    #[error("expected a binary message, got {0}")]
    NotBinary(&'static str),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("i/o error while encoding frame: {0}")]
    Io(#[from] std::io::Error),
}

/// Message type nibble (byte 1, high nibble).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Client request with a serialized (JSON) payload
    FullClient,
    /// Client request carrying raw audio bytes
    AudioOnly,
    /// Server response with a serialized (JSON) payload
    FullServer,
    /// Server response carrying raw audio bytes
    AudioOnlyServer,
    /// Error report
    Error,
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            MessageType::FullClient => 0x1,
            MessageType::AudioOnly => 0x2,
            MessageType::FullServer => 0x9,
            MessageType::AudioOnlyServer => 0xB,
            MessageType::Error => 0xF,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, FrameError> {
        match code {
            0x1 => Ok(MessageType::FullClient),
            0x2 => Ok(MessageType::AudioOnly),
            0x9 => Ok(MessageType::FullServer),
            0xB => Ok(MessageType::AudioOnlyServer),
            0xF => Ok(MessageType::Error),
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }

    /// Types a browser client is allowed to send.
    pub fn is_client(self) -> bool {
        matches!(self, MessageType::FullClient | MessageType::AudioOnly)
    }

    /// Types the vendor is allowed to send.
    pub fn is_server(self) -> bool {
        matches!(
            self,
            MessageType::FullServer | MessageType::AudioOnlyServer | MessageType::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::FullClient => "full-client",
            MessageType::AudioOnly => "audio-only",
            MessageType::FullServer => "full-server",
            MessageType::AudioOnlyServer => "audio-only-server",
            MessageType::Error => "error",
        }
    }
}

/// Payload serialization nibble (byte 2, high nibble).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serialization {
    None,
    Json,
}

impl Serialization {
    pub fn code(self) -> u8 {
        match self {
            Serialization::None => 0x0,
            Serialization::Json => 0x1,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, FrameError> {
        match code {
            0x0 => Ok(Serialization::None),
            0x1 => Ok(Serialization::Json),
            other => Err(FrameError::UnknownSerialization(other)),
        }
    }
}

/// Payload compression nibble (byte 2, low nibble).
///
/// Only uncompressed payloads are relayed. Gzip (`0x1`) is part of the vendor
/// protocol but is rejected like any other unknown method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
}

impl Compression {
    pub fn code(self) -> u8 {
        0x0
    }

    pub fn from_code(code: u8) -> Result<Self, FrameError> {
        match code {
            0x0 => Ok(Compression::None),
            other => Err(FrameError::UnsupportedCompression(other)),
        }
    }
}

/// Event codes carried in the optional event field.
///
/// Equality and hashing go by wire code, so `Other(100)` and `StartSession`
/// are the same event.
#[derive(Debug, Clone, Copy)]
pub enum Event {
    StartSession,
    SessionStarted,
    AudioUpload,
    AudioStream,
    TextOutput,
    EndSession,
    /// Any code the relay has no special handling for; carried opaquely.
    Other(u32),
}

impl Event {
    pub fn code(self) -> u32 {
        match self {
            Event::StartSession => 100,
            Event::SessionStarted => 101,
            Event::AudioUpload => 200,
            Event::AudioStream => 201,
            Event::TextOutput => 300,
            Event::EndSession => 900,
            Event::Other(code) => code,
        }
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.code() == other.code()
    }
}

impl Eq for Event {}

impl std::hash::Hash for Event {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.code().hash(state);
    }
}

impl From<u32> for Event {
    fn from(code: u32) -> Self {
        match code {
            100 => Event::StartSession,
            101 => Event::SessionStarted,
            200 => Event::AudioUpload,
            201 => Event::AudioStream,
            300 => Event::TextOutput,
            900 => Event::EndSession,
            other => Event::Other(other),
        }
    }
}

/// One decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub serialization: Serialization,
    pub compression: Compression,
    pub sequence: Option<i32>,
    pub event: Option<Event>,
    pub session_id: Option<String>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame with no optional fields.
    pub fn new(message_type: MessageType, serialization: Serialization, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            serialization,
            compression: Compression::None,
            sequence: None,
            event: None,
            session_id: None,
            payload,
        }
    }

    #[cfg(test)]
    pub fn with_sequence(mut self, sequence: i32) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Set the event, normalised to its named variant when it has one.
    pub fn with_event(mut self, event: Event) -> Self {
        self.event = Some(Event::from(event.code()));
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Full-client request with a JSON body.
    pub fn full_client_json<T: Serialize>(
        event: Event,
        session_id: Option<&str>,
        body: &T,
    ) -> Result<Self, FrameError> {
        let payload = serde_json::to_vec(body)?;
        let frame = Frame::new(MessageType::FullClient, Serialization::Json, payload).with_event(event);
        Ok(match session_id {
            Some(id) => frame.with_session_id(id),
            None => frame,
        })
    }

    /// Audio-only client request; the payload is raw PCM/opus bytes.
    #[cfg(test)]
    pub fn audio_only(event: Event, session_id: Option<&str>, audio: Vec<u8>) -> Self {
        let frame = Frame::new(MessageType::AudioOnly, Serialization::None, audio).with_event(event);
        match session_id {
            Some(id) => frame.with_session_id(id),
            None => frame,
        }
    }

    /// Error frame with a JSON body.
    #[cfg(test)]
    pub fn error_json<T: Serialize>(body: &T) -> Result<Self, FrameError> {
        let payload = serde_json::to_vec(body)?;
        Ok(Frame::new(MessageType::Error, Serialization::Json, payload))
    }

    /// Flag nibble implied by which optional fields are present.
    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.session_id.is_some() {
            flags |= FLAG_SESSION_ID;
        }
        if self.sequence.is_some() {
            flags |= FLAG_SEQUENCE;
        }
        if self.event.is_some() {
            flags |= FLAG_EVENT;
        }
        flags
    }

    /// `true` when the frame carries the given event.
    pub fn is_event(&self, event: Event) -> bool {
        self.event == Some(event)
    }

    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Serialize the frame to its wire representation.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let payload_len = length_prefix(self.payload.len())?;

        let mut out = Vec::with_capacity(BASIC_HEADER_LEN + 16 + self.payload.len());
        out.push((PROTOCOL_VERSION << 4) | HEADER_SIZE_UNITS);
        out.push((self.message_type.code() << 4) | self.flags());
        out.push((self.serialization.code() << 4) | self.compression.code());
        out.push(0x00);

        if let Some(sequence) = self.sequence {
            out.write_i32::<BigEndian>(sequence)?;
        }
        if let Some(event) = self.event {
            out.write_u32::<BigEndian>(event.code())?;
        }
        if let Some(session_id) = &self.session_id {
            out.write_u32::<BigEndian>(length_prefix(session_id.len())?)?;
            out.extend_from_slice(session_id.as_bytes());
        }

        out.write_u32::<BigEndian>(payload_len)?;
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode exactly one frame; the buffer must not contain anything else.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let (frame, consumed) = Self::decode_prefix(buf)?;
        if consumed != buf.len() {
            return Err(FrameError::TrailingBytes(buf.len() - consumed));
        }
        Ok(frame)
    }

    /// Decode one frame from the front of `buf`, returning it together with
    /// the number of bytes it occupied.
    pub fn decode_prefix(buf: &[u8]) -> Result<(Self, usize), FrameError> {
        if buf.len() < BASIC_HEADER_LEN {
            return Err(FrameError::Truncated { field: "header" });
        }

        let version = buf[0] >> 4;
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let header_units = buf[0] & 0x0F;
        if header_units == 0 {
            return Err(FrameError::InvalidHeaderSize(header_units));
        }
        let header_len = header_units as usize * 4;
        if buf.len() < header_len {
            return Err(FrameError::Truncated { field: "header extension" });
        }

        let message_type = MessageType::from_code(buf[1] >> 4)?;
        let flags = buf[1] & 0x0F;
        if flags & FLAG_RESERVED != 0 {
            return Err(FrameError::ReservedFlags(flags));
        }
        let serialization = Serialization::from_code(buf[2] >> 4)?;
        let compression = Compression::from_code(buf[2] & 0x0F)?;

        let mut cursor = Cursor::new(buf);
        cursor.set_position(header_len as u64);

        let sequence = if flags & FLAG_SEQUENCE != 0 {
            Some(
                cursor
                    .read_i32::<BigEndian>()
                    .map_err(|_| FrameError::Truncated { field: "sequence" })?,
            )
        } else {
            None
        };

        let event = if flags & FLAG_EVENT != 0 {
            Some(Event::from(read_u32(&mut cursor, "event")?))
        } else {
            None
        };

        let session_id = if flags & FLAG_SESSION_ID != 0 {
            let len = read_u32(&mut cursor, "session id length")? as usize;
            let bytes = take(&mut cursor, len, "session id")?;
            let id = std::str::from_utf8(bytes).map_err(|_| FrameError::InvalidSessionId)?;
            Some(id.to_string())
        } else {
            None
        };

        let payload_len = read_u32(&mut cursor, "payload length")? as usize;
        let payload = take(&mut cursor, payload_len, "payload")?.to_vec();

        let frame = Frame {
            message_type,
            serialization,
            compression,
            sequence,
            event,
            session_id,
            payload,
        };
        Ok((frame, cursor.position() as usize))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message_type.as_str())?;
        if let Some(event) = self.event {
            write!(f, " event={}", event.code())?;
        }
        if let Some(sequence) = self.sequence {
            write!(f, " seq={}", sequence)?;
        }
        write!(f, " payload={}B", self.payload.len())
    }
}

fn length_prefix(len: usize) -> Result<u32, FrameError> {
    u32::try_from(len).map_err(|_| FrameError::PayloadTooLarge(len))
}

fn read_u32(cursor: &mut Cursor<&[u8]>, field: &'static str) -> Result<u32, FrameError> {
    cursor
        .read_u32::<BigEndian>()
        .map_err(|_| FrameError::Truncated { field })
}

/// Borrow `len` bytes from the cursor, failing instead of returning a short read.
fn take<'a>(cursor: &mut Cursor<&'a [u8]>, len: usize, field: &'static str) -> Result<&'a [u8], FrameError> {
    let buf: &'a [u8] = *cursor.get_ref();
    let start = cursor.position() as usize;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or(FrameError::Truncated { field })?;
    cursor.set_position(end as u64);
    Ok(&buf[start..end])
}
