//! Message types and MessagePack codec for the Kyutai streaming protocol.
//!
//! Every message is a MessagePack map whose first entry is the `type`
//! discriminator. Decoding is done in two steps: [`decode_header`] reads only
//! the discriminator, then [`decode`] dispatches to the body of that kind.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;

use crate::error::{DecodeError, Error};

// ============================================================================
// Discriminator
// ============================================================================

/// The kind of a wire message, as carried by its `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Server session is ready.
    Ready,
    /// TTS input text, or text echoed by the TTS server.
    Text,
    /// Batch of PCM samples.
    Audio,
    /// STT recognized word.
    Word,
    /// STT end of the current word.
    EndWord,
    /// STT processing heartbeat.
    Step,
    /// Correlation marker.
    Marker,
    /// End of the caller input.
    Eos,
    /// Server-side failure.
    Error,
}

impl MessageKind {
    /// Returns the wire discriminator.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Ready => "Ready",
            MessageKind::Text => "Text",
            MessageKind::Audio => "Audio",
            MessageKind::Word => "Word",
            MessageKind::EndWord => "EndWord",
            MessageKind::Step => "Step",
            MessageKind::Marker => "Marker",
            MessageKind::Eos => "Eos",
            MessageKind::Error => "Error",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "Ready" => MessageKind::Ready,
            "Text" => MessageKind::Text,
            "Audio" => MessageKind::Audio,
            "Word" => MessageKind::Word,
            "EndWord" => MessageKind::EndWord,
            "Step" => MessageKind::Step,
            "Marker" => MessageKind::Marker,
            "Eos" => MessageKind::Eos,
            "Error" => MessageKind::Error,
            _ => return None,
        })
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header with just a type field, used for the first decoding step.
#[derive(Debug, Deserialize)]
struct Header {
    #[serde(rename = "type")]
    msg_type: String,
}

// ============================================================================
// Bodies
// ============================================================================

/// Text sent for synthesis, or echoed back by the TTS server with timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Text {
    /// The text.
    pub text: String,
    /// Start time in seconds (server echo only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_s: Option<f64>,
    /// Stop time in seconds (server echo only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_s: Option<f64>,
}

impl Text {
    /// Creates a text message without timings.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            start_s: None,
            stop_s: None,
        }
    }
}

/// Mono float32 PCM samples at [`crate::SAMPLE_RATE`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Audio {
    /// Samples in `[-1, 1]`.
    pub pcm: Vec<f32>,
}

/// A word recognized by the STT server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    /// Recognized text.
    pub text: String,
    /// Start time in seconds.
    pub start_time: f64,
}

/// Closes the last recognized word.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndWord {
    /// Stop time in seconds.
    pub stop_time: f64,
}

/// STT server processing heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step index.
    pub step_idx: u64,
    /// Pause probabilities, one per prediction horizon.
    #[serde(default)]
    pub prs: Vec<f32>,
    /// Samples received by the server but not processed yet.
    pub buffered_pcm: u64,
}

/// Correlation marker round-tripped through the STT server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    /// Marker ID.
    pub id: i64,
}

/// Error reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error message.
    pub message: String,
}

// ============================================================================
// Message
// ============================================================================

/// A wire message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Server session is ready.
    Ready,
    /// TTS text.
    Text(Text),
    /// PCM samples.
    Audio(Audio),
    /// STT word.
    Word(Word),
    /// STT end of word.
    EndWord(EndWord),
    /// STT step.
    Step(Step),
    /// Correlation marker.
    Marker(Marker),
    /// End of the caller input. Never surfaced as an event.
    Eos,
    /// Server-side failure.
    Error(ServerError),
}

impl Message {
    /// Returns the discriminator of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Ready => MessageKind::Ready,
            Message::Text(_) => MessageKind::Text,
            Message::Audio(_) => MessageKind::Audio,
            Message::Word(_) => MessageKind::Word,
            Message::EndWord(_) => MessageKind::EndWord,
            Message::Step(_) => MessageKind::Step,
            Message::Marker(_) => MessageKind::Marker,
            Message::Eos => MessageKind::Eos,
            Message::Error(_) => MessageKind::Error,
        }
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Encodes a message as a MessagePack map.
pub fn encode(msg: &Message) -> Result<Vec<u8>, Error> {
    Ok(rmp_serde::to_vec_named(msg)?)
}

/// Returns true if the payload starts with a MessagePack map marker
/// (fixmap, map16 or map32).
fn is_map(payload: &[u8]) -> bool {
    matches!(payload.first(), Some(0x80..=0x8f | 0xde | 0xdf))
}

/// Decodes only the discriminator of a message.
pub fn decode_header(payload: &[u8]) -> Result<MessageKind, DecodeError> {
    // rmp-serde also accepts structs as positional arrays.
    if !is_map(payload) {
        return Err(DecodeError::NotAMap);
    }
    let (header, _) = decode_prefix::<Header>(payload)?;
    MessageKind::parse(&header.msg_type).ok_or(DecodeError::UnknownType(header.msg_type))
}

/// Decodes a full message.
pub fn decode(payload: &[u8]) -> Result<Message, DecodeError> {
    let kind = decode_header(payload)?;
    decode_body(kind, payload)
}

/// Decodes the body of a message whose header was already read.
pub fn decode_body(kind: MessageKind, payload: &[u8]) -> Result<Message, DecodeError> {
    Ok(match kind {
        MessageKind::Ready => {
            decode_exact::<Header>(payload)?;
            Message::Ready
        }
        MessageKind::Eos => {
            decode_exact::<Header>(payload)?;
            Message::Eos
        }
        MessageKind::Text => Message::Text(decode_exact(payload)?),
        MessageKind::Audio => Message::Audio(decode_exact(payload)?),
        MessageKind::Word => Message::Word(decode_exact(payload)?),
        MessageKind::EndWord => Message::EndWord(decode_exact(payload)?),
        MessageKind::Step => Message::Step(decode_exact(payload)?),
        MessageKind::Marker => Message::Marker(decode_exact(payload)?),
        MessageKind::Error => Message::Error(decode_exact(payload)?),
    })
}

fn decode_prefix<T: DeserializeOwned>(payload: &[u8]) -> Result<(T, usize), DecodeError> {
    let mut cursor = Cursor::new(payload);
    let value = T::deserialize(&mut rmp_serde::Deserializer::new(&mut cursor))?;
    Ok((value, cursor.position() as usize))
}

fn decode_exact<T: DeserializeOwned>(payload: &[u8]) -> Result<T, DecodeError> {
    let (value, read) = decode_prefix(payload)?;
    if read != payload.len() {
        return Err(DecodeError::TrailingBytes(payload.len() - read));
    }
    Ok(value)
}
