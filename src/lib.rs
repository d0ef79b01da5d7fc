//! Rust client library for Kyutai streaming Text-to-Speech (TTS) and
//! Speech-to-Text (STT) WebSocket servers.
//!
//! Each connection runs a writer and a reader task over a single WebSocket
//! carrying MessagePack messages. Callers submit input units and read typed
//! events until the stream ends, then collect the terminal result with
//! `done()`.
//!
//! # Example
//!
//! ```no_run
//! use kyutai_streaming::{TtsClient, TtsConfig, TtsEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), kyutai_streaming::Error> {
//!     let config = TtsConfig::new(
//!         kyutai_streaming::DEFAULT_SERVER_URL,
//!         std::env::var("KYUTAI_API_KEY").unwrap_or_default(),
//!     )
//!     .with_voice(kyutai_streaming::DEFAULT_VOICE);
//!
//!     let client = TtsClient::new(config)?;
//!     let mut conn = client.connect().await?;
//!
//!     for word in "Hello, world!".split_whitespace() {
//!         conn.submit(word.to_string()).await?;
//!     }
//!     conn.finish();
//!
//!     let mut samples = Vec::new();
//!     while let Some(event) = conn.next_event().await {
//!         if let TtsEvent::Audio { pcm } = event {
//!             samples.extend(pcm);
//!         }
//!     }
//!     println!("Received {} samples", samples.len());
//!
//!     conn.done().await
//! }
//! ```

mod connection;
mod error;
mod framing;
pub mod messages;
mod stt;
mod tts;
mod ws;

use std::time::Duration;
use url::Url;

pub use connection::Connection;
pub use error::{DecodeError, Error};
pub use messages::{Message, MessageKind};
pub use stt::{SttClient, SttConfig, SttConnection, SttEvent};
pub use tts::{TtsClient, TtsConfig, TtsConnection, TtsEvent};
pub use tokio_util::sync::CancellationToken;

/// Sample rate of all audio exchanged with the servers.
pub const SAMPLE_RATE: usize = 24000;

/// Audio is mono.
pub const NUM_CHANNELS: usize = 1;

/// Number of samples per STT audio frame (80 ms).
pub const FRAME_SIZE: usize = 1920;

/// Marker ID reserved for the end-of-input drain handshake.
pub const DRAIN_MARKER_ID: i64 = 0;

/// Path of the TTS streaming endpoint.
pub const TTS_PATH: &str = "/api/tts_streaming";

/// Path of the STT streaming endpoint.
pub const STT_PATH: &str = "/api/asr-streaming";

/// Wire format requested from the servers.
pub const WIRE_FORMAT: &str = "PcmMessagePack";

/// HTTP header carrying the API key at connection time.
pub const API_KEY_HEADER: &str = "kyutai-api-key";

/// Default server URL.
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080";

/// Default voice for TTS.
pub const DEFAULT_VOICE: &str = "expresso/ex01-ex02_default_001_channel2_198s.wav";

const DEFAULT_CHANNEL_CAPACITY: usize = 16;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Appends `path` to the base URL path and sets the query parameters.
fn endpoint_url(base: &str, path: &str, voice: Option<&str>) -> Result<Url, Error> {
    let mut url = Url::parse(base)?;
    let joined = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| *k != "format" && *k != "voice")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut query = url.query_pairs_mut();
        query.clear().extend_pairs(kept);
        if let Some(voice) = voice.filter(|v| !v.is_empty()) {
            query.append_pair("voice", voice);
        }
        query.append_pair("format", WIRE_FORMAT);
    }
    Ok(url)
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}
