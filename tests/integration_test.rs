//! Integration tests against a live Kyutai server.
//!
//! To run these tests, set the KYUTAI_SERVER_URL environment variable, and
//! KYUTAI_API_KEY if the server requires one.

use kyutai_streaming::{
    SttClient, SttConfig, SttEvent, TtsClient, TtsConfig, TtsEvent, DEFAULT_VOICE, SAMPLE_RATE,
};
use std::collections::HashSet;
use std::time::Duration;
use tracing::info;

fn get_server() -> Option<(String, String)> {
    let url = std::env::var("KYUTAI_SERVER_URL").ok()?;
    let api_key = std::env::var("KYUTAI_API_KEY").unwrap_or_default();
    Some((url, api_key))
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();
}

async fn synthesize(url: &str, api_key: &str, text: &str) -> Vec<f32> {
    let config = TtsConfig::new(url, api_key).with_voice(DEFAULT_VOICE);
    let client = TtsClient::new(config).unwrap();
    let mut conn = client.connect().await.expect("Failed to connect TTS");

    for word in text.split_whitespace() {
        conn.submit(word.to_string()).await.expect("Failed to enqueue text");
    }
    conn.finish();

    let mut samples = Vec::new();
    while let Some(event) = conn.next_event().await {
        if let TtsEvent::Audio { pcm } = event {
            samples.extend(pcm);
        }
    }
    conn.done().await.expect("TTS connection failed");
    samples
}

fn normalize(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

#[tokio::test]
async fn test_tts_synthesis() {
    let Some((url, api_key)) = get_server() else {
        eprintln!("Skipping test: KYUTAI_SERVER_URL not set");
        return;
    };
    init_tracing();

    let samples = synthesize(&url, &api_key, "Hello, world!").await;
    eprintln!(
        "Received {} samples ({:.2}s)",
        samples.len(),
        samples.len() as f64 / SAMPLE_RATE as f64
    );
    assert!(!samples.is_empty(), "Should have received audio");
    assert!(samples.iter().all(|s| s.is_finite()));
}

#[tokio::test]
async fn test_stt_silence() {
    let Some((url, api_key)) = get_server() else {
        eprintln!("Skipping test: KYUTAI_SERVER_URL not set");
        return;
    };
    init_tracing();

    let client = SttClient::new(SttConfig::new(url, api_key)).unwrap();
    let mut conn = client.connect().await.expect("Failed to connect STT");

    conn.submit(vec![0.0; SAMPLE_RATE]).await.unwrap();
    let marker = conn.send_marker().await.unwrap();
    conn.finish();

    let mut got_marker = false;
    let mut got_ready = false;
    while let Some(event) = tokio::time::timeout(Duration::from_secs(30), conn.next_event())
        .await
        .expect("STT stalled")
    {
        match event {
            SttEvent::Ready => got_ready = true,
            SttEvent::Marker { id } => got_marker = id == marker,
            _ => {}
        }
    }
    conn.done().await.expect("STT connection failed");
    assert!(got_ready, "STT server should be ready");
    assert!(got_marker, "Marker should have been echoed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tts_stt_round_trip() {
    let Some((url, api_key)) = get_server() else {
        eprintln!("Skipping test: KYUTAI_SERVER_URL not set");
        return;
    };
    init_tracing();

    let spoken_text = "Under the soft buzz of a desk lamp and the quiet pulse of \
        background fans, the world sharpens into a single stream of focus.";

    let samples = synthesize(&url, &api_key, spoken_text).await;
    assert!(!samples.is_empty(), "Should have received audio");

    // Large enough to hold every event, so feeding never waits on reading.
    let config = SttConfig::new(url, api_key).with_channel_capacity(4096);
    let client = SttClient::new(config).unwrap();
    let mut conn = client.connect().await.expect("Failed to connect STT");

    for chunk in samples.chunks(SAMPLE_RATE / 10) {
        conn.submit(chunk.to_vec()).await.expect("Failed to submit audio");
    }
    conn.finish();

    let mut words = Vec::new();
    while let Some(event) = conn.next_event().await {
        if let SttEvent::Word { text, .. } = event {
            eprintln!("STT word: {}", text);
            words.push(text);
        }
    }
    conn.done().await.expect("STT connection failed");

    let transcript = words.join(" ");
    info!("Full text: {}", transcript);

    let expected = normalize(spoken_text);
    let recognized = normalize(&transcript);
    let overlap = expected.intersection(&recognized).count() as f64 / expected.len() as f64;
    info!("Word overlap: {:.3}", overlap);
    assert!(
        overlap >= 0.8,
        "Word overlap too low: {:.3} (expected >= 0.8)",
        overlap
    );
}
