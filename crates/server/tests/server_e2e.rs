//! End-to-end tests against a real server on an ephemeral port
//!
//! The loopback engine runs at 800 Hz and 10 frames per second (80 samples
//! per frame) so sessions prime and stream quickly.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use voice_gateway_config::Settings;
use voice_gateway_core::f32_to_pcm16_le;
use voice_gateway_server::{create_router, AppState};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(10);
const FRAME: usize = 80;

const TOKENIZER: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": { "type": "Whitespace" },
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": { "[UNK]": 0, "hello": 1, "world": 2, "▁hi": 3, "friend": 4 },
        "unk_token": "[UNK]"
    }
}"#;

struct TestServer {
    addr: SocketAddr,
    http: reqwest::Client,
    dir: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(test_settings(dir.path()));
        let app = create_router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            http: reqwest::Client::new(),
            dir,
        }
    }

    /// Start a server and load the loopback engine
    async fn ready() -> Self {
        let server = Self::start().await;
        let response = server.load_models().await;
        assert_eq!(response.status(), 202);
        server.wait_until_ready().await;
        server
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn weight_paths(&self) -> Value {
        let root = self.dir.path().join("models");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("lm.bin"), b"lm").unwrap();
        std::fs::write(root.join("codec.bin"), b"codec").unwrap();
        std::fs::write(root.join("tokenizer.json"), TOKENIZER).unwrap();
        json!({
            "lmWeightsPath": root.join("lm.bin").display().to_string(),
            "codecWeightsPath": root.join("codec.bin").display().to_string(),
            "tokenizerPath": format!(" \"{}\" ", root.join("tokenizer.json").display()),
        })
    }

    async fn load_models(&self) -> reqwest::Response {
        self.http
            .post(self.url("/api/load-models"))
            .json(&self.weight_paths())
            .send()
            .await
            .unwrap()
    }

    async fn get_json(&self, path: &str) -> Value {
        self.http
            .get(self.url(path))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn wait_until_ready(&self) {
        timeout(WAIT, async {
            loop {
                let status = self.get_json("/api/status").await;
                if status["ready"] == true {
                    return;
                }
                assert_ne!(status["phase"], "failed", "load failed: {}", status);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("engine did not become ready");
    }

    /// Wait until no session is registered and nobody holds the engine
    async fn wait_until_idle(&self) {
        timeout(WAIT, async {
            loop {
                let sessions = self.get_json("/api/sessions").await;
                if sessions["count"] == 0 && sessions["engine"]["holder"].is_null() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sessions did not drain");
    }

    /// Poll `/api/sessions` until `check` accepts the listing
    async fn wait_for_sessions(&self, check: impl Fn(&Value) -> bool) -> Value {
        timeout(WAIT, async {
            loop {
                let sessions = self.get_json("/api/sessions").await;
                if check(&sessions) {
                    return sessions;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sessions did not reach the expected state")
    }

    async fn save_personality(&self, body: Value) -> reqwest::Response {
        self.http
            .post(self.url("/api/personalities"))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn connect(&self, query: &str) -> Client {
        let url = format!("ws://{}/api/chat{}", self.addr, query);
        let (ws, _) = connect_async(url).await.unwrap();
        ws
    }
}

fn test_settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.storage.personalities_dir = dir.join("Personalities").display().to_string();
    settings.storage.settings_dir = dir.join("Settings").display().to_string();
    settings.storage.embeddings_dir = dir.join("voices").display().to_string();
    settings.engine.sample_rate = 800;
    settings.engine.frame_rate = 10.0;
    settings.engine.warmup_frames = 1;
    settings.codec.packet_samples = 40;
    settings.priming.silence_seconds = 0.1;
    settings.session.liveness_probe_ms = 5;
    settings.preview.seconds = 0.5;
    settings
}

/// Audio message carrying `frames` frames of a tone
fn audio_message(frames: usize) -> Message {
    let pcm: Vec<f32> = (0..frames * FRAME)
        .map(|i| (i as f32 * 0.3).sin() * 0.4)
        .collect();
    let mut payload = vec![0x01];
    payload.extend(f32_to_pcm16_le(&pcm));
    Message::Binary(payload)
}

fn wav_bytes(samples: usize, sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for i in 0..samples {
            let value = ((i as f32 * 0.05).sin() * 8000.0) as i16;
            writer.write_sample(value).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

async fn next_binary(ws: &mut Client) -> Vec<u8> {
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Binary(bytes) => return bytes,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {:?}", other),
        }
    }
}

async fn close_reason(ws: &mut Client) -> String {
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended before close frame")
            .expect("websocket error");
        match message {
            Message::Close(Some(frame)) => return frame.reason.to_string(),
            Message::Close(None) => panic!("close frame without reason"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_chat_round_trip_releases_engine() {
    let server = TestServer::ready().await;
    let response = server
        .save_personality(json!({ "id": "p1", "name": "Tester", "description": "hello world" }))
        .await;
    assert_eq!(response.status(), 200);

    let mut ws = server.connect("?personality_id=p1").await;
    assert_eq!(next_binary(&mut ws).await, vec![0x00]);

    // Noise is skipped and the session keeps going
    ws.send(Message::Text("hi".to_string())).await.unwrap();
    ws.send(Message::Binary(vec![0x07, 1, 2])).await.unwrap();

    ws.send(audio_message(3)).await.unwrap();
    let frame = next_binary(&mut ws).await;
    assert_eq!(frame[0], 0x01);
    assert!(frame.len() > 1);
    assert_eq!((frame.len() - 1) % 2, 0);

    let sessions = server.get_json("/api/sessions").await;
    assert_eq!(sessions["count"], 1);
    assert_eq!(sessions["sessions"][0]["phase"], "live");
    assert_eq!(sessions["sessions"][0]["personalityId"], "p1");

    ws.close(None).await.unwrap();
    server.wait_until_idle().await;
}

#[tokio::test]
async fn test_streaming_three_seconds_of_silence() {
    let server = TestServer::ready().await;
    server
        .save_personality(json!({ "id": "quiet", "name": "Quiet" }))
        .await;

    let mut ws = server.connect("?personality_id=quiet").await;
    assert_eq!(next_binary(&mut ws).await, vec![0x00]);

    // 3 s at 800 Hz, sent in uneven chunks that never line up with frames
    let silence = vec![0.0f32; 3 * 800];
    for chunk in silence.chunks(37) {
        let mut payload = vec![0x01];
        payload.extend(f32_to_pcm16_le(chunk));
        ws.send(Message::Binary(payload)).await.unwrap();
    }

    let mut audio_frames = 0;
    while let Ok(Some(message)) = timeout(Duration::from_millis(500), ws.next()).await {
        match message.unwrap() {
            Message::Binary(bytes) => {
                assert!(
                    matches!(bytes.first(), Some(0x01) | Some(0x02)),
                    "unexpected frame after handshake: {:?}",
                    bytes.first()
                );
                if bytes[0] == 0x01 {
                    audio_frames += 1;
                }
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {:?}", other),
        }
    }
    assert!(audio_frames > 0);

    ws.close(None).await.unwrap();
    server.wait_until_idle().await;
}

#[tokio::test]
async fn test_second_client_waits_for_first() {
    let server = TestServer::ready().await;
    server
        .save_personality(json!({ "id": "p1", "description": "hello" }))
        .await;

    let mut first = server.connect("?personality_id=p1").await;
    assert_eq!(next_binary(&mut first).await, vec![0x00]);

    let mut second = server.connect("?personality_id=p1").await;
    let sessions = server
        .wait_for_sessions(|s| s["count"] == 2 && s["engine"]["waiting"] == 1)
        .await;
    let mut phases: Vec<&str> = sessions["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["phase"].as_str().unwrap())
        .collect();
    phases.sort_unstable();
    assert_eq!(phases, vec!["live", "queued"]);

    assert!(
        timeout(Duration::from_millis(150), second.next()).await.is_err(),
        "queued client must not be primed while the engine is held"
    );

    first.close(None).await.unwrap();
    assert_eq!(next_binary(&mut second).await, vec![0x00]);

    second.send(audio_message(3)).await.unwrap();
    assert_eq!(next_binary(&mut second).await[0], 0x01);

    second.close(None).await.unwrap();
    server.wait_until_idle().await;
}

#[tokio::test]
async fn test_chat_rejections() {
    let server = TestServer::start().await;
    let mut ws = server.connect("?personality_id=p1").await;
    assert_eq!(close_reason(&mut ws).await, "Models are still loading");

    server.load_models().await;
    server.wait_until_ready().await;

    let mut ws = server.connect("").await;
    assert_eq!(close_reason(&mut ws).await, "personality_id is required");

    let mut ws = server.connect("?personality_id=nobody").await;
    assert_eq!(close_reason(&mut ws).await, "Personality not found");

    let mut ws = server.connect("?personality_id=..%2Fetc").await;
    assert_eq!(close_reason(&mut ws).await, "Personality not found");

    server.wait_until_idle().await;
}

#[tokio::test]
async fn test_load_models_responses() {
    let server = TestServer::start().await;

    let response = server
        .http
        .post(server.url("/api/load-models"))
        .json(&json!({ "lmWeightsPath": "/m/lm.bin" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "All three model paths are required");
    assert_eq!(body["missing"], json!(["codecWeightsPath", "tokenizerPath"]));

    let status = server.get_json("/api/status").await;
    assert_eq!(status["ready"], false);
    assert_eq!(status["loading"], false);

    assert_eq!(server.load_models().await.status(), 202);
    server.wait_until_ready().await;

    let response = server.load_models().await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "status": "already loaded", "ready": true }));

    let status = server.get_json("/api/status").await;
    assert_eq!(status["engine"]["sample_rate"], 800);
    assert_eq!(status["engine"]["frame_size"], 80);
}

#[tokio::test]
async fn test_load_models_falls_back_to_saved_settings() {
    let server = TestServer::start().await;
    let paths = server.weight_paths();

    let response = server
        .http
        .post(server.url("/api/settings"))
        .json(&paths)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let saved = server.get_json("/api/settings").await;
    assert_eq!(saved["lmWeightsPath"], paths["lmWeightsPath"]);
    // Quotes and whitespace are stripped on save
    assert!(!saved["tokenizerPath"].as_str().unwrap().starts_with(' '));

    let response = server
        .http
        .post(server.url("/api/load-models"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    server.wait_until_ready().await;
}

#[tokio::test]
async fn test_personality_crud() {
    let server = TestServer::start().await;

    let response = server.save_personality(json!({ "name": "No id" })).await;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "missing id");

    let response = server
        .save_personality(json!({
            "id": "abc",
            "name": "Friendly Bot",
            "description": "You are friendly.",
            "textTemperature": 0.5,
            "uiColor": "blue"
        }))
        .await;
    assert_eq!(response.status(), 200);

    let listed = server.get_json("/api/personalities").await;
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], "abc");
    assert_eq!(listed[0]["uiColor"], "blue");
    assert!(listed[0].get("embeddingData").is_none());

    let response = server
        .http
        .delete(server.url("/api/personalities/abc"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = server
        .http
        .delete(server.url("/api/personalities/abc"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "not found");

    assert!(server
        .get_json("/api/personalities")
        .await
        .as_array()
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_embedding_generate_preview_and_chat() {
    let server = TestServer::start().await;

    let response = server
        .http
        .post(server.url("/api/test-embedding"))
        .json(&json!({ "name": "alice" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    server.load_models().await;
    server.wait_until_ready().await;

    let form = reqwest::multipart::Form::new().text("name", "alice");
    let response = server
        .http
        .post(server.url("/api/generate-embedding"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let mut zero_rate = wav_bytes(800, 800);
    zero_rate[24..32].copy_from_slice(&[0u8; 8]);
    let part = reqwest::multipart::Part::bytes(zero_rate)
        .file_name("broken.wav")
        .mime_str("audio/wav")
        .unwrap();
    let form = reqwest::multipart::Form::new()
        .part("audio", part)
        .text("name", "broken");
    let response = server
        .http
        .post(server.url("/api/generate-embedding"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let part = reqwest::multipart::Part::bytes(wav_bytes(800, 800))
        .file_name("reference.wav")
        .mime_str("audio/wav")
        .unwrap();
    let form = reqwest::multipart::Form::new()
        .part("audio", part)
        .text("name", "alice");
    let response = server
        .http
        .post(server.url("/api/generate-embedding"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "status": "ok", "embedding": "alice.emb" }));

    let voices = server.get_json("/api/voices").await;
    assert_eq!(voices["count"], 1);
    assert_eq!(voices["voices"][0]["file"], "alice.emb");

    let response = server
        .http
        .post(server.url("/api/test-embedding"))
        .json(&json!({ "name": "alice", "text": "hello friend" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "audio/wav");
    let wav = response.bytes().await.unwrap();
    let reader = hound::WavReader::new(std::io::Cursor::new(wav.to_vec())).unwrap();
    assert_eq!(reader.spec().sample_rate, 800);
    assert!(reader.len() > 0);

    let response = server
        .http
        .post(server.url("/api/test-embedding"))
        .json(&json!({ "name": "bob" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // A personality created from the embedding primes with the voice
    server
        .save_personality(json!({
            "id": "voiced",
            "description": "hello",
            "embedding": "alice.emb"
        }))
        .await;
    let mut ws = server.connect("?personality_id=voiced").await;
    assert_eq!(next_binary(&mut ws).await, vec![0x00]);
    ws.close(None).await.unwrap();
    server.wait_until_idle().await;
}

#[tokio::test]
async fn test_health_and_metrics_endpoints() {
    let server = TestServer::start().await;

    let health = server.get_json("/health").await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["engine"], "not_loaded");
    assert_eq!(health["sessions"], 0);

    // No recorder is installed in tests
    let response = server.http.get(server.url("/metrics")).send().await.unwrap();
    assert_eq!(response.status(), 404);
}
