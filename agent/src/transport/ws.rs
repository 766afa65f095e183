//! WebSocket session transport.
//!
//! One connection, one reader (the protocol loop), many writers. Writes are
//! serialized by the sink mutex; `is_connected` is an atomic read. When a
//! session key is installed, outbound messages become single binary
//! AES-GCM frames; inbound accepts both raw binary frames and the JSON
//! `{"encrypted":true,"data":<base64>}` envelope so a text handshake can
//! promote to binary encryption without a reconnect.

use crate::crypto;
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

/// Per-frame read deadline; silence past this kicks off a reconnect cycle.
pub const READ_DEADLINE: Duration = Duration::from_secs(90);
/// Fixed wait between attempts inside one reconnect burst.
pub const RECONNECT_WAIT: Duration = Duration::from_secs(5);
/// Attempts per reconnect burst. The outer retry policy is the caller's.
pub const MAX_RECONNECT: usize = 5;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsFrame>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub struct WsClient {
    url: String,
    writer: Mutex<Option<WsSink>>,
    reader: Mutex<Option<WsSource>>,
    connected: AtomicBool,
    stopped: AtomicBool,
    encryption_enabled: AtomicBool,
    session_key: StdMutex<Option<Vec<u8>>>,
}

impl WsClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            connected: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            encryption_enabled: AtomicBool::new(false),
            session_key: StdMutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Establish a single connection.
    pub async fn connect(&self) -> Result<()> {
        if self.is_stopped() {
            bail!("client stopped");
        }
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("dialing {}", self.url))?;
        let (sink, source) = stream.split();
        *self.writer.lock().await = Some(sink);
        *self.reader.lock().await = Some(source);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Close the current connection and redial with a bounded burst:
    /// [`MAX_RECONNECT`] attempts, [`RECONNECT_WAIT`] apart. A new
    /// connection means a new key exchange, so encryption state is cleared.
    pub async fn reconnect(&self) -> Result<()> {
        self.drop_connection().await;
        self.clear_encryption();

        let mut attempts = 0;
        loop {
            if self.is_stopped() {
                bail!("client stopped");
            }
            match self.connect().await {
                Ok(()) => {
                    info!("WebSocket connected");
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= MAX_RECONNECT {
                        return Err(e.context(format!("giving up after {attempts} attempts")));
                    }
                    warn!(
                        attempt = attempts,
                        max = MAX_RECONNECT,
                        error = ?e,
                        "connect failed, retrying in {}s",
                        RECONNECT_WAIT.as_secs()
                    );
                    tokio::time::sleep(RECONNECT_WAIT).await;
                }
            }
        }
    }

    /// Serialize and send one message. Concurrent-safe; the sink mutex
    /// orders frames from competing writers.
    pub async fn send<T: Serialize>(&self, content: &T) -> Result<()> {
        let body = serde_json::to_vec(content).context("serializing message")?;
        let frame = if self.encryption_enabled.load(Ordering::SeqCst) {
            let key = self
                .current_session_key()
                .ok_or_else(|| anyhow!("session key not set"))?;
            WsFrame::Binary(crypto::aes_seal(&body, &key)?)
        } else {
            WsFrame::Text(String::from_utf8(body).context("message is not UTF-8")?)
        };

        let mut writer = self.writer.lock().await;
        if !self.is_connected() {
            bail!("not connected");
        }
        let sink = writer.as_mut().ok_or_else(|| anyhow!("not connected"))?;
        if let Err(e) = sink.send(frame).await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(anyhow!(e).context("sending frame"));
        }
        Ok(())
    }

    /// Read one application message, honoring the 90-second deadline.
    /// Control frames are handled inline; undecryptable or malformed
    /// encrypted payloads are logged and skipped without dropping the
    /// connection.
    pub async fn receive(&self) -> Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;
        let source = reader.as_mut().ok_or_else(|| anyhow!("not connected"))?;
        loop {
            let frame = match timeout(READ_DEADLINE, source.next()).await {
                Err(_) => {
                    self.connected.store(false, Ordering::SeqCst);
                    bail!("read deadline of {}s exceeded", READ_DEADLINE.as_secs());
                }
                Ok(None) => {
                    self.connected.store(false, Ordering::SeqCst);
                    bail!("connection closed by remote");
                }
                Ok(Some(Err(e))) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(anyhow!(e).context("reading frame"));
                }
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                WsFrame::Text(text) => match self.decode_text(text) {
                    Ok(payload) => return Ok(payload),
                    Err(e) => {
                        warn!(error = ?e, "dropping undecodable text frame");
                        continue;
                    }
                },
                WsFrame::Binary(data) => {
                    if !self.encryption_enabled.load(Ordering::SeqCst) {
                        return Ok(data);
                    }
                    let key = self
                        .current_session_key()
                        .ok_or_else(|| anyhow!("session key not set"))?;
                    match crypto::aes_open(&data, &key) {
                        Ok(plain) => return Ok(plain),
                        Err(e) => {
                            warn!(error = ?e, "dropping undecryptable binary frame");
                            continue;
                        }
                    }
                }
                WsFrame::Ping(payload) => {
                    let mut writer = self.writer.lock().await;
                    if let Some(sink) = writer.as_mut() {
                        let _ = sink.send(WsFrame::Pong(payload)).await;
                    }
                }
                WsFrame::Close(_) => {
                    self.connected.store(false, Ordering::SeqCst);
                    bail!("connection closed by remote");
                }
                _ => {}
            }
        }
    }

    fn decode_text(&self, text: String) -> Result<Vec<u8>> {
        if !self.encryption_enabled.load(Ordering::SeqCst) {
            return Ok(text.into_bytes());
        }
        // Stateless servers may keep wrapping ciphertext in a JSON
        // envelope instead of switching to binary frames.
        if let Some(encoded) = encrypted_envelope_payload(&text) {
            let key = self
                .current_session_key()
                .ok_or_else(|| anyhow!("session key not set"))?;
            let sealed = BASE64.decode(&encoded).context("decoding envelope base64")?;
            return crypto::aes_open(&sealed, &key);
        }
        Ok(text.into_bytes())
    }

    /// Install the AES-256 session key. Idempotent per connection; the next
    /// read already decrypts.
    pub fn enable_encryption(&self, key: Vec<u8>) -> Result<()> {
        if key.len() != crypto::AES_KEY_LEN {
            bail!("session key must be {} bytes, got {}", crypto::AES_KEY_LEN, key.len());
        }
        *self.session_key.lock().unwrap_or_else(|e| e.into_inner()) = Some(key);
        self.encryption_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_encryption_enabled(&self) -> bool {
        self.encryption_enabled.load(Ordering::SeqCst)
    }

    fn clear_encryption(&self) {
        self.encryption_enabled.store(false, Ordering::SeqCst);
        *self.session_key.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn current_session_key(&self) -> Option<Vec<u8>> {
        self.session_key
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        // The reader lock may be held by a blocked receive(); closing the
        // sink unblocks it, so only clear the slot when it is free.
        if let Ok(mut reader) = self.reader.try_lock() {
            *reader = None;
        }
    }

    /// Idempotent stop; once closed, further operations fail fast.
    pub async fn close(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.drop_connection().await;
        info!("WebSocket closed");
    }
}

/// Returns the base64 payload when `text` is an
/// `{"encrypted":true,"data":"..."}` envelope.
fn encrypted_envelope_payload(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    if value.get("encrypted")?.as_bool()? {
        value.get("data")?.as_str().map(str::to_owned)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_payload_extraction() {
        assert_eq!(
            encrypted_envelope_payload(r#"{"encrypted":true,"data":"QUJD"}"#).as_deref(),
            Some("QUJD")
        );
        assert_eq!(
            encrypted_envelope_payload(r#"{"encrypted":false,"data":"QUJD"}"#),
            None
        );
        assert_eq!(encrypted_envelope_payload(r#"{"type":"hello"}"#), None);
        assert_eq!(encrypted_envelope_payload("not json"), None);
    }

    #[test]
    fn enable_encryption_validates_key_length() {
        let client = WsClient::new("ws://127.0.0.1:1/ws".into());
        assert!(client.enable_encryption(vec![0u8; 16]).is_err());
        assert!(client.enable_encryption(vec![0u8; 32]).is_ok());
        assert!(client.is_encryption_enabled());
        client.clear_encryption();
        assert!(!client.is_encryption_enabled());
    }

    #[tokio::test]
    async fn send_fails_fast_when_not_connected() {
        let client = WsClient::new("ws://127.0.0.1:1/ws".into());
        assert!(client.send(&json!({"type":"hello"})).await.is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_connect() {
        let client = WsClient::new("ws://127.0.0.1:1/ws".into());
        client.close().await;
        client.close().await;
        assert!(client.is_stopped());
        assert!(client.connect().await.is_err());
    }

    #[tokio::test]
    async fn plaintext_then_encrypted_round_trip_against_local_server() {
        use tokio_tungstenite::accept_async;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let key = [9u8; 32];

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            // First message arrives as plaintext JSON text.
            let first = ws.next().await.unwrap().unwrap();
            assert!(matches!(first, WsFrame::Text(_)));
            ws.send(WsFrame::Text(r#"{"type":"auth","status":"success"}"#.into()))
                .await
                .unwrap();
            // After the client enables encryption it must emit binary frames.
            let second = ws.next().await.unwrap().unwrap();
            let sealed = match second {
                WsFrame::Binary(b) => b,
                other => panic!("expected binary frame, got {other:?}"),
            };
            let plain = crate::crypto::aes_open(&sealed, &key).unwrap();
            assert!(serde_json::from_slice::<serde_json::Value>(&sealed).is_err());
            // Reply once sealed binary, once via the JSON envelope.
            ws.send(WsFrame::Binary(crate::crypto::aes_seal(&plain, &key).unwrap()))
                .await
                .unwrap();
            let envelope = json!({
                "encrypted": true,
                "data": BASE64.encode(crate::crypto::aes_seal(b"{\"type\":\"hello\"}", &key).unwrap()),
            });
            ws.send(WsFrame::Text(envelope.to_string())).await.unwrap();
        });

        let client = WsClient::new(format!("ws://{addr}"));
        client.connect().await.unwrap();
        assert!(client.is_connected());

        client.send(&json!({"type":"auth"})).await.unwrap();
        let reply = client.receive().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(parsed["status"], "success");

        client.enable_encryption(key.to_vec()).unwrap();
        client.send(&json!({"type":"hello","data":null})).await.unwrap();

        let echoed = client.receive().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&echoed).unwrap();
        assert_eq!(parsed["type"], "hello");

        let enveloped = client.receive().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&enveloped).unwrap();
        assert_eq!(parsed["type"], "hello");

        server.await.unwrap();
        client.close().await;
    }
}
