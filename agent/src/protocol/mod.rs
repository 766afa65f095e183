//! Panel session protocol: message envelope, authentication and key
//! exchange, and the per-connection read loop.
//!
//! The loop is the connection's single reader. Supervisor-visible
//! transitions (`AuthSuccess`, `Disconnected`, `ReloadRequested`) are
//! emitted on an event channel so the protocol never blocks on worker
//! lifecycle.

pub mod commands;

use crate::collectors::LogShipper;
use crate::config::{self, Config, KEY_LEN};
use crate::crypto;
use crate::transport::WsClient;
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

/// Wait between reconnect bursts once a burst has been exhausted. The outer
/// loop never gives up; the agent must not exit on transport failure.
const BURST_COOLDOWN: Duration = Duration::from_secs(60);

/// Wire envelope shared by every panel exchange. `data` is always present
/// on the wire (`null` when a message carries none).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl Message {
    pub fn new(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            status: None,
            message: None,
            command: None,
        }
    }

    pub fn hello() -> Self {
        Self::new("hello", Value::Null)
    }

    pub fn command_response(command: &str, status: &str, message: &str) -> Self {
        Self::new(
            "command_response",
            json!({ "command": command, "status": status, "message": message }),
        )
    }

    fn is_success(&self) -> bool {
        self.status.as_deref() == Some("success")
    }
}

/// Session transitions the supervisor acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolEvent {
    AuthSuccess,
    Disconnected,
    ReloadRequested,
}

pub struct Session {
    pub(crate) client: Arc<WsClient>,
    pub(crate) cfg: Arc<RwLock<Config>>,
    pub(crate) config_path: PathBuf,
    pub(crate) events: mpsc::Sender<ProtocolEvent>,
    pub(crate) logs: LogShipper,
}

impl Session {
    pub fn new(
        client: Arc<WsClient>,
        cfg: Arc<RwLock<Config>>,
        config_path: PathBuf,
        events: mpsc::Sender<ProtocolEvent>,
        logs: LogShipper,
    ) -> Self {
        Self {
            client,
            cfg,
            config_path,
            events,
            logs,
        }
    }

    /// Read loop for the lifetime of the agent. Assumes the transport is
    /// already connected; re-authenticates after every reconnect.
    pub async fn run(&self) {
        self.send_auth().await;

        loop {
            if self.client.is_stopped() {
                return;
            }
            match self.client.receive().await {
                Ok(raw) => {
                    if let Err(e) = self.handle_frame(&raw).await {
                        warn!(error = ?e, "message handling failed");
                    }
                }
                Err(e) => {
                    if self.client.is_stopped() {
                        return;
                    }
                    warn!(error = ?e, "connection lost, reconnecting");
                    let _ = self.events.send(ProtocolEvent::Disconnected).await;
                    if !self.reconnect_forever().await {
                        return;
                    }
                    self.send_auth().await;
                }
            }
        }
    }

    /// Bounded bursts inside an infinite loop: each burst is 5 attempts 5 s
    /// apart; an exhausted burst cools down for 60 s and tries again.
    /// Returns false only when the client was stopped.
    async fn reconnect_forever(&self) -> bool {
        loop {
            if self.client.is_stopped() {
                return false;
            }
            match self.client.reconnect().await {
                Ok(()) => return true,
                Err(e) => {
                    error!(
                        error = ?e,
                        "reconnect burst exhausted, retrying in {}s",
                        BURST_COOLDOWN.as_secs()
                    );
                    tokio::time::sleep(BURST_COOLDOWN).await;
                }
            }
        }
    }

    /// Emit the auth message for this connection, generating and persisting
    /// a keypair on first use.
    pub async fn send_auth(&self) {
        let (key, public_pem) = match self.ensure_keypair().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = ?e, "cannot prepare auth credentials");
                return;
            }
        };
        if key.len() != KEY_LEN {
            warn!(len = key.len(), "communication key is not {KEY_LEN} characters");
        }
        let auth = Message::new(
            "auth",
            json!({ "type": "server", "key": key, "agent_public_key": public_pem }),
        );
        match self.client.send(&auth).await {
            Ok(()) => info!("auth message sent"),
            Err(e) => error!(error = ?e, "sending auth message failed"),
        }
    }

    /// Returns (shared key, public PEM), creating the RSA keypair when the
    /// config has none yet.
    async fn ensure_keypair(&self) -> Result<(String, String)> {
        {
            let cfg = self.cfg.read().await;
            if !cfg.agent_public_key.is_empty() && !cfg.agent_private_key.is_empty() {
                return Ok((cfg.key.clone(), cfg.agent_public_key.clone()));
            }
        }
        info!("generating agent RSA keypair");
        let (private_pem, public_pem) = crypto::generate_keypair()?;
        let mut cfg = self.cfg.write().await;
        cfg.agent_private_key = private_pem;
        cfg.agent_public_key = public_pem.clone();
        self.persist(&cfg);
        Ok((cfg.key.clone(), public_pem))
    }

    async fn handle_frame(&self, raw: &[u8]) -> Result<()> {
        let msg: Message = match serde_json::from_slice(raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "dropping malformed message");
                return Ok(());
            }
        };

        match msg.kind.as_str() {
            "auth" if msg.is_success() => {
                info!("authentication succeeded");
                self.logs.push("info", "authentication succeeded");
                let _ = self.events.send(ProtocolEvent::AuthSuccess).await;
                self.send_agent_config().await;
            }
            "auth" if msg.status.is_none() => {
                // The panel may re-request auth mid-session.
                self.send_auth().await;
            }
            "key_exchange" if msg.is_success() => self.handle_key_exchange(&msg.data).await?,
            "session_key" if msg.is_success() => self.handle_session_key(&msg.data).await?,
            "command" => commands::dispatch(self, &msg).await,
            "hello" => {}
            _ => match (&msg.status, &msg.message) {
                (Some(status), Some(text)) if status != "success" => {
                    warn!(kind = %msg.kind, %text, "panel reported failure");
                }
                (Some(_), Some(text)) => {
                    info!(kind = %msg.kind, %text, "panel response");
                }
                _ => warn!(kind = %msg.kind, "unknown message type"),
            },
        }
        Ok(())
    }

    /// Verify and store the panel public key. The computed fingerprint must
    /// match the advertised one, and the pinned fingerprint when present;
    /// an empty pin is trust-on-first-use.
    async fn handle_key_exchange(&self, data: &Value) -> Result<()> {
        let panel_pub = data
            .get("panel_public_key")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("key_exchange missing panel_public_key"))?;
        let advertised = data
            .get("panel_fingerprint")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("key_exchange missing panel_fingerprint"))?;

        let computed = crypto::fingerprint(panel_pub).context("fingerprinting panel key")?;
        if !computed.eq_ignore_ascii_case(advertised) {
            self.logs.push("error", "panel fingerprint mismatch");
            bail!("fingerprint mismatch: advertised {advertised}, computed {computed}");
        }

        let mut cfg = self.cfg.write().await;
        if cfg.panel_fingerprint.is_empty() {
            info!(fingerprint = %computed, "pinning panel fingerprint on first use");
        } else if !cfg.panel_fingerprint.eq_ignore_ascii_case(&computed) {
            error!(
                pinned = %cfg.panel_fingerprint,
                received = %computed,
                "panel fingerprint mismatch, possible MITM, rejecting key"
            );
            self.logs.push("error", "panel fingerprint mismatch, possible MITM");
            bail!("fingerprint mismatch against pinned value");
        }
        cfg.panel_public_key = panel_pub.to_string();
        cfg.panel_fingerprint = computed;
        self.persist(&cfg);
        info!("panel public key stored");
        Ok(())
    }

    /// Unwrap the RSA-sealed AES session key and switch the transport to
    /// encrypted frames.
    async fn handle_session_key(&self, data: &Value) -> Result<()> {
        let encoded = data
            .get("encrypted_session_key")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("session_key missing encrypted_session_key"))?;
        let sealed = BASE64
            .decode(encoded)
            .context("decoding encrypted session key")?;

        let private_pem = {
            let cfg = self.cfg.read().await;
            if cfg.agent_private_key.is_empty() {
                bail!("no agent private key to unwrap session key");
            }
            cfg.agent_private_key.clone()
        };
        let session_key =
            crypto::rsa_decrypt(&sealed, &private_pem).context("unwrapping session key")?;
        self.client.enable_encryption(session_key.clone())?;

        let mut cfg = self.cfg.write().await;
        cfg.session_key = BASE64.encode(&session_key);
        cfg.encryption_enabled = true;
        self.persist(&cfg);
        info!("session encryption enabled");
        self.logs.push("info", "session encryption enabled");
        Ok(())
    }

    /// Snapshot of the reporting settings, sent right after auth succeeds.
    async fn send_agent_config(&self) {
        let data = {
            let cfg = self.cfg.read().await;
            json!({
                "timezone": cfg.timezone,
                "metrics_interval": cfg.metrics_interval,
                "detail_interval": cfg.detail_interval,
                "system_interval": cfg.system_interval,
                "heartbeat_interval": cfg.heartbeat_interval,
                "log_path": cfg.log_path,
            })
        };
        if let Err(e) = self.client.send(&Message::new("agent_config", data)).await {
            warn!(error = ?e, "sending agent_config failed");
        }
    }

    pub(crate) fn persist(&self, cfg: &Config) {
        if let Err(e) = config::save_config(cfg, &self.config_path) {
            warn!(error = ?e, "persisting config failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_serializes_with_null_data() {
        let json = serde_json::to_string(&Message::hello()).unwrap();
        assert_eq!(json, r#"{"type":"hello","data":null}"#);
    }

    #[test]
    fn command_response_mirrors_triple() {
        let msg = Message::command_response("update_config", "success", "配置已更新并重载");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "command_response");
        assert_eq!(v["data"]["command"], "update_config");
        assert_eq!(v["data"]["status"], "success");
        assert_eq!(v["data"]["message"], "配置已更新并重载");
        assert!(v.get("status").is_none());
    }

    #[test]
    fn inbound_command_parses_envelope() {
        let msg: Message = serde_json::from_str(
            r#"{"type":"command","command":"update_config","data":{"metrics_interval":2}}"#,
        )
        .unwrap();
        assert_eq!(msg.kind, "command");
        assert_eq!(msg.command.as_deref(), Some("update_config"));
        assert_eq!(msg.data["metrics_interval"], 2);
        assert!(!msg.is_success());
    }

    #[test]
    fn status_only_messages_parse() {
        let msg: Message = serde_json::from_str(r#"{"type":"auth","status":"success"}"#).unwrap();
        assert!(msg.is_success());
        assert!(msg.data.is_null());
    }
}
