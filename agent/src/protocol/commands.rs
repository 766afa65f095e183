//! Control-plane command dispatch.
//!
//! Handler failures never escape the read loop; every outcome is mirrored
//! back as a `command_response{command, status, message}`.

use super::{Message, ProtocolEvent, Session};
use crate::updater;
use serde_json::Value;
use std::env;
use std::process::Command;
use std::time::Duration;
use tracing::{info, warn};

/// Delay between acknowledging a restart-class command and acting on it,
/// so the response reaches the panel first.
const RESTART_ACK_DELAY: Duration = Duration::from_millis(500);

pub async fn dispatch(session: &Session, msg: &Message) {
    let command = msg
        .command
        .as_deref()
        .or_else(|| msg.data.get("command").and_then(Value::as_str));
    let Some(command) = command else {
        warn!("command message without command field");
        return;
    };
    info!(%command, "command received");
    session.logs.push("info", format!("command received: {command}"));

    match command {
        "restart" => handle_restart(session).await,
        "update" => handle_update(session, &msg.data).await,
        "update_config" => handle_update_config(session, &msg.data).await,
        other => warn!(command = %other, "unknown command, dropping"),
    }
}

async fn respond(session: &Session, command: &str, status: &str, message: &str) {
    let reply = Message::command_response(command, status, message);
    if let Err(e) = session.client.send(&reply).await {
        warn!(%command, error = ?e, "sending command response failed");
    }
}

async fn handle_restart(session: &Session) {
    respond(session, "restart", "success", "Agent 即将重启").await;
    tokio::time::sleep(RESTART_ACK_DELAY).await;
    restart_program();
}

async fn handle_update(session: &Session, data: &Value) {
    let Some(version) = data.get("version").and_then(Value::as_str) else {
        respond(session, "update", "error", "缺少版本信息").await;
        return;
    };
    let version = version.to_string();
    let version_type = data
        .get("version_type")
        .and_then(Value::as_str)
        .unwrap_or("release")
        .to_string();
    respond(session, "update", "success", "开始更新").await;

    // The download and swap run detached; the read loop keeps serving.
    let client = session.client.clone();
    let logs = session.logs.clone();
    tokio::spawn(async move {
        match updater::update_agent(&version, &version_type).await {
            Ok(()) => {
                let reply =
                    Message::command_response("update", "success", "更新完成，即将重启");
                let _ = client.send(&reply).await;
                logs.push("info", format!("updated to {version}, restarting"));
                tokio::time::sleep(RESTART_ACK_DELAY).await;
                updater::spawn_delayed_reexec();
                std::process::exit(0);
            }
            Err(e) => {
                warn!(error = ?e, "update failed");
                logs.push("error", format!("update failed: {e:#}"));
                let reply = Message::command_response(
                    "update",
                    "error",
                    &format!("更新失败: {e:#}"),
                );
                let _ = client.send(&reply).await;
            }
        }
    });
}

async fn handle_update_config(session: &Session, data: &Value) {
    if !data.is_object() {
        respond(session, "update_config", "error", "无效的配置数据").await;
        return;
    }
    let connection_changed = {
        let mut cfg = session.cfg.write().await;
        let changed = merge_config_update(&mut cfg, data);
        session.persist(&cfg);
        changed
    };

    if connection_changed {
        respond(
            session,
            "update_config",
            "success",
            "配置已更新，即将重启以应用新配置",
        )
        .await;
        tokio::time::sleep(RESTART_ACK_DELAY).await;
        restart_program();
    } else {
        respond(session, "update_config", "success", "配置已更新并重载").await;
        let _ = session.events.send(ProtocolEvent::ReloadRequested).await;
    }
}

/// Merge the whitelisted fields into the config. Returns true when the
/// server address or key changed, which requires a restart to apply.
/// Invalid cadences are rejected field-by-field; the existing value stays.
pub(crate) fn merge_config_update(cfg: &mut crate::config::Config, data: &Value) -> bool {
    if let Some(tz) = data.get("timezone").and_then(Value::as_str) {
        cfg.timezone = tz.to_string();
    }
    if let Some(path) = data.get("log_path").and_then(Value::as_str) {
        cfg.log_path = path.to_string();
    }
    apply_interval(data, "metrics_interval", &mut cfg.metrics_interval);
    apply_interval(data, "detail_interval", &mut cfg.detail_interval);
    apply_interval(data, "system_interval", &mut cfg.system_interval);
    apply_interval(data, "heartbeat_interval", &mut cfg.heartbeat_interval);

    let mut connection_changed = false;
    if let Some(server) = data.get("server").and_then(Value::as_str) {
        if server != cfg.server {
            cfg.server = server.to_string();
            connection_changed = true;
        }
    }
    if let Some(key) = data.get("key").and_then(Value::as_str) {
        if key != cfg.key {
            cfg.key = key.to_string();
            connection_changed = true;
        }
    }
    connection_changed
}

fn apply_interval(data: &Value, key: &str, slot: &mut i64) {
    let Some(value) = data.get(key) else { return };
    match value.as_i64() {
        Some(n) if n > 0 => *slot = n,
        _ => warn!(%key, %value, "rejecting non-positive cadence, keeping current value"),
    }
}

/// Hand control back to the service manager: `<exe> restart` and exit 0 on
/// success. Without a manager, fall back to a detached child that waits
/// two seconds and runs `<exe> run` in our place.
fn restart_program() -> ! {
    let exe = env::current_exe().unwrap_or_else(|_| "agent".into());
    let managed = Command::new(&exe)
        .arg("restart")
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if managed {
        info!("service manager restart requested, exiting");
        std::process::exit(0);
    }
    warn!("service manager unavailable, re-execing directly");
    updater::spawn_delayed_reexec();
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;

    fn base_config() -> Config {
        let mut cfg = Config {
            server: "wss://panel/ws".into(),
            key: "XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX".into(),
            ..Config::default()
        };
        cfg.apply_defaults();
        cfg
    }

    #[test]
    fn merge_applies_whitelisted_fields() {
        let mut cfg = base_config();
        let changed = merge_config_update(
            &mut cfg,
            &json!({"metrics_interval": 2, "timezone": "UTC", "log_path": "/tmp/logs"}),
        );
        assert!(!changed);
        assert_eq!(cfg.metrics_interval, 2);
        assert_eq!(cfg.timezone, "UTC");
        assert_eq!(cfg.log_path, "/tmp/logs");
        assert_eq!(cfg.detail_interval, 15);
    }

    #[test]
    fn merge_rejects_nonpositive_cadences() {
        let mut cfg = base_config();
        let changed = merge_config_update(
            &mut cfg,
            &json!({"metrics_interval": 0, "detail_interval": -5, "system_interval": "x"}),
        );
        assert!(!changed);
        assert_eq!(cfg.metrics_interval, 5);
        assert_eq!(cfg.detail_interval, 15);
        assert_eq!(cfg.system_interval, 15);
    }

    #[test]
    fn merge_flags_connection_changes() {
        let mut cfg = base_config();
        assert!(!merge_config_update(
            &mut cfg,
            &json!({"server": "wss://panel/ws"})
        ));
        assert!(merge_config_update(
            &mut cfg,
            &json!({"server": "wss://other/ws"})
        ));
        assert_eq!(cfg.server, "wss://other/ws");
        assert!(merge_config_update(&mut cfg, &json!({"key": "new-key"})));
    }
}
