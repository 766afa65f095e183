use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf};

pub const CONFIG_FILE_NAME: &str = "agent.lock.json";

/// The shared-secret token the panel issues is always 36 characters.
pub const KEY_LEN: usize = 36;

/// Process-wide settings, persisted as JSON next to the executable.
///
/// Crypto material (private key, session key) is stored in cleartext;
/// tightening file permissions is a deployment concern.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub log_path: String,
    #[serde(default)]
    pub metrics_interval: i64,
    #[serde(default)]
    pub detail_interval: i64,
    #[serde(default)]
    pub system_interval: i64,
    #[serde(default)]
    pub heartbeat_interval: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timezone: String,
    #[serde(default)]
    pub log_retention_days: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_mount_points: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_filesystems: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub monitored_services: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_private_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_public_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub panel_public_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub panel_fingerprint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_key: String,
    #[serde(default)]
    pub encryption_enabled: bool,
}

impl Config {
    /// Fill in defaults for anything the file left unset.
    pub fn apply_defaults(&mut self) {
        if self.log_path.is_empty() {
            self.log_path = "logs".into();
        }
        if self.metrics_interval <= 0 {
            self.metrics_interval = 5;
        }
        if self.detail_interval <= 0 {
            self.detail_interval = 15;
        }
        if self.system_interval <= 0 {
            self.system_interval = 15;
        }
        if self.heartbeat_interval <= 0 {
            self.heartbeat_interval = 10;
        }
        if self.timezone.is_empty() {
            self.timezone = "Asia/Shanghai".into();
        }
        if self.log_retention_days <= 0 {
            self.log_retention_days = 7;
        }
    }

    /// Startup validation. A missing server or key is fatal; a key of the
    /// wrong length is only reported by the caller.
    pub fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            bail!("config missing server address");
        }
        if self.key.is_empty() {
            bail!("config missing communication key");
        }
        Ok(())
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "server" => self.server = value.into(),
            "key" => self.key = value.into(),
            "log_path" => self.log_path = value.into(),
            "timezone" => self.timezone = value.into(),
            "metrics_interval" => self.metrics_interval = parse_interval(key, value)?,
            "detail_interval" => self.detail_interval = parse_interval(key, value)?,
            "system_interval" => self.system_interval = parse_interval(key, value)?,
            "heartbeat_interval" => self.heartbeat_interval = parse_interval(key, value)?,
            "log_retention_days" => self.log_retention_days = parse_interval(key, value)?,
            _ => bail!("unknown config key: {key}"),
        }
        Ok(())
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        Ok(match key {
            "server" => self.server.clone(),
            "key" => self.key.clone(),
            "log_path" => self.log_path.clone(),
            "timezone" => self.timezone.clone(),
            "metrics_interval" => self.metrics_interval.to_string(),
            "detail_interval" => self.detail_interval.to_string(),
            "system_interval" => self.system_interval.to_string(),
            "heartbeat_interval" => self.heartbeat_interval.to_string(),
            "log_retention_days" => self.log_retention_days.to_string(),
            _ => bail!("unknown config key: {key}"),
        })
    }
}

fn parse_interval(key: &str, value: &str) -> Result<i64> {
    let n: i64 = value
        .parse()
        .with_context(|| format!("{key} must be an integer"))?;
    if n <= 0 {
        bail!("{key} must be greater than 0");
    }
    Ok(n)
}

/// The lock file lives beside the executable so the agent stays relocatable.
pub fn config_path() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join(CONFIG_FILE_NAME)))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
}

pub fn load_config(path: &PathBuf) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let mut cfg: Config = serde_json::from_str(&raw).context("parsing config JSON")?;
    cfg.apply_defaults();
    Ok(cfg)
}

pub fn save_config(cfg: &Config, path: &PathBuf) -> Result<()> {
    let json = serde_json::to_string_pretty(cfg).context("serializing config")?;
    fs::write(path, json).with_context(|| format!("writing config file {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
    }
    Ok(())
}
