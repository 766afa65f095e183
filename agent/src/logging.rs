use crate::config::Config;
use anyhow::Result;
use std::{fs, path::Path, time::{Duration, SystemTime}};
use tracing::warn;

/// Install the global tracing subscriber: env-filtered, JSON-formatted,
/// writing daily-rolled files under `Config.log_path` (stdout when the
/// directory cannot be created).
pub fn init_tracing(cfg: &Config) -> Result<()> {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,agent=info".into());
    if !cfg.log_path.is_empty() && fs::create_dir_all(&cfg.log_path).is_ok() {
        sweep_old_logs(Path::new(&cfg.log_path), cfg.log_retention_days);
        let file_appender = tracing_appender::rolling::daily(&cfg.log_path, "agent.log");
        let (nb, guard) = tracing_appender::non_blocking(file_appender);
        Box::leak(Box::new(guard));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(nb)
            .json()
            .flatten_event(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .flatten_event(true)
            .init();
    }
    Ok(())
}

/// Delete rolled log files older than the retention window.
fn sweep_old_logs(dir: &Path, retention_days: i64) {
    let cutoff = SystemTime::now() - Duration::from_secs(retention_days.max(1) as u64 * 86_400);
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("agent.log"))
            .unwrap_or(false);
        if !is_log {
            continue;
        }
        let modified = entry.metadata().and_then(|m| m.modified());
        if let Ok(modified) = modified {
            if modified < cutoff {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(file = %path.display(), error = ?e, "failed to remove expired log");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn sweep_removes_only_expired_agent_logs() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("agent.log.2020-01-01");
        let fresh = dir.path().join("agent.log.2099-01-01");
        let other = dir.path().join("unrelated.txt");
        for p in [&old, &fresh, &other] {
            File::create(p).unwrap();
        }
        let past = SystemTime::now() - Duration::from_secs(30 * 86_400);
        let f = File::options().write(true).open(&old).unwrap();
        f.set_modified(past).unwrap();
        let f = File::options().write(true).open(&other).unwrap();
        f.set_modified(past).unwrap();

        sweep_old_logs(dir.path(), 7);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(other.exists());
    }
}
