//! Pid-file liveness for the service manager and the `restart`/`status`
//! CLI paths.

use anyhow::{Context, Result};
use std::{env, fs, path::PathBuf};

const DEFAULT_PID_FILE: &str = "/var/run/agent.pid";
const PID_FILE_ENV: &str = "AGENT_PID_FILE";

pub fn pid_file_path() -> PathBuf {
    env::var(PID_FILE_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_PID_FILE))
}

pub fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating pid dir {}", dir.display()))?;
    }
    fs::write(&path, format!("{}\n", std::process::id()))
        .with_context(|| format!("writing pid file {}", path.display()))
}

pub fn read_pid() -> Result<u32> {
    let path = pid_file_path();
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("reading pid file {}", path.display()))?;
    raw.trim().parse().context("parsing pid")
}

pub fn remove_pid() {
    let _ = fs::remove_file(pid_file_path());
}

/// Signal-0 probe; always false on non-Unix hosts.
pub fn process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn pid_round_trip_via_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pid");
        env::set_var(PID_FILE_ENV, &path);
        write_pid().unwrap();
        assert_eq!(read_pid().unwrap(), std::process::id());
        assert!(process_running(std::process::id()));
        remove_pid();
        assert!(read_pid().is_err());
        env::remove_var(PID_FILE_ENV);
    }
}
