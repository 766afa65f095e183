//! systemd integration. The agent runs under a unit named `agent.service`;
//! everything here is Linux-only and shells out to `systemctl`.

pub mod install;
pub mod uninstall;

#[cfg(target_os = "linux")]
use anyhow::{bail, Context, Result};
#[cfg(target_os = "linux")]
use std::process::Command;

pub const SERVICE_NAME: &str = "agent.service";
#[cfg(target_os = "linux")]
pub const SERVICE_FILE: &str = "/etc/systemd/system/agent.service";

/// Unit file contents for the given executable path.
pub fn render_unit(exec_path: &str, working_dir: &str) -> String {
    format!(
        "[Unit]\n\
         Description=Host Telemetry Agent\n\
         After=network.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={exec_path} run\n\
         Restart=always\n\
         RestartSec=5\n\
         User=root\n\
         WorkingDirectory={working_dir}\n\
         StandardOutput=journal\n\
         StandardError=journal\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    )
}

#[cfg(target_os = "linux")]
fn systemctl(args: &[&str]) -> Result<()> {
    let status = Command::new("systemctl")
        .args(args)
        .status()
        .with_context(|| format!("running systemctl {}", args.join(" ")))?;
    if !status.success() {
        bail!("systemctl {} failed with {status}", args.join(" "));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
pub fn restart() -> Result<()> {
    systemctl(&["restart", SERVICE_NAME])
}

#[cfg(target_os = "linux")]
pub fn status() -> String {
    Command::new("systemctl")
        .args(["is-active", SERVICE_NAME])
        .output()
        .ok()
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "inactive".into())
}

#[cfg(not(target_os = "linux"))]
pub fn restart() -> anyhow::Result<()> {
    anyhow::bail!("service management is only supported on Linux")
}

#[cfg(not(target_os = "linux"))]
pub fn status() -> String {
    "unsupported".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_file_points_at_executable() {
        let unit = render_unit("/opt/agent/agent", "/opt/agent");
        assert!(unit.contains("ExecStart=/opt/agent/agent run"));
        assert!(unit.contains("WorkingDirectory=/opt/agent"));
        assert!(unit.contains("Restart=always"));
        assert!(unit.contains("WantedBy=multi-user.target"));
    }
}
