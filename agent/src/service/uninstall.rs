#[cfg(target_os = "linux")]
use anyhow::{Context, Result};

#[cfg(target_os = "linux")]
pub fn uninstall_service() -> Result<()> {
    use super::{SERVICE_FILE, SERVICE_NAME};

    let _ = super::systemctl(&["stop", SERVICE_NAME]);
    let _ = super::systemctl(&["disable", SERVICE_NAME]);
    match std::fs::remove_file(SERVICE_FILE) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("removing unit file {SERVICE_FILE}")),
    }
    super::systemctl(&["daemon-reload"])?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn uninstall_service() -> anyhow::Result<()> {
    anyhow::bail!("service uninstall is only supported on Linux")
}
