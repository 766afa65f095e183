#[cfg(target_os = "linux")]
use anyhow::{Context, Result};
#[cfg(target_os = "linux")]
use std::{env, fs};

#[cfg(target_os = "linux")]
pub fn install_service() -> Result<()> {
    use super::{render_unit, SERVICE_FILE, SERVICE_NAME};

    let exe = env::current_exe().context("locating current executable")?;
    let working_dir = exe
        .parent()
        .map(|d| d.display().to_string())
        .unwrap_or_else(|| "/".into());
    let unit = render_unit(&exe.display().to_string(), &working_dir);

    fs::write(SERVICE_FILE, unit)
        .with_context(|| format!("writing unit file {SERVICE_FILE}"))?;
    super::systemctl(&["daemon-reload"])?;
    super::systemctl(&["enable", SERVICE_NAME])?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn install_service() -> anyhow::Result<()> {
    anyhow::bail!("service install is only supported on Linux")
}
