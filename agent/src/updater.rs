//! In-place self-update: fetch the latest release, verify the tarball
//! against its published SHA-256, swap the running binary with a backup to
//! fall back on, and hand off to a fresh process.
//!
//! Every failure is reported to the caller; the updater never exits the
//! process on error.

use anyhow::{anyhow, bail, Context, Result};
use rand::{distributions::Alphanumeric, Rng};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};
use tracing::{info, warn};

const RELEASE_URL: &str =
    "https://api.github.com/repos/YunTower/CloudSentinel-Agent/releases/latest";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn update_agent(version: &str, version_type: &str) -> Result<()> {
    info!(%version, %version_type, "starting agent update");

    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(format!("agent/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .context("building HTTP client")?;

    let release: Value = client
        .get(RELEASE_URL)
        .send()
        .await
        .context("fetching release index")?
        .error_for_status()
        .context("release index request rejected")?
        .json()
        .await
        .context("parsing release index")?;
    let assets = release
        .get("assets")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("release has no assets"))?;

    let (tarball_name, sha_name) = asset_names();
    let tarball_url = find_asset_url(assets, &tarball_name)
        .ok_or_else(|| anyhow!("no package for this platform: {tarball_name}"))?;
    let sha_url = find_asset_url(assets, &sha_name)
        .ok_or_else(|| anyhow!("no checksum file for this platform: {sha_name}"))?;
    info!(package = %tarball_name, "found release assets");

    let work_dir = env::temp_dir().join(format!("agent-update-{}", rand_str(6)));
    fs::create_dir_all(&work_dir).context("creating update workspace")?;
    let result = run_update(&client, &work_dir, &tarball_name, tarball_url, sha_url).await;
    if let Err(e) = fs::remove_dir_all(&work_dir) {
        warn!(error = ?e, "cleaning update workspace failed");
    }
    result
}

async fn run_update(
    client: &reqwest::Client,
    work_dir: &Path,
    tarball_name: &str,
    tarball_url: String,
    sha_url: String,
) -> Result<()> {
    let tarball_path = work_dir.join(tarball_name);
    let sha_path = work_dir.join("package.sha256");
    download_file(client, &tarball_url, &tarball_path).await?;
    download_file(client, &sha_url, &sha_path).await?;
    info!("downloads complete");

    let expected = read_expected_sha256(&sha_path)?;
    let actual = file_sha256(&tarball_path)?;
    if !expected.eq_ignore_ascii_case(&actual) {
        bail!("checksum mismatch: expected {expected}, got {actual}");
    }
    info!("checksum verified");

    let extract_dir = work_dir.join("extract");
    fs::create_dir_all(&extract_dir).context("creating extract dir")?;
    extract_tar_gz(&tarball_path, &extract_dir)?;

    let new_binary = locate_binary(&extract_dir, &binary_name())?;
    let current = env::current_exe().context("locating current executable")?;
    let backup = PathBuf::from(format!("{}.backup", current.display()));
    fs::copy(&current, &backup).context("backing up current executable")?;

    // Unlink before copying: overwriting a running executable in place is
    // refused on Linux.
    fs::remove_file(&current).context("unlinking current executable")?;
    if let Err(e) = fs::copy(&new_binary, &current) {
        // Put the old binary back before giving up.
        if let Err(restore) = fs::copy(&backup, &current) {
            bail!("replacing executable failed ({e}), and restoring backup failed ({restore})");
        }
        bail!("replacing executable failed: {e}");
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(&current, fs::Permissions::from_mode(0o755)) {
            warn!(error = ?e, "setting executable permissions failed");
        }
    }

    info!("executable replaced");
    Ok(())
}

/// Detached hand-off: a child waits two seconds, then runs `<exe> run` so
/// the new binary takes over after the current process exits.
pub fn spawn_delayed_reexec() {
    let exe = env::current_exe().unwrap_or_else(|_| PathBuf::from("agent"));
    #[cfg(unix)]
    let spawned = std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(format!("sleep 2; exec '{}' run", exe.display()))
        .spawn();
    #[cfg(not(unix))]
    let spawned = std::process::Command::new("cmd")
        .args(["/C", &format!("timeout /T 2 >nul & \"{}\" run", exe.display())])
        .spawn();
    match spawned {
        Ok(child) => info!(pid = child.id(), "re-exec helper spawned"),
        Err(e) => warn!(error = ?e, "spawning re-exec helper failed"),
    }
}

/// Release assets use Go-style architecture names.
fn arch_name() -> &'static str {
    match env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

fn asset_names() -> (String, String) {
    let os = env::consts::OS;
    let arch = arch_name();
    (
        format!("agent-{os}-{arch}.tar.gz"),
        format!("agent-{os}-{arch}.sha256"),
    )
}

fn binary_name() -> String {
    let base = format!("agent-{}-{}", env::consts::OS, arch_name());
    if cfg!(windows) {
        format!("{base}.exe")
    } else {
        base
    }
}

fn find_asset_url(assets: &[Value], name: &str) -> Option<String> {
    assets.iter().find_map(|asset| {
        if asset.get("name").and_then(Value::as_str) == Some(name) {
            asset
                .get("browser_download_url")
                .and_then(Value::as_str)
                .filter(|url| !url.is_empty())
                .map(str::to_owned)
        } else {
            None
        }
    })
}

async fn download_file(client: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    let bytes = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("downloading {url}"))?
        .error_for_status()
        .with_context(|| format!("download rejected: {url}"))?
        .bytes()
        .await
        .context("reading download body")?;
    fs::write(dest, &bytes).with_context(|| format!("writing {}", dest.display()))
}

fn file_sha256(path: &Path) -> Result<String> {
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let digest = Sha256::digest(&data);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// The checksum file's first whitespace-separated token is the digest
/// (`sha256sum` writes `<hex>  <filename>`).
fn read_expected_sha256(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    raw.split_whitespace()
        .next()
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("checksum file is empty"))
}

fn extract_tar_gz(tarball: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(tarball).with_context(|| format!("opening {}", tarball.display()))?;
    let gz = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(gz);
    archive
        .unpack(dest)
        .with_context(|| format!("extracting into {}", dest.display()))
}

/// The binary normally sits at the archive root; release tooling sometimes
/// nests it one directory deep.
fn locate_binary(extract_dir: &Path, name: &str) -> Result<PathBuf> {
    let direct = extract_dir.join(name);
    if direct.is_file() {
        return Ok(direct);
    }
    for entry in fs::read_dir(extract_dir).context("reading extract dir")? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let nested = entry.path().join(name);
            if nested.is_file() {
                return Ok(nested);
            }
        }
    }
    bail!("extracted archive does not contain {name}")
}

fn rand_str(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn asset_names_follow_release_convention() {
        let (tarball, sha) = asset_names();
        assert!(tarball.starts_with("agent-"));
        assert!(tarball.ends_with(".tar.gz"));
        assert!(sha.ends_with(".sha256"));
        assert_eq!(
            tarball.trim_end_matches(".tar.gz"),
            sha.trim_end_matches(".sha256")
        );
        #[cfg(target_arch = "x86_64")]
        assert!(tarball.contains("amd64"));
        #[cfg(target_arch = "aarch64")]
        assert!(tarball.contains("arm64"));
    }

    #[test]
    fn finds_asset_by_exact_name() {
        let assets = vec![
            json!({"name": "agent-linux-amd64.tar.gz", "browser_download_url": "https://dl/a.tar.gz"}),
            json!({"name": "agent-linux-amd64.sha256", "browser_download_url": "https://dl/a.sha256"}),
            json!({"name": "agent-linux-arm64.tar.gz"}),
        ];
        assert_eq!(
            find_asset_url(&assets, "agent-linux-amd64.tar.gz").as_deref(),
            Some("https://dl/a.tar.gz")
        );
        // Present but without a usable URL.
        assert_eq!(find_asset_url(&assets, "agent-linux-arm64.tar.gz"), None);
        assert_eq!(find_asset_url(&assets, "agent-darwin-amd64.tar.gz"), None);
    }

    #[test]
    fn sha256_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_sha256(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn expected_sha_is_first_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sum.sha256");
        fs::write(&path, "DEADBEEF  agent-linux-amd64.tar.gz\n").unwrap();
        assert_eq!(read_expected_sha256(&path).unwrap(), "DEADBEEF");
        fs::write(&path, "   \n").unwrap();
        assert!(read_expected_sha256(&path).is_err());
    }

    #[test]
    fn locates_binary_one_level_deep() {
        let dir = tempfile::tempdir().unwrap();
        assert!(locate_binary(dir.path(), "agent-linux-amd64").is_err());

        let nested = dir.path().join("agent-v2");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("agent-linux-amd64"), b"elf").unwrap();
        let found = locate_binary(dir.path(), "agent-linux-amd64").unwrap();
        assert_eq!(found, nested.join("agent-linux-amd64"));

        fs::write(dir.path().join("agent-linux-amd64"), b"elf").unwrap();
        let found = locate_binary(dir.path(), "agent-linux-amd64").unwrap();
        assert_eq!(found, dir.path().join("agent-linux-amd64"));
    }

    #[test]
    fn tarball_round_trip_extracts_binary() {
        let dir = tempfile::tempdir().unwrap();
        let tarball = dir.path().join("pkg.tar.gz");

        let gz = flate2::write::GzEncoder::new(
            fs::File::create(&tarball).unwrap(),
            flate2::Compression::fast(),
        );
        let mut builder = tar::Builder::new(gz);
        let payload = b"#!/bin/sh\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(payload.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "agent-linux-amd64", payload.as_slice())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        extract_tar_gz(&tarball, &out).unwrap();
        assert_eq!(fs::read(out.join("agent-linux-amd64")).unwrap(), payload);
    }
}
