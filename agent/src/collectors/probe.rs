//! Raw OS sampling. Everything the reporting layer knows about the host
//! funnels through [`HostProbe`]; failures degrade to zero values so
//! telemetry keeps flowing.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sysinfo::{
    CpuRefreshKind, Disks, MemoryRefreshKind, Networks, ProcessRefreshKind, ProcessesToUpdate,
    RefreshKind, System,
};
use tokio::sync::Mutex;
use tracing::warn;

const IPV4_LOOKUP_URLS: [&str; 2] = ["https://api.ipify.org", "https://4.ipw.cn"];
const IPV4_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HostInfo {
    pub hostname: String,
    pub platform: String,
    pub os: String,
    pub kernel_version: String,
    pub arch: String,
}

pub struct MemoryStat {
    pub total: u64,
    pub used: u64,
    pub used_percent: f64,
}

pub struct SwapStat {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub used_percent: f64,
}

pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f32,
    pub mem_bytes: u64,
}

/// Keeps the sysinfo handles alive across samples so CPU usage and
/// counter deltas stay meaningful.
pub struct HostProbe {
    sys: Mutex<System>,
    disks: Mutex<Disks>,
    networks: Mutex<Networks>,
}

impl HostProbe {
    pub fn new() -> Self {
        let refresh = RefreshKind::nothing()
            .with_cpu(CpuRefreshKind::everything())
            .with_memory(MemoryRefreshKind::everything())
            .with_processes(ProcessRefreshKind::everything());
        let mut sys = System::new_with_specifics(refresh);
        sys.refresh_all();
        Self {
            sys: Mutex::new(sys),
            disks: Mutex::new(Disks::new_with_refreshed_list()),
            networks: Mutex::new(Networks::new_with_refreshed_list()),
        }
    }

    pub fn host_info(&self) -> HostInfo {
        HostInfo {
            hostname: System::host_name().unwrap_or_else(|| "unknown".into()),
            platform: System::name().unwrap_or_else(|| "unknown".into()),
            os: std::env::consts::OS.into(),
            kernel_version: System::kernel_version().unwrap_or_else(|| "unknown".into()),
            arch: std::env::consts::ARCH.into(),
        }
    }

    pub fn boot_time(&self) -> u64 {
        System::boot_time()
    }

    /// OS-reported uptime, falling back to `now − boot_time`. A boot time
    /// in the future reports zero.
    pub fn uptime(&self) -> u64 {
        let uptime = System::uptime();
        if uptime > 0 {
            return uptime;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let boot = System::boot_time();
        if boot > now {
            0
        } else {
            now - boot
        }
    }

    pub async fn cpu_logical_count(&self) -> usize {
        self.sys.lock().await.cpus().len()
    }

    /// Total CPU usage over a sampling window.
    pub async fn cpu_percent_total(&self, window: Duration) -> f32 {
        self.sample_cpu(window).await;
        self.sys.lock().await.global_cpu_usage()
    }

    /// Per-core CPU usage over a sampling window.
    pub async fn cpu_percent_per_core(&self, window: Duration) -> Vec<f32> {
        self.sample_cpu(window).await;
        self.sys
            .lock()
            .await
            .cpus()
            .iter()
            .map(|c| c.cpu_usage())
            .collect()
    }

    // The lock is released across the window so concurrent probe users
    // are not stalled behind the sample.
    async fn sample_cpu(&self, window: Duration) {
        self.sys.lock().await.refresh_cpu_usage();
        tokio::time::sleep(window).await;
        self.sys.lock().await.refresh_cpu_usage();
    }

    /// Model names per core; usually one distinct brand repeated.
    pub async fn cpu_info_list(&self) -> Vec<String> {
        self.sys
            .lock()
            .await
            .cpus()
            .iter()
            .map(|c| c.brand().to_string())
            .collect()
    }

    pub async fn virtual_memory(&self) -> MemoryStat {
        let mut sys = self.sys.lock().await;
        sys.refresh_memory();
        let total = sys.total_memory();
        let used = total.saturating_sub(sys.available_memory());
        let used_percent = percent(used, total);
        MemoryStat {
            total,
            used,
            used_percent,
        }
    }

    pub async fn swap_memory(&self) -> SwapStat {
        let mut sys = self.sys.lock().await;
        sys.refresh_memory();
        let total = sys.total_swap();
        let used = sys.used_swap();
        SwapStat {
            total,
            used,
            free: total.saturating_sub(used),
            used_percent: percent(used, total),
        }
    }

    /// All mounted partitions with usage, unfiltered.
    pub async fn partitions(&self) -> Vec<Partition> {
        let mut disks = self.disks.lock().await;
        disks.refresh(true);
        disks
            .iter()
            .map(|d| {
                let total = d.total_space();
                let free = d.available_space();
                let used = total.saturating_sub(free);
                Partition {
                    device: d.name().to_string_lossy().into_owned(),
                    mount_point: d.mount_point().to_string_lossy().into_owned(),
                    fs_type: d.file_system().to_string_lossy().into_owned(),
                    total,
                    used,
                    free,
                    used_percent: percent(used, total),
                }
            })
            .collect()
    }

    /// Cumulative (read, written) bytes per block device.
    pub async fn disk_io_counters(&self) -> HashMap<String, (u64, u64)> {
        let mut disks = self.disks.lock().await;
        disks.refresh(true);
        disks
            .iter()
            .map(|d| {
                let usage = d.usage();
                (
                    d.name().to_string_lossy().into_owned(),
                    (usage.total_read_bytes, usage.total_written_bytes),
                )
            })
            .collect()
    }

    /// Cumulative (sent, received) bytes per interface.
    pub async fn net_io_counters(&self) -> HashMap<String, (u64, u64)> {
        let mut networks = self.networks.lock().await;
        networks.refresh(true);
        networks
            .iter()
            .map(|(name, data)| {
                (
                    name.clone(),
                    (data.total_transmitted(), data.total_received()),
                )
            })
            .collect()
    }

    /// Open (tcp, udp) socket counts. Only Linux exposes these cheaply;
    /// elsewhere both counts are zero.
    pub fn net_connections(&self) -> (usize, usize) {
        #[cfg(target_os = "linux")]
        {
            let tcp = proc_net_rows("/proc/net/tcp") + proc_net_rows("/proc/net/tcp6");
            let udp = proc_net_rows("/proc/net/udp") + proc_net_rows("/proc/net/udp6");
            (tcp, udp)
        }
        #[cfg(not(target_os = "linux"))]
        {
            (0, 0)
        }
    }

    pub async fn processes(&self) -> Vec<ProcessSample> {
        let mut sys = self.sys.lock().await;
        sys.refresh_processes(ProcessesToUpdate::All, true);
        sys.processes()
            .values()
            .map(|p| ProcessSample {
                pid: p.pid().as_u32(),
                name: p.name().to_string_lossy().into_owned(),
                cpu_percent: p.cpu_usage(),
                mem_bytes: p.memory(),
            })
            .collect()
    }

    pub async fn total_memory(&self) -> u64 {
        self.sys.lock().await.total_memory()
    }
}

/// Best-effort public IPv4 lookup; empty string when every endpoint fails.
pub async fn public_ipv4() -> String {
    let Ok(client) = reqwest::Client::builder()
        .timeout(IPV4_LOOKUP_TIMEOUT)
        .build()
    else {
        return String::new();
    };
    for url in IPV4_LOOKUP_URLS {
        match client.get(url).send().await {
            Ok(resp) => match resp.text().await {
                Ok(ip) if !ip.trim().is_empty() => return ip.trim().to_string(),
                Ok(_) => continue,
                Err(e) => warn!(%url, error = ?e, "reading IPv4 lookup response failed"),
            },
            Err(e) => warn!(%url, error = ?e, "IPv4 lookup failed, trying next endpoint"),
        }
    }
    String::new()
}

impl Default for HostProbe {
    fn default() -> Self {
        Self::new()
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

#[cfg(target_os = "linux")]
fn proc_net_rows(path: &str) -> usize {
    std::fs::read_to_string(path)
        .map(|s| s.lines().count().saturating_sub(1))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_zero_total() {
        assert_eq!(percent(10, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
    }

    #[test]
    fn uptime_is_sane() {
        let probe = HostProbe::new();
        // Either the OS reports it or the boot-time fallback kicks in;
        // a running test host has been up for a nonzero time.
        assert!(probe.uptime() > 0);
    }

    #[tokio::test]
    async fn memory_sampling_is_consistent() {
        let probe = HostProbe::new();
        let mem = probe.virtual_memory().await;
        assert!(mem.total > 0);
        assert!(mem.used <= mem.total);
        assert!((0.0..=100.0).contains(&mem.used_percent));
    }

    #[tokio::test]
    async fn processes_include_this_test() {
        let probe = HostProbe::new();
        let procs = probe.processes().await;
        assert!(procs.iter().any(|p| p.pid == std::process::id()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn net_connections_counts_are_available() {
        let probe = HostProbe::new();
        let (tcp, udp) = probe.net_connections();
        // Counts are non-negative by type; just ensure the parse ran.
        let _ = (tcp, udp);
    }
}
