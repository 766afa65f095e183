//! Telemetry collection and emission.
//!
//! The [`Collector`] owns the rate samplers and the probe, shapes every
//! outbound telemetry payload, and runs the reporter body: one immediate
//! `system_info`, then three independent tickers. It also drains the
//! bounded agent-log channel into `agent_log` batches.

pub mod gpu;
pub mod probe;
pub mod rates;

use crate::config::Config;
use crate::protocol::Message;
use crate::supervisor::Schedule;
use crate::transport::WsClient;
use anyhow::{Context, Result};
use chrono::{Local, TimeZone, Utc};
use probe::{HostProbe, Partition, ProcessSample};
use rates::RateSampler;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{interval_at, Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Window for the blocking CPU usage samples.
const CPU_SAMPLE_WINDOW: Duration = Duration::from_secs(3);

const LOG_CHANNEL_CAPACITY: usize = 100;
const LOG_BATCH_SIZE: usize = 10;
const LOG_FLUSH_EVERY: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize, Clone)]
pub struct SystemInfoData {
    pub agent_version: &'static str,
    pub system_name: String,
    pub os: String,
    pub architecture: String,
    pub kernel: String,
    pub hostname: String,
    pub cores: usize,
    pub boot_time: String,
    pub uptime: u64,
}

#[derive(Debug, Serialize, Clone)]
pub struct MetricsData {
    pub cpu_usage: f32,
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_usage_percent: f64,
    pub disk_usage: f64,
    pub network_upload: f64,
    pub network_download: f64,
}

#[derive(Debug, Serialize, Clone)]
pub struct CpuCoreData {
    pub cpu_name: String,
    pub core_index: usize,
    pub cpu_usage: f32,
}

#[derive(Debug, Serialize, Clone)]
pub struct MemoryData {
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_usage_percent: f64,
}

#[derive(Debug, Serialize, Clone)]
pub struct DiskMountData {
    pub mount_point: String,
    pub device: String,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Serialize, Clone)]
pub struct DiskIoData {
    pub read_speed: f64,
    pub write_speed: f64,
}

#[derive(Debug, Serialize, Clone)]
pub struct NetworkInfoData {
    pub tcp_connections: usize,
    pub udp_connections: usize,
    pub upload_speed: f64,
    pub download_speed: f64,
    pub upload_bytes: u64,
    pub download_bytes: u64,
}

#[derive(Debug, Serialize, Clone)]
pub struct SwapData {
    pub swap_total: u64,
    pub swap_used: u64,
    pub swap_free: u64,
    pub swap_usage_percent: f64,
}

#[derive(Debug, Serialize, Clone)]
pub struct GpuInfoData {
    pub available: bool,
    pub gpus: Vec<gpu::GpuInfo>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ServiceStatusData {
    pub running: bool,
    pub pids: Vec<u32>,
    pub cpu: f64,
    pub memory: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub level: String,
    pub message: String,
    pub time: String,
}

/// Cheap handle for queueing internal log records toward the panel.
/// Never blocks: a full channel silently drops the record.
#[derive(Clone)]
pub struct LogShipper {
    tx: mpsc::Sender<LogEntry>,
    tz: chrono_tz::Tz,
}

impl LogShipper {
    pub fn push(&self, level: &str, message: impl Into<String>) {
        let entry = LogEntry {
            level: level.to_string(),
            message: message.into(),
            time: Utc::now().with_timezone(&self.tz).to_rfc3339(),
        };
        let _ = self.tx.try_send(entry);
    }
}

pub fn log_channel(timezone: &str) -> (LogShipper, mpsc::Receiver<LogEntry>) {
    let tz = timezone.parse().unwrap_or(chrono_tz::Asia::Shanghai);
    let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
    (LogShipper { tx, tz }, rx)
}

pub struct Collector {
    cfg: Arc<RwLock<Config>>,
    client: Arc<WsClient>,
    probe: HostProbe,
    net_sampler: Mutex<RateSampler>,
    disk_sampler: Mutex<RateSampler>,
}

impl Collector {
    pub fn new(cfg: Arc<RwLock<Config>>, client: Arc<WsClient>) -> Self {
        Self {
            cfg,
            client,
            probe: HostProbe::new(),
            net_sampler: Mutex::new(RateSampler::new()),
            disk_sampler: Mutex::new(RateSampler::new()),
        }
    }

    async fn emit<T: Serialize>(&self, kind: &str, data: &T) -> Result<()> {
        let value = serde_json::to_value(data).context("serializing payload")?;
        self.client.send(&Message::new(kind, value)).await
    }

    /// (upload, download) bytes/sec summed over all interfaces.
    pub async fn network_speed(&self) -> (f64, f64) {
        let counters = self.probe.net_io_counters().await;
        self.net_sampler.lock().await.sample(counters)
    }

    /// (read, write) bytes/sec summed over all block devices.
    pub async fn disk_io_speed(&self) -> (f64, f64) {
        let counters = self.probe.disk_io_counters().await;
        self.disk_sampler.lock().await.sample(counters)
    }

    async fn filtered_partitions(&self) -> Vec<Partition> {
        let (mounts, fstypes) = {
            let cfg = self.cfg.read().await;
            (
                cfg.excluded_mount_points.clone(),
                cfg.excluded_filesystems.clone(),
            )
        };
        filter_partitions(self.probe.partitions().await, &mounts, &fstypes)
    }

    /// Mean used-percent across the filtered partitions.
    pub async fn disk_usage_aggregate(&self) -> f64 {
        let parts = self.filtered_partitions().await;
        if parts.is_empty() {
            return 0.0;
        }
        parts.iter().map(|p| p.used_percent).sum::<f64>() / parts.len() as f64
    }

    pub async fn send_system_info(&self) -> Result<()> {
        let host = self.probe.host_info();
        let boot_time = Local
            .timestamp_opt(self.probe.boot_time() as i64, 0)
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let data = SystemInfoData {
            agent_version: AGENT_VERSION,
            system_name: host.platform,
            os: host.os,
            architecture: host.arch,
            kernel: host.kernel_version,
            hostname: host.hostname,
            cores: self.probe.cpu_logical_count().await,
            boot_time,
            uptime: self.probe.uptime(),
        };
        self.emit("system_info", &data).await
    }

    pub async fn send_metrics(&self) -> Result<()> {
        let cpu_usage = self.probe.cpu_percent_total(CPU_SAMPLE_WINDOW).await;
        let mem = self.probe.virtual_memory().await;
        let (network_upload, network_download) = self.network_speed().await;
        let data = MetricsData {
            cpu_usage,
            memory_total: mem.total,
            memory_used: mem.used,
            memory_usage_percent: mem.used_percent,
            disk_usage: self.disk_usage_aggregate().await,
            network_upload,
            network_download,
        };
        self.emit("metrics", &data).await
    }

    pub async fn send_cpu_info(&self) -> Result<()> {
        let per_core = self.probe.cpu_percent_per_core(CPU_SAMPLE_WINDOW).await;
        if per_core.is_empty() {
            warn!("no per-core CPU usage data");
            return Ok(());
        }
        let cpu_name = self
            .probe
            .cpu_info_list()
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| "Unknown CPU".into());
        let data: Vec<CpuCoreData> = per_core
            .into_iter()
            .enumerate()
            .map(|(core_index, cpu_usage)| CpuCoreData {
                cpu_name: cpu_name.clone(),
                core_index,
                cpu_usage,
            })
            .collect();
        self.emit("cpu_info", &data).await
    }

    pub async fn send_memory_info(&self) -> Result<()> {
        let mem = self.probe.virtual_memory().await;
        let data = MemoryData {
            memory_total: mem.total,
            memory_used: mem.used,
            memory_usage_percent: mem.used_percent,
        };
        self.emit("memory_info", &data).await
    }

    pub async fn send_disk_info(&self) -> Result<()> {
        let data: Vec<DiskMountData> = self
            .filtered_partitions()
            .await
            .into_iter()
            .map(|p| DiskMountData {
                mount_point: p.mount_point,
                device: p.device,
                total: p.total,
                used: p.used,
                free: p.free,
                usage_percent: p.used_percent,
            })
            .collect();
        self.emit("disk_info", &data).await
    }

    pub async fn send_disk_io(&self) -> Result<()> {
        let (read_speed, write_speed) = self.disk_io_speed().await;
        self.emit(
            "disk_io",
            &DiskIoData {
                read_speed,
                write_speed,
            },
        )
        .await
    }

    pub async fn send_network_info(&self) -> Result<()> {
        let (tcp_connections, udp_connections) = self.probe.net_connections();
        let counters = self.probe.net_io_counters().await;
        let (upload_bytes, download_bytes) =
            counters.values().fold((0u64, 0u64), |(tx, rx), (t, r)| {
                (tx.saturating_add(*t), rx.saturating_add(*r))
            });
        let (upload_speed, download_speed) = self.network_speed().await;
        let data = NetworkInfoData {
            tcp_connections,
            udp_connections,
            upload_speed,
            download_speed,
            upload_bytes,
            download_bytes,
        };
        self.emit("network_info", &data).await
    }

    pub async fn send_swap_info(&self) -> Result<()> {
        let swap = self.probe.swap_memory().await;
        let data = SwapData {
            swap_total: swap.total,
            swap_used: swap.used,
            swap_free: swap.free,
            swap_usage_percent: swap.used_percent,
        };
        self.emit("swap_info", &data).await
    }

    /// Service watch: nothing configured means nothing sent.
    pub async fn send_process_info(&self) -> Result<()> {
        let names = { self.cfg.read().await.monitored_services.clone() };
        if names.is_empty() {
            return Ok(());
        }
        let samples = self.probe.processes().await;
        let total_mem = self.probe.total_memory().await;
        let data = match_services(&samples, &names, total_mem);
        self.emit("process_info", &data).await
    }

    pub async fn send_gpu_info(&self) -> Result<()> {
        let stats = gpu::collect_gpu_stats().await;
        let data = GpuInfoData {
            available: stats.available,
            gpus: stats.gpus,
        };
        self.emit("gpu_info", &data).await
    }

    /// Reporter body: one immediate `system_info`, then the three cadences.
    /// A schedule change rebuilds the tickers in place, no restart needed.
    pub async fn run_reporting(
        self: Arc<Self>,
        cancel: CancellationToken,
        mut schedule_rx: watch::Receiver<Schedule>,
        health: mpsc::Sender<bool>,
    ) {
        let first = self.send_system_info().await;
        if let Err(e) = &first {
            warn!(error = ?e, "sending system info failed");
        }
        let _ = health.try_send(first.is_ok());

        let mut sched = *schedule_rx.borrow();
        info!(
            metrics = sched.metrics,
            detail = sched.detail,
            system = sched.system,
            "reporting intervals configured"
        );
        let (mut metrics_tick, mut detail_tick, mut system_tick) = build_tickers(&sched);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("reporter stopped");
                    return;
                }
                changed = schedule_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    sched = *schedule_rx.borrow();
                    (metrics_tick, detail_tick, system_tick) = build_tickers(&sched);
                    info!(
                        metrics = sched.metrics,
                        detail = sched.detail,
                        system = sched.system,
                        "reporting intervals reloaded"
                    );
                }
                _ = metrics_tick.tick() => {
                    let this = self.clone();
                    let health = health.clone();
                    tokio::spawn(async move {
                        let (metrics, procs) =
                            tokio::join!(this.send_metrics(), this.send_process_info());
                        let mut ok = true;
                        if let Err(e) = metrics {
                            warn!(error = ?e, "sending metrics failed");
                            ok = false;
                        }
                        if let Err(e) = procs {
                            warn!(error = ?e, "sending process info failed");
                            ok = false;
                        }
                        let _ = health.try_send(ok);
                    });
                }
                _ = detail_tick.tick() => {
                    let this = self.clone();
                    let health = health.clone();
                    tokio::spawn(async move {
                        let mut ok = true;
                        let sends: [(&str, Result<()>); 7] = [
                            ("cpu_info", this.send_cpu_info().await),
                            ("memory_info", this.send_memory_info().await),
                            ("disk_info", this.send_disk_info().await),
                            ("disk_io", this.send_disk_io().await),
                            ("network_info", this.send_network_info().await),
                            ("swap_info", this.send_swap_info().await),
                            ("gpu_info", this.send_gpu_info().await),
                        ];
                        for (kind, result) in sends {
                            if let Err(e) = result {
                                warn!(%kind, error = ?e, "sending detail payload failed");
                                ok = false;
                            }
                        }
                        let _ = health.try_send(ok);
                    });
                }
                _ = system_tick.tick() => {
                    let this = self.clone();
                    let health = health.clone();
                    tokio::spawn(async move {
                        let ok = match this.send_system_info().await {
                            Ok(()) => true,
                            Err(e) => {
                                warn!(error = ?e, "sending system info failed");
                                false
                            }
                        };
                        let _ = health.try_send(ok);
                    });
                }
            }
        }
    }

    /// Drain the agent-log channel into `agent_log` batches: ten entries or
    /// one second, whichever first. Send errors are swallowed so logging
    /// can never loop back on itself.
    pub async fn run_log_flusher(
        self: Arc<Self>,
        cancel: CancellationToken,
        mut rx: mpsc::Receiver<LogEntry>,
    ) {
        let mut buffer: Vec<LogEntry> = Vec::with_capacity(LOG_BATCH_SIZE);
        let mut ticker = tokio::time::interval(LOG_FLUSH_EVERY);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                entry = rx.recv() => {
                    let Some(entry) = entry else { return };
                    buffer.push(entry);
                    if buffer.len() >= LOG_BATCH_SIZE {
                        self.flush_logs(&mut buffer).await;
                    }
                }
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.flush_logs(&mut buffer).await;
                    }
                }
            }
        }
    }

    async fn flush_logs(&self, buffer: &mut Vec<LogEntry>) {
        let _ = self.emit("agent_log", &*buffer).await;
        buffer.clear();
    }
}

fn build_tickers(sched: &Schedule) -> (Interval, Interval, Interval) {
    let mk = |secs: u64| {
        let period = Duration::from_secs(secs.max(1));
        interval_at(Instant::now() + period, period)
    };
    (mk(sched.metrics), mk(sched.detail), mk(sched.system))
}

/// Drop excluded mounts (prefix match on a `/` boundary), excluded
/// filesystem types, duplicate devices (first occurrence wins), and
/// zero-sized pseudo filesystems.
pub fn filter_partitions(
    parts: Vec<Partition>,
    excluded_mounts: &[String],
    excluded_fs: &[String],
) -> Vec<Partition> {
    let mut seen_devices: Vec<String> = Vec::new();
    parts
        .into_iter()
        .filter(|p| {
            if p.total == 0 {
                return false;
            }
            if excluded_fs.iter().any(|fs| fs == &p.fs_type) {
                return false;
            }
            if excluded_mounts.iter().any(|prefix| {
                p.mount_point == *prefix
                    || p
                        .mount_point
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }) {
                return false;
            }
            if seen_devices.contains(&p.device) {
                return false;
            }
            seen_devices.push(p.device.clone());
            true
        })
        .collect()
}

/// Case-insensitive substring match of monitored service names against
/// the process table; sums CPU and memory share per service.
pub fn match_services(
    samples: &[ProcessSample],
    names: &[String],
    total_mem: u64,
) -> HashMap<String, ServiceStatusData> {
    let mut out = HashMap::new();
    for name in names {
        let needle = name.to_lowercase();
        let mut pids: Vec<u32> = Vec::new();
        let mut cpu = 0.0f64;
        let mut mem_bytes = 0u64;
        for sample in samples {
            if sample.name.to_lowercase().contains(&needle) {
                pids.push(sample.pid);
                cpu += sample.cpu_percent as f64;
                mem_bytes = mem_bytes.saturating_add(sample.mem_bytes);
            }
        }
        let memory = if total_mem == 0 {
            0.0
        } else {
            mem_bytes as f64 / total_mem as f64 * 100.0
        };
        out.insert(
            name.clone(),
            ServiceStatusData {
                running: !pids.is_empty(),
                pids,
                cpu,
                memory,
            },
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(device: &str, mount: &str, fs: &str, total: u64) -> Partition {
        Partition {
            device: device.into(),
            mount_point: mount.into(),
            fs_type: fs.into(),
            total,
            used: total / 2,
            free: total / 2,
            used_percent: 50.0,
        }
    }

    #[test]
    fn filter_excludes_mount_prefixes_on_boundary() {
        let parts = vec![
            part("sda1", "/", "ext4", 100),
            part("sda2", "/proc", "proc", 100),
            part("sda3", "/proc/sys", "proc2", 100),
            part("sda4", "/process-data", "ext4", 100),
        ];
        let kept = filter_partitions(parts, &["/proc".into()], &[]);
        let mounts: Vec<&str> = kept.iter().map(|p| p.mount_point.as_str()).collect();
        assert_eq!(mounts, vec!["/", "/process-data"]);
    }

    #[test]
    fn filter_excludes_fs_types_and_zero_total() {
        let parts = vec![
            part("sda1", "/", "ext4", 100),
            part("tmp", "/tmp", "tmpfs", 100),
            part("zero", "/zero", "ext4", 0),
        ];
        let kept = filter_partitions(parts, &[], &["tmpfs".into()]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].device, "sda1");
    }

    #[test]
    fn filter_dedupes_devices_first_occurrence_wins() {
        let parts = vec![
            part("sda1", "/", "ext4", 100),
            part("sda1", "/mnt/bind", "ext4", 100),
            part("sdb1", "/data", "ext4", 100),
        ];
        let kept = filter_partitions(parts, &[], &[]);
        let mounts: Vec<&str> = kept.iter().map(|p| p.mount_point.as_str()).collect();
        assert_eq!(mounts, vec!["/", "/data"]);
    }

    #[test]
    fn filter_is_idempotent() {
        let parts = vec![
            part("sda1", "/", "ext4", 100),
            part("sda1", "/bind", "ext4", 100),
            part("tmp", "/tmp", "tmpfs", 50),
        ];
        let excluded = vec!["tmpfs".to_string()];
        let once = filter_partitions(parts, &[], &excluded);
        let twice = filter_partitions(once.clone(), &[], &excluded);
        assert_eq!(once, twice);
    }

    #[test]
    fn service_matching_is_substring_and_case_insensitive() {
        let samples = vec![
            ProcessSample {
                pid: 10,
                name: "sshd".into(),
                cpu_percent: 1.5,
                mem_bytes: 100,
            },
            ProcessSample {
                pid: 11,
                name: "OpenSSH-agent".into(),
                cpu_percent: 0.5,
                mem_bytes: 100,
            },
            ProcessSample {
                pid: 12,
                name: "nginx".into(),
                cpu_percent: 3.0,
                mem_bytes: 200,
            },
        ];
        let out = match_services(&samples, &["ssh".into(), "mysql".into()], 1000);
        let ssh = &out["ssh"];
        assert!(ssh.running);
        assert_eq!(ssh.pids, vec![10, 11]);
        assert_eq!(ssh.cpu, 2.0);
        assert_eq!(ssh.memory, 20.0);
        let mysql = &out["mysql"];
        assert!(!mysql.running);
        assert!(mysql.pids.is_empty());
    }

    #[test]
    fn empty_service_list_yields_empty_result() {
        let out = match_services(&[], &[], 1000);
        assert!(out.is_empty());
    }

    #[test]
    fn metrics_payload_uses_panel_field_names() {
        let data = MetricsData {
            cpu_usage: 12.5,
            memory_total: 1000,
            memory_used: 500,
            memory_usage_percent: 50.0,
            disk_usage: 33.0,
            network_upload: 0.0,
            network_download: 0.0,
        };
        let v = serde_json::to_value(&data).unwrap();
        assert_eq!(v["cpu_usage"], 12.5);
        assert_eq!(v["memory_usage_percent"], 50.0);
        assert_eq!(v["network_upload"], 0.0);
        assert_eq!(v["network_download"], 0.0);
    }

    #[tokio::test]
    async fn log_channel_drops_on_full_without_blocking() {
        let (shipper, mut rx) = log_channel("UTC");
        for i in 0..150 {
            shipper.push("info", format!("entry {i}"));
        }
        rx.close();
        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 100);
    }

    #[test]
    fn unknown_timezone_falls_back_to_shanghai() {
        let (shipper, _rx) = log_channel("Not/AZone");
        assert_eq!(shipper.tz, chrono_tz::Asia::Shanghai);
    }
}
