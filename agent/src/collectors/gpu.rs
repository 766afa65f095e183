//! NVIDIA GPU sampling via `nvidia-smi`. A missing tool, a timeout, or a
//! failed run all mean "no GPUs here" rather than an error.

use serde::Serialize;
use std::time::Duration;
use tokio::process::Command;

const NVIDIA_SMI_TIMEOUT: Duration = Duration::from_secs(5);
const QUERY: &str =
    "--query-gpu=index,name,temperature.gpu,memory.used,memory.total,utilization.gpu,utilization.memory";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GpuInfo {
    pub index: i64,
    pub name: String,
    pub temperature: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub memory_util: f64,
    pub gpu_util: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuStats {
    pub available: bool,
    pub gpus: Vec<GpuInfo>,
}

impl GpuStats {
    fn unavailable() -> Self {
        Self {
            available: false,
            gpus: Vec::new(),
        }
    }
}

pub async fn collect_gpu_stats() -> GpuStats {
    let run = Command::new("nvidia-smi")
        .arg(QUERY)
        .arg("--format=csv,noheader,nounits")
        .kill_on_drop(true)
        .output();
    let output = match tokio::time::timeout(NVIDIA_SMI_TIMEOUT, run).await {
        Ok(Ok(out)) if out.status.success() => out,
        _ => return GpuStats::unavailable(),
    };

    let gpus = parse_csv(&String::from_utf8_lossy(&output.stdout));
    GpuStats {
        available: !gpus.is_empty(),
        gpus,
    }
}

/// Rows look like `0, NVIDIA GeForce RTX 3080, 54, 1024, 10240, 12, 3`.
/// Unparsable numeric fields degrade to zero; short rows are skipped.
fn parse_csv(output: &str) -> Vec<GpuInfo> {
    let mut gpus = Vec::new();
    for line in output.trim().lines() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 7 || line.trim().is_empty() {
            continue;
        }
        let Ok(index) = fields[0].parse::<i64>() else {
            continue;
        };
        gpus.push(GpuInfo {
            index,
            name: fields[1].to_string(),
            temperature: fields[2].parse().unwrap_or(0.0),
            memory_used: fields[3].parse().unwrap_or(0),
            memory_total: fields[4].parse().unwrap_or(0),
            gpu_util: fields[5].parse().unwrap_or(0.0),
            memory_util: fields[6].parse().unwrap_or(0.0),
        });
    }
    gpus
}
