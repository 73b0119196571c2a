//! Host CPU and RAM telemetry from the proc filesystem.
//!
//! CPU usage is computed from the delta between the previous and current
//! aggregate `cpu` line of `{proc_path}/stat`; RAM usage is
//! `MemTotal - MemAvailable` from `{proc_path}/meminfo`.

use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::fs;

/// Aggregate CPU counters from the `cpu` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub total: u64,
    pub idle: u64,
}

/// Wire shape of `/api/v1/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsResponse {
    pub cpu_percent: f64,
    pub cpu_percent_str: String,
    pub ram_percent: f64,
    pub ram_percent_str: String,
    pub idle: u64,
    pub total: u64,
}

/// Metrics reader with the previous CPU sample kept across requests.
pub struct MetricsService {
    proc_path: String,
    prev: Mutex<Option<CpuTimes>>,
}

impl MetricsService {
    pub fn new(proc_path: &str) -> Self {
        Self {
            proc_path: proc_path.trim_end_matches('/').to_string(),
            prev: Mutex::new(None),
        }
    }

    /// Read both gauges and format the response.
    pub async fn fetch(&self) -> Result<MetricsResponse> {
        let stat = fs::read_to_string(format!("{}/stat", self.proc_path))
            .await
            .context("reading proc stat")?;
        let meminfo = fs::read_to_string(format!("{}/meminfo", self.proc_path))
            .await
            .context("reading proc meminfo")?;

        let current = parse_cpu_times(&stat)?;
        let prev = {
            let mut guard = self.prev.lock().expect("metrics mutex poisoned");
            guard.replace(current)
        };
        let cpu = cpu_percent(prev, current);
        let ram = parse_ram_percent(&meminfo);

        Ok(MetricsResponse {
            cpu_percent: cpu,
            cpu_percent_str: format!("{cpu:.2}%"),
            ram_percent: ram,
            ram_percent_str: format!("{ram:.2}%"),
            idle: current.idle,
            total: current.total,
        })
    }
}

/// Parse the aggregate `cpu` line. Field 4 (1-indexed after the label) is
/// idle time.
pub fn parse_cpu_times(stat: &str) -> Result<CpuTimes> {
    let line = stat
        .lines()
        .find(|l| l.starts_with("cpu "))
        .context("missing cpu line in proc stat")?;
    let mut total = 0u64;
    let mut idle = 0u64;
    for (i, field) in line.split_whitespace().skip(1).enumerate() {
        let value: u64 = field.parse().unwrap_or(0);
        total += value;
        if i == 3 {
            idle = value;
        }
    }
    Ok(CpuTimes { total, idle })
}

/// Usage percentage over the sample delta. Without a previous sample the
/// since-boot averages are used.
pub fn cpu_percent(prev: Option<CpuTimes>, current: CpuTimes) -> f64 {
    let prev = prev.unwrap_or(CpuTimes { total: 0, idle: 0 });
    let delta_total = current.total.saturating_sub(prev.total);
    let delta_idle = current.idle.saturating_sub(prev.idle);
    if delta_total == 0 {
        return 0.0;
    }
    (delta_total - delta_idle) as f64 / delta_total as f64 * 100.0
}

/// RAM usage as `(MemTotal - MemAvailable) / MemTotal`.
pub fn parse_ram_percent(meminfo: &str) -> f64 {
    let mut total = 0u64;
    let mut available = 0u64;
    for line in meminfo.lines() {
        let mut fields = line.split_whitespace();
        let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };
        let value: u64 = value.parse().unwrap_or(0);
        match key.trim_end_matches(':') {
            "MemTotal" => total = value,
            "MemAvailable" => available = value,
            _ => {}
        }
    }
    if total == 0 {
        return 0.0;
    }
    (total - available) as f64 / total as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "cpu  100 0 100 700 50 0 50 0 0 0\ncpu0 50 0 50 350 25 0 25 0 0 0\n";
    const MEMINFO: &str = "MemTotal:       16384000 kB\nMemFree:         2048000 kB\nMemAvailable:   12288000 kB\nBuffers:          512000 kB\n";

    #[test]
    fn parses_cpu_line() {
        let times = parse_cpu_times(STAT).unwrap();
        assert_eq!(times.total, 1000);
        assert_eq!(times.idle, 700);
    }

    #[test]
    fn missing_cpu_line_errors() {
        assert!(parse_cpu_times("intr 12345\n").is_err());
    }

    #[test]
    fn cpu_percent_over_delta() {
        let prev = CpuTimes {
            total: 1000,
            idle: 700,
        };
        let current = CpuTimes {
            total: 2000,
            idle: 1400,
        };
        // 1000 total delta, 700 idle delta -> 30% busy.
        assert!((cpu_percent(Some(prev), current) - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cpu_percent_without_delta_is_zero() {
        let sample = CpuTimes {
            total: 1000,
            idle: 700,
        };
        assert_eq!(cpu_percent(Some(sample), sample), 0.0);
    }

    #[test]
    fn ram_percent_uses_mem_available() {
        // (16384000 - 12288000) / 16384000 = 25%
        assert!((parse_ram_percent(MEMINFO) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn ram_percent_zero_on_empty_input() {
        assert_eq!(parse_ram_percent(""), 0.0);
    }

    #[tokio::test]
    async fn fetch_reads_proc_files() {
        let dir = std::env::temp_dir().join("wsgate-agent-metrics-test");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("stat"), STAT).unwrap();
        std::fs::write(dir.join("meminfo"), MEMINFO).unwrap();

        let svc = MetricsService::new(dir.to_str().unwrap());
        let resp = svc.fetch().await.unwrap();
        assert_eq!(resp.total, 1000);
        assert_eq!(resp.idle, 700);
        assert!(resp.cpu_percent_str.ends_with('%'));
        assert!((resp.ram_percent - 25.0).abs() < 1e-9);
    }
}
