//! Host utilisation figures carried by heartbeat events.

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use nix::sys::statvfs::statvfs;
use serde::Serialize;

/// Utilisation snapshot, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HostUsage {
    /// CPU busy time since the previous sample.
    pub cpu_usage_percent: f64,
    /// Memory in use.
    pub memory_usage_percent: f64,
    /// Disk usage of the projects filesystem.
    pub disk_usage_percent: f64,
}

#[derive(Debug, Clone, Copy)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

/// Samples `/proc` and the projects filesystem.
///
/// CPU usage is a delta between consecutive samples; the first sample
/// reports 0.
#[derive(Debug, Default)]
pub struct HostSampler {
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl HostSampler {
    /// Create a sampler with no CPU history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a sample. Unreadable sources report 0.
    pub fn sample(&self, disk: &Path) -> HostUsage {
        HostUsage {
            cpu_usage_percent: self.cpu_percent(),
            memory_usage_percent: fs::read_to_string("/proc/meminfo")
                .ok()
                .and_then(|text| memory_percent(&text))
                .unwrap_or(0.0),
            disk_usage_percent: disk_percent(disk).unwrap_or(0.0),
        }
    }

    fn cpu_percent(&self) -> f64 {
        let Some(now) = fs::read_to_string("/proc/stat")
            .ok()
            .and_then(|text| parse_cpu_times(&text))
        else {
            return 0.0;
        };
        let mut last = self.last_cpu.lock().unwrap_or_else(|p| p.into_inner());
        let percent = match *last {
            Some(prev) if now.total > prev.total => {
                let busy = now.busy.saturating_sub(prev.busy) as f64;
                round1(busy * 100.0 / (now.total - prev.total) as f64)
            }
            _ => 0.0,
        };
        *last = Some(now);
        percent
    }
}

/// Parse the aggregate `cpu` line of `/proc/stat`.
fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let total: u64 = fields.iter().sum();
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total - idle,
        total,
    })
}

/// Memory in use from `/proc/meminfo`, based on `MemAvailable`.
fn memory_percent(meminfo: &str) -> Option<f64> {
    let field = |name: &str| {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<u64>().ok())
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some(round1(
        total.saturating_sub(available) as f64 * 100.0 / total as f64,
    ))
}

fn disk_percent(path: &Path) -> Option<f64> {
    // The projects directory may not exist yet; fall back to its ancestors.
    let existing = path.ancestors().find(|p| p.exists())?;
    let stat = statvfs(existing).ok()?;
    let total = stat.blocks() as f64;
    if total == 0.0 {
        return None;
    }
    let used = total - stat.blocks_free() as f64;
    let usable = used + stat.blocks_available() as f64;
    Some(round1(used * 100.0 / usable))
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_times() {
        let stat = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 1 2 3 4\n";
        let times = parse_cpu_times(stat).unwrap();
        assert_eq!(times.total, 1000);
        assert_eq!(times.busy, 150);
    }

    #[test]
    fn test_memory_percent() {
        let meminfo = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        assert_eq!(memory_percent(meminfo), Some(75.0));
        assert_eq!(memory_percent("MemTotal: 10 kB\n"), None);
    }

    #[test]
    fn test_first_cpu_sample_is_zero() {
        let sampler = HostSampler::new();
        assert_eq!(sampler.cpu_percent(), 0.0);
    }

    #[test]
    fn test_disk_percent_missing_dir_uses_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let usage = disk_percent(&dir.path().join("not/created/yet"));
        assert!(usage.is_some_and(|u| (0.0..=100.0).contains(&u)));
    }
}
