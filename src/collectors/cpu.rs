use crate::collectors::{top_processes, ProcessOrder};
use crate::snapshot::{round2, CpuSnapshot, LoadAverage};
use std::sync::Mutex;
use sysinfo::{System, SystemExt};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

#[derive(Debug, Default)]
pub struct CpuSampler {
    previous: Mutex<Option<CpuTimes>>,
}

impl CpuSampler {
    pub async fn sample(&self) -> CpuSnapshot {
        let percentage = match read_cpu_times() {
            Some(current) => self.usage_since_previous(current),
            None => {
                debug!("счётчики CPU недоступны на этой платформе");
                0.0
            }
        };

        CpuSnapshot {
            percentage,
            load_average: load_average(),
            top_processes: top_processes(ProcessOrder::Cpu).await,
        }
    }

    pub fn usage_since_previous(&self, current: CpuTimes) -> f64 {
        let mut previous = match self.previous.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let usage = match previous.replace(current) {
            Some(prev) => usage_between(prev, current),
            None => 0.0,
        };
        round2(usage)
    }
}

fn usage_between(prev: CpuTimes, current: CpuTimes) -> f64 {
    let total_delta = current.total.saturating_sub(prev.total);
    if total_delta == 0 {
        return 0.0;
    }
    let idle_delta = current.idle.saturating_sub(prev.idle);
    let usage = 100.0 - 100.0 * idle_delta as f64 / total_delta as f64;
    usage.clamp(0.0, 100.0)
}

fn load_average() -> LoadAverage {
    let load = System::new().load_average();
    LoadAverage {
        one: load.one,
        five: load.five,
        fifteen: load.fifteen,
    }
}

#[cfg(target_os = "linux")]
fn read_cpu_times() -> Option<CpuTimes> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    parse_proc_stat(&stat)
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_times() -> Option<CpuTimes> {
    None
}

// guest time is already counted in user
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_stat(stat: &str) -> Option<CpuTimes> {
    let mut times = CpuTimes::default();
    let mut cores = 0;

    for line in stat.lines() {
        let mut fields = line.split_whitespace();
        let Some(label) = fields.next() else {
            continue;
        };
        let is_core = label
            .strip_prefix("cpu")
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
        if !is_core {
            continue;
        }

        let ticks: Vec<u64> = fields
            .take(8)
            .map(|v| v.parse::<u64>().unwrap_or(0))
            .collect();
        if ticks.len() < 4 {
            continue;
        }
        times.idle += ticks[3];
        times.total += ticks.iter().sum::<u64>();
        cores += 1;
    }

    (cores > 0).then_some(times)
}
