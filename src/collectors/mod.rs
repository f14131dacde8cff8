pub mod cpu;
pub mod disk;
pub mod memory;
pub mod process_manager;
pub mod units;

use crate::config::MonitorConfig;
use crate::snapshot::{round2, MetricKind, MetricSnapshot, ProcessInfo, ProcessManagerSnapshot};
use cpu::CpuSampler;
use std::path::PathBuf;
use std::process::ExitStatus;
use sysinfo::{System, SystemExt};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

pub const TOP_ENTRIES: usize = 20;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("не удалось запустить {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} завершился с кодом {status}")]
    Status { program: String, status: ExitStatus },
}

// allow_failure keeps the stdout of a non-zero exit.
pub async fn run_command(
    program: &str,
    args: &[&str],
    allow_failure: bool,
) -> Result<String, CommandError> {
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() && !allow_failure {
        return Err(CommandError::Status {
            program: program.to_string(),
            status: output.status,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub fn parse_process_table(output: &str) -> Vec<ProcessInfo> {
    output
        .trim()
        .lines()
        .skip(1)
        .take(TOP_ENTRIES)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 5 {
                return None;
            }
            Some(ProcessInfo {
                pid: parts[0].parse().unwrap_or(0),
                name: parts[1].to_string(),
                cpu_usage: parse_f64_or_zero(parts[2]),
                memory_usage: parse_f64_or_zero(parts[3]),
                command: parts[4..].join(" "),
            })
        })
        .collect()
}

fn parse_f64_or_zero(input: &str) -> f64 {
    input
        .trim()
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOrder {
    Cpu,
    Memory,
}

pub async fn top_processes(order: ProcessOrder) -> Vec<ProcessInfo> {
    if cfg!(windows) {
        return wmic_top_processes().await;
    }
    let Some(args) = ps_args(order) else {
        debug!(?order, "список процессов не поддерживается на этой платформе");
        return Vec::new();
    };

    match run_command("ps", &args, false).await {
        Ok(stdout) => parse_process_table(&stdout),
        Err(err) => {
            warn!(?order, error = %err, "не удалось получить список процессов");
            Vec::new()
        }
    }
}

// wmic has no CPU share per process, so both orders rank by working set.
async fn wmic_top_processes() -> Vec<ProcessInfo> {
    let args = [
        "process",
        "get",
        "ProcessId,Name,WorkingSetSize,CommandLine",
        "/format:csv",
    ];
    match run_command("wmic", &args, false).await {
        Ok(stdout) => {
            let mut system = System::new();
            system.refresh_memory();
            parse_wmic_process_csv(&stdout, system.total_memory())
        }
        Err(err) => {
            warn!(error = %err, "не удалось получить список процессов через wmic");
            Vec::new()
        }
    }
}

pub fn parse_wmic_process_csv(output: &str, total_memory: u64) -> Vec<ProcessInfo> {
    let mut lines = output.lines().map(str::trim).filter(|line| !line.is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let columns: Vec<&str> = header.split(',').collect();
    let position = |name: &str| columns.iter().position(|c| c.eq_ignore_ascii_case(name));
    let (Some(command_at), Some(name_at), Some(pid_at), Some(working_set_at)) = (
        position("CommandLine"),
        position("Name"),
        position("ProcessId"),
        position("WorkingSetSize"),
    ) else {
        return Vec::new();
    };

    let mut rows: Vec<ProcessInfo> = lines
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').collect();
            if parts.len() < columns.len() {
                return None;
            }
            // commas inside the command line shift every later column
            let extra = parts.len() - columns.len();
            let field = |at: usize| if at > command_at { parts[at + extra] } else { parts[at] };
            let working_set = field(working_set_at).trim().parse::<u64>().unwrap_or(0);
            let memory_usage = if total_memory > 0 {
                round2(working_set as f64 / total_memory as f64 * 100.0)
            } else {
                0.0
            };
            Some(ProcessInfo {
                pid: field(pid_at).trim().parse().unwrap_or(0),
                name: field(name_at).to_string(),
                memory_usage,
                cpu_usage: 0.0,
                command: parts[command_at..=command_at + extra].join(","),
            })
        })
        .collect();
    rows.sort_by(|a, b| b.memory_usage.total_cmp(&a.memory_usage));
    rows.truncate(TOP_ENTRIES);
    rows
}

#[cfg(target_os = "linux")]
fn ps_args(order: ProcessOrder) -> Option<Vec<&'static str>> {
    let sort = match order {
        ProcessOrder::Cpu => "--sort=-%cpu",
        ProcessOrder::Memory => "--sort=-%mem",
    };
    Some(vec!["-eo", "pid,comm,%cpu,%mem,args", sort])
}

#[cfg(target_os = "macos")]
fn ps_args(order: ProcessOrder) -> Option<Vec<&'static str>> {
    let sort = match order {
        ProcessOrder::Cpu => "-r",
        ProcessOrder::Memory => "-m",
    };
    Some(vec!["-eo", "pid,comm,%cpu,%mem,args", sort])
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn ps_args(_order: ProcessOrder) -> Option<Vec<&'static str>> {
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sampler {
    Memory,
    Cpu,
    Disk { mount: PathBuf, scan_top_folders: bool },
    ProcessManager { command: String },
}

impl Sampler {
    pub fn kind(&self) -> MetricKind {
        match self {
            Sampler::Memory => MetricKind::Memory,
            Sampler::Cpu => MetricKind::Cpu,
            Sampler::Disk { .. } => MetricKind::Disk,
            Sampler::ProcessManager { .. } => MetricKind::ProcessManager,
        }
    }

    pub fn plan(cfg: &MonitorConfig) -> Vec<Sampler> {
        let mut plan = Vec::new();
        if cfg.enable_memory {
            plan.push(Sampler::Memory);
        }
        if cfg.enable_cpu {
            plan.push(Sampler::Cpu);
        }
        if cfg.enable_disk {
            plan.extend(cfg.disk_paths.iter().map(|mount| Sampler::Disk {
                mount: mount.clone(),
                scan_top_folders: cfg.scan_top_folders,
            }));
        }
        if cfg.enable_process_manager {
            plan.push(Sampler::ProcessManager {
                command: cfg.process_manager_command.clone(),
            });
        }
        plan
    }

    pub fn for_kind(kind: MetricKind, cfg: &MonitorConfig) -> Sampler {
        match kind {
            MetricKind::Memory => Sampler::Memory,
            MetricKind::Cpu => Sampler::Cpu,
            MetricKind::Disk => Sampler::Disk {
                mount: cfg
                    .disk_paths
                    .first()
                    .cloned()
                    .unwrap_or_else(|| PathBuf::from("/")),
                scan_top_folders: cfg.scan_top_folders,
            },
            MetricKind::ProcessManager => Sampler::ProcessManager {
                command: cfg.process_manager_command.clone(),
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct Samplers {
    cpu: CpuSampler,
}

impl Samplers {
    pub async fn sample(&self, sampler: &Sampler) -> MetricSnapshot {
        match sampler {
            Sampler::Memory => MetricSnapshot::Memory(memory::sample().await),
            Sampler::Cpu => MetricSnapshot::Cpu(self.cpu.sample().await),
            Sampler::Disk {
                mount,
                scan_top_folders,
            } => MetricSnapshot::Disk(disk::sample(mount, *scan_top_folders).await),
            Sampler::ProcessManager { command } => {
                MetricSnapshot::ProcessManager(ProcessManagerSnapshot {
                    processes: process_manager::list_processes(command).await,
                })
            }
        }
    }
}
