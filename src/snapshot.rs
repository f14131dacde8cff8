use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Memory,
    Cpu,
    Disk,
    ProcessManager,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::Memory,
        MetricKind::Cpu,
        MetricKind::Disk,
        MetricKind::ProcessManager,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Memory => "memory",
            MetricKind::Cpu => "cpu",
            MetricKind::Disk => "disk",
            MetricKind::ProcessManager => "processmanager",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMetricKind(pub String);

impl fmt::Display for UnknownMetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let known: Vec<&str> = MetricKind::ALL.iter().map(|k| k.as_str()).collect();
        write!(
            f,
            "неизвестный тип метрики '{}', ожидается один из: {}",
            self.0,
            known.join(", ")
        )
    }
}

impl std::error::Error for UnknownMetricKind {}

impl FromStr for MetricKind {
    type Err = UnknownMetricKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(MetricKind::Memory),
            "cpu" => Ok(MetricKind::Cpu),
            "disk" => Ok(MetricKind::Disk),
            "processmanager" => Ok(MetricKind::ProcessManager),
            _ => Err(UnknownMetricKind(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub memory_usage: f64,
    pub cpu_usage: f64,
    pub command: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percentage: f64,
    pub top_processes: Vec<ProcessInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub percentage: f64,
    pub load_average: LoadAverage,
    pub top_processes: Vec<ProcessInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FolderInfo {
    pub path: String,
    pub size: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskSnapshot {
    pub mount: String,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percentage: f64,
    pub top_folders: Vec<FolderInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagedProcess {
    pub name: String,
    pub pid: u32,
    pub status: String,
    pub cpu: f64,
    pub memory: u64,
    pub uptime: String,
    pub restarts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessManagerSnapshot {
    pub processes: Vec<ManagedProcess>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum MetricSnapshot {
    Memory(MemorySnapshot),
    Cpu(CpuSnapshot),
    Disk(DiskSnapshot),
    ProcessManager(ProcessManagerSnapshot),
}

impl MetricSnapshot {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricSnapshot::Memory(_) => MetricKind::Memory,
            MetricSnapshot::Cpu(_) => MetricKind::Cpu,
            MetricSnapshot::Disk(_) => MetricKind::Disk,
            MetricSnapshot::ProcessManager(_) => MetricKind::ProcessManager,
        }
    }

    pub fn payload_json(&self) -> Result<String, serde_json::Error> {
        match self {
            MetricSnapshot::Memory(s) => serde_json::to_string(s),
            MetricSnapshot::Cpu(s) => serde_json::to_string(s),
            MetricSnapshot::Disk(s) => serde_json::to_string(s),
            MetricSnapshot::ProcessManager(s) => serde_json::to_string(s),
        }
    }

    pub fn from_payload(kind: MetricKind, payload: &str) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            MetricKind::Memory => MetricSnapshot::Memory(serde_json::from_str(payload)?),
            MetricKind::Cpu => MetricSnapshot::Cpu(serde_json::from_str(payload)?),
            MetricKind::Disk => MetricSnapshot::Disk(serde_json::from_str(payload)?),
            MetricKind::ProcessManager => {
                MetricSnapshot::ProcessManager(serde_json::from_str(payload)?)
            }
        })
    }
}

pub fn round2(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_match_stored_names() {
        let tags: Vec<&str> = MetricKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(tags, vec!["memory", "cpu", "disk", "processmanager"]);
        assert_eq!("ProcessManager".parse::<MetricKind>(), Ok(MetricKind::ProcessManager));
        assert!("pm2".parse::<MetricKind>().is_err());
    }

    #[test]
    fn payload_decodes_back_into_same_variant() {
        let snapshot = MetricSnapshot::ProcessManager(ProcessManagerSnapshot {
            processes: vec![ManagedProcess {
                name: "api".to_string(),
                pid: 42,
                status: "online".to_string(),
                cpu: 1.5,
                memory: 1024,
                uptime: "2m 30s".to_string(),
                restarts: 1,
            }],
        });
        let payload = snapshot.payload_json().expect("сериализация");
        assert!(payload.starts_with('['), "список процессов хранится как массив: {payload}");

        let back = MetricSnapshot::from_payload(MetricKind::ProcessManager, &payload)
            .expect("разбор payload");
        assert_eq!(back, snapshot);
    }

    #[test]
    fn round2_handles_non_finite() {
        assert_eq!(round2(66.666), 66.67);
        assert_eq!(round2(f64::NAN), 0.0);
        assert_eq!(round2(f64::INFINITY), 0.0);
    }
}
