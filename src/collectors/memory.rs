use crate::collectors::{top_processes, ProcessOrder};
use crate::snapshot::{round2, MemorySnapshot};
use sysinfo::{System, SystemExt};

pub async fn sample() -> MemorySnapshot {
    let mut system = System::new();
    system.refresh_memory();
    let (total, free) = (system.total_memory(), system.free_memory());

    let mut snapshot = from_counters(total, free);
    snapshot.top_processes = top_processes(ProcessOrder::Memory).await;
    snapshot
}

fn from_counters(total: u64, free: u64) -> MemorySnapshot {
    let used = total.saturating_sub(free);
    let percentage = if total > 0 {
        round2(used as f64 / total as f64 * 100.0)
    } else {
        0.0
    };

    MemorySnapshot {
        total,
        used,
        free,
        percentage,
        top_processes: Vec::new(),
    }
}
