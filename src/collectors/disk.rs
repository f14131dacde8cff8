use crate::collectors::units::parse_size;
use crate::collectors::{run_command, TOP_ENTRIES};
use crate::snapshot::{round2, DiskSnapshot, FolderInfo};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskSpace {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

pub async fn sample(mount: &Path, scan_top_folders: bool) -> DiskSnapshot {
    let mount_str = mount.to_string_lossy().to_string();
    let space = query_space(&mount_str).await.unwrap_or_default();
    let top_folders = if scan_top_folders {
        top_folders(&mount_str).await
    } else {
        Vec::new()
    };

    DiskSnapshot {
        percentage: usage_percentage(&space),
        mount: mount_str,
        total: space.total,
        used: space.used,
        free: space.free,
        top_folders,
    }
}

fn usage_percentage(space: &DiskSpace) -> f64 {
    if space.total == 0 {
        return 0.0;
    }
    round2(space.used as f64 / space.total as f64 * 100.0)
}

#[cfg(unix)]
async fn query_space(mount: &str) -> Option<DiskSpace> {
    // GNU df reports exact bytes; BSD df has no -B, so use KiB there.
    #[cfg(target_os = "linux")]
    let (args, block_size) = (["-P", "-B1", mount], 1);
    #[cfg(not(target_os = "linux"))]
    let (args, block_size) = (["-P", "-k", mount], 1024);

    let stdout = match run_command("df", &args, false).await {
        Ok(stdout) => stdout,
        Err(err) => {
            warn!(mount, error = %err, "не удалось получить занятость диска");
            return None;
        }
    };
    let space = parse_df_output(&stdout, block_size);
    if space.is_none() {
        warn!(mount, output = %stdout.trim(), "неожиданный формат вывода df");
    }
    space
}

#[cfg(windows)]
async fn query_space(mount: &str) -> Option<DiskSpace> {
    let caption = windows_caption(mount);
    let filter = format!("caption=\"{caption}\"");
    let args = ["logicaldisk", "where", filter.as_str(), "get", "size,freespace", "/value"];
    match run_command("wmic", &args, false).await {
        Ok(stdout) => parse_wmic_logicaldisk(&stdout),
        Err(err) => {
            warn!(mount, error = %err, "не удалось получить занятость диска");
            None
        }
    }
}

#[cfg(not(any(unix, windows)))]
async fn query_space(mount: &str) -> Option<DiskSpace> {
    tracing::debug!(mount, "занятость диска не поддерживается на этой платформе");
    None
}

#[cfg(windows)]
fn windows_caption(mount: &str) -> String {
    let drive: String = mount.chars().take_while(|c| *c != ':').collect();
    if mount.contains(':') && !drive.is_empty() {
        format!("{}:", drive.to_ascii_uppercase())
    } else {
        "C:".to_string()
    }
}

pub fn parse_df_output(output: &str, block_size: u64) -> Option<DiskSpace> {
    let line = output.lines().rev().find(|l| !l.trim().is_empty())?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }
    let column = |i: usize| -> Option<u64> {
        parts[i]
            .parse::<u64>()
            .ok()
            .map(|v| v.saturating_mul(block_size))
    };

    Some(DiskSpace {
        total: column(1)?,
        used: column(2)?,
        free: column(3)?,
    })
}

#[cfg_attr(not(windows), allow(dead_code))]
pub fn parse_wmic_logicaldisk(output: &str) -> Option<DiskSpace> {
    let mut total = None;
    let mut free = None;
    for line in output.lines().map(str::trim) {
        if let Some(v) = line.strip_prefix("FreeSpace=") {
            free = v.trim().parse::<u64>().ok();
        } else if let Some(v) = line.strip_prefix("Size=") {
            total = v.trim().parse::<u64>().ok();
        }
    }
    let (total, free) = (total?, free.unwrap_or(0));
    Some(DiskSpace {
        total,
        used: total.saturating_sub(free),
        free,
    })
}

#[cfg(unix)]
async fn top_folders(mount: &str) -> Vec<FolderInfo> {
    // du exits non-zero when some directories are unreadable; its output is
    // still usable.
    match run_command("du", &["-x", "-h", "-d", "1", mount], true).await {
        Ok(stdout) => parse_du_output(&stdout, mount),
        Err(err) => {
            warn!(mount, error = %err, "не удалось получить размеры каталогов");
            Vec::new()
        }
    }
}

#[cfg(not(unix))]
async fn top_folders(mount: &str) -> Vec<FolderInfo> {
    tracing::debug!(mount, "размеры каталогов не поддерживаются на этой платформе");
    Vec::new()
}

pub fn parse_du_output(output: &str, mount: &str) -> Vec<FolderInfo> {
    let root = normalize_path(mount);
    let mut entries: Vec<(String, u64)> = output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let split = line.find(char::is_whitespace)?;
            let (size, path) = line.split_at(split);
            let path = path.trim();
            if path.is_empty() || normalize_path(path) == root {
                return None;
            }
            Some((path.to_string(), parse_size(size)))
        })
        .collect();

    entries.sort_by(|a, b| b.1.cmp(&a.1));
    entries.truncate(TOP_ENTRIES);

    let scanned: u64 = entries.iter().map(|(_, size)| size).sum();
    entries
        .into_iter()
        .map(|(path, size)| FolderInfo {
            percentage: if scanned > 0 {
                round2(size as f64 / scanned as f64 * 100.0)
            } else {
                0.0
            },
            path,
            size,
        })
        .collect()
}

fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/"
    } else {
        trimmed
    }
}
