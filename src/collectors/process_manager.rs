use crate::collectors::run_command;
use crate::snapshot::ManagedProcess;
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct JlistEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    pid: Option<f64>,
    #[serde(default)]
    pm2_env: Option<JlistEnv>,
    #[serde(default)]
    monit: Option<JlistMonit>,
}

#[derive(Debug, Deserialize)]
struct JlistEnv {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    pm_uptime: Option<f64>,
    #[serde(default)]
    restart_time: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct JlistMonit {
    #[serde(default)]
    cpu: Option<f64>,
    #[serde(default)]
    memory: Option<f64>,
}

pub async fn list_processes(command: &str) -> Vec<ManagedProcess> {
    if !is_available(command).await {
        debug!(command, "менеджер процессов не найден");
        return Vec::new();
    }

    let stdout = match run_command(command, &["jlist"], false).await {
        Ok(stdout) => stdout,
        Err(err) => {
            warn!(command, error = %err, "не удалось получить список процессов менеджера");
            return Vec::new();
        }
    };

    match parse_jlist(&stdout, now_millis()) {
        Ok(processes) => processes,
        Err(err) => {
            warn!(command, error = %err, "не удалось разобрать вывод jlist");
            Vec::new()
        }
    }
}

pub async fn logs(command: &str, app: Option<&str>, lines: u32) -> String {
    let lines = lines.to_string();
    let mut args = vec!["logs"];
    if let Some(app) = app {
        args.push(app);
    }
    args.extend(["--lines", lines.as_str(), "--nostream"]);

    match run_command(command, &args, false).await {
        Ok(stdout) => stdout,
        Err(err) => {
            warn!(command, app, error = %err, "не удалось получить логи менеджера процессов");
            String::new()
        }
    }
}

async fn is_available(command: &str) -> bool {
    let locator = if cfg!(windows) { "where" } else { "which" };
    run_command(locator, &[command], false).await.is_ok()
}

// Banner lines may precede the array and may start with `[` as well.
pub fn parse_jlist(output: &str, now_ms: u64) -> Result<Vec<ManagedProcess>, serde_json::Error> {
    let mut first_err = None;
    let mut entries = None;
    for (start, _) in output.match_indices('[') {
        match serde_json::from_str::<Vec<JlistEntry>>(output[start..].trim()) {
            Ok(parsed) => {
                entries = Some(parsed);
                break;
            }
            Err(err) => {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
    }
    let entries = match (entries, first_err) {
        (Some(entries), _) => entries,
        (None, Some(err)) => return Err(err),
        (None, None) => serde_json::from_str::<Vec<JlistEntry>>(output.trim())?,
    };

    Ok(entries
        .into_iter()
        .map(|entry| {
            let env = entry.pm2_env;
            let monit = entry.monit;
            ManagedProcess {
                name: entry.name.unwrap_or_default(),
                pid: as_u64(entry.pid) as u32,
                status: env
                    .as_ref()
                    .and_then(|e| e.status.clone())
                    .unwrap_or_else(|| "unknown".to_string()),
                cpu: monit.as_ref().and_then(|m| m.cpu).unwrap_or(0.0),
                memory: as_u64(monit.as_ref().and_then(|m| m.memory)),
                uptime: uptime_since(as_u64(env.as_ref().and_then(|e| e.pm_uptime)), now_ms),
                restarts: as_u64(env.as_ref().and_then(|e| e.restart_time)) as u32,
            }
        })
        .collect())
}

fn as_u64(value: Option<f64>) -> u64 {
    value
        .filter(|v| v.is_finite() && *v > 0.0)
        .map(|v| v as u64)
        .unwrap_or(0)
}

pub fn uptime_since(start_ms: u64, now_ms: u64) -> String {
    if start_ms == 0 {
        return "0s".to_string();
    }
    format_uptime(Duration::from_millis(now_ms.saturating_sub(start_ms)))
}

pub fn format_uptime(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("{days}d {}h", hours % 24)
    } else if hours > 0 {
        format!("{hours}h {}m", minutes % 60)
    } else if minutes > 0 {
        format!("{minutes}m {}s", seconds % 60)
    } else {
        format!("{seconds}s")
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
