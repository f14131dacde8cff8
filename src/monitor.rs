use crate::collectors::{process_manager, Sampler, Samplers};
use crate::config::{ConfigError, ConfigPatch, MonitorConfig};
use crate::events::{EventBus, MonitorEvent};
use crate::snapshot::{MetricKind, MetricSnapshot};
use crate::store::{RecordQuery, Store, StoreError, StoredRecord};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub snapshots: Vec<MetricSnapshot>,
    pub trimmed: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub timestamp: String,
    pub snapshot: MetricSnapshot,
}

impl TryFrom<StoredRecord> for HistoryEntry {
    type Error = StoreError;

    fn try_from(record: StoredRecord) -> Result<Self, Self::Error> {
        Ok(HistoryEntry {
            snapshot: record.snapshot()?,
            id: record.id,
            timestamp: record.timestamp,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatestMetrics {
    pub memory: Option<HistoryEntry>,
    pub cpu: Option<HistoryEntry>,
    pub disk: Option<HistoryEntry>,
    pub processmanager: Option<HistoryEntry>,
}

#[derive(Debug)]
struct Ticker {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Debug)]
enum Lifecycle {
    Created,
    Initialized,
    Starting,
    Running(Ticker),
    Stopped,
}

#[derive(Debug)]
struct Inner {
    config: RwLock<MonitorConfig>,
    samplers: Samplers,
    store: Store,
    events: EventBus,
    state: Mutex<Lifecycle>,
    transition: tokio::sync::Mutex<()>,
    cycle: tokio::sync::Mutex<()>,
}

#[derive(Debug, Clone)]
pub struct Monitor {
    inner: Arc<Inner>,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                samplers: Samplers::default(),
                store: Store::new(),
                events: EventBus::new(),
                state: Mutex::new(Lifecycle::Created),
                transition: tokio::sync::Mutex::new(()),
                cycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            &*self.lifecycle(),
            Lifecycle::Starting | Lifecycle::Running(_)
        )
    }

    pub async fn config(&self) -> MonitorConfig {
        self.inner.config.read().await.clone()
    }

    pub async fn initialize(&self) -> Result<(), MonitorError> {
        let _transition = self.inner.transition.lock().await;
        self.initialize_locked().await
    }

    pub async fn start(&self) -> Result<(), MonitorError> {
        let _transition = self.inner.transition.lock().await;
        self.start_locked().await
    }

    pub async fn stop(&self) {
        let _transition = self.inner.transition.lock().await;
        self.stop_locked();
    }

    pub async fn update_config(&self, patch: ConfigPatch) -> Result<MonitorConfig, MonitorError> {
        let _transition = self.inner.transition.lock().await;
        let next = self.inner.config.read().await.apply(patch)?;
        *self.inner.config.write().await = next.clone();
        info!(interval_ms = next.interval_ms, "конфигурация мониторинга обновлена");

        if self.is_running() {
            self.stop_locked();
            self.start_locked().await?;
        }
        Ok(next)
    }

    pub async fn collect_now(&self) -> Result<CycleReport, MonitorError> {
        let result = self.run_cycle().await;
        if let Err(err) = &result {
            self.inner.events.publish(MonitorEvent::Error(err.to_string()));
        }
        result
    }

    pub async fn current(&self, kind: MetricKind) -> MetricSnapshot {
        let sampler = Sampler::for_kind(kind, &*self.inner.config.read().await);
        self.inner.samplers.sample(&sampler).await
    }

    pub async fn history(
        &self,
        kind: MetricKind,
        limit: Option<usize>,
        from: Option<SystemTime>,
        to: Option<SystemTime>,
    ) -> Result<Vec<HistoryEntry>, MonitorError> {
        let records = self
            .inner
            .store
            .query(RecordQuery {
                kind: Some(kind),
                limit,
                from,
                to,
            })
            .await?;
        records
            .into_iter()
            .map(|record| HistoryEntry::try_from(record).map_err(MonitorError::from))
            .collect()
    }

    pub async fn latest(&self) -> Result<LatestMetrics, MonitorError> {
        Ok(LatestMetrics {
            memory: self.latest_of(MetricKind::Memory).await?,
            cpu: self.latest_of(MetricKind::Cpu).await?,
            disk: self.latest_of(MetricKind::Disk).await?,
            processmanager: self.latest_of(MetricKind::ProcessManager).await?,
        })
    }

    pub async fn process_manager_logs(&self, app: Option<&str>, lines: u32) -> String {
        let command = self.inner.config.read().await.process_manager_command.clone();
        process_manager::logs(&command, app, lines).await
    }

    async fn latest_of(&self, kind: MetricKind) -> Result<Option<HistoryEntry>, MonitorError> {
        match self.inner.store.latest(kind).await? {
            Some(record) => Ok(Some(HistoryEntry::try_from(record)?)),
            None => Ok(None),
        }
    }

    async fn initialize_locked(&self) -> Result<(), MonitorError> {
        {
            let state = self.lifecycle();
            match &*state {
                Lifecycle::Starting | Lifecycle::Running(_) => return Ok(()),
                _ => {}
            }
        }

        let location = self.inner.config.read().await.store_location.clone();
        match self.inner.store.open(&location).await {
            Ok(()) => {
                *self.lifecycle() = Lifecycle::Initialized;
                info!(store = %location.display(), "мониторинг инициализирован");
                self.inner.events.publish(MonitorEvent::Initialized);
                Ok(())
            }
            Err(err) => {
                error!(store = %location.display(), error = %err, "не удалось открыть хранилище метрик");
                self.inner.events.publish(MonitorEvent::Error(err.to_string()));
                Err(err.into())
            }
        }
    }

    async fn start_locked(&self) -> Result<(), MonitorError> {
        let needs_init = match &*self.lifecycle() {
            Lifecycle::Starting | Lifecycle::Running(_) => return Ok(()),
            Lifecycle::Initialized => !self.inner.store.is_open(),
            Lifecycle::Created | Lifecycle::Stopped => true,
        };
        if needs_init {
            self.initialize_locked().await?;
        }

        *self.lifecycle() = Lifecycle::Starting;
        let interval_ms = self.inner.config.read().await.interval_ms;
        info!(interval_ms, "сбор метрик запущен");
        self.inner.events.publish(MonitorEvent::Started);

        self.tick().await;

        let period = Duration::from_millis(interval_ms.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_ticker(Arc::downgrade(&self.inner), period, shutdown_rx));
        *self.lifecycle() = Lifecycle::Running(Ticker { shutdown, task });
        Ok(())
    }

    fn stop_locked(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle(), Lifecycle::Stopped);
        match previous {
            Lifecycle::Running(ticker) => {
                let _ = ticker.shutdown.send(true);
                drop(ticker.task);
                self.inner.store.close();
                info!("сбор метрик остановлен");
                self.inner.events.publish(MonitorEvent::Stopped);
            }
            Lifecycle::Starting => {
                self.inner.store.close();
                self.inner.events.publish(MonitorEvent::Stopped);
            }
            Lifecycle::Created => {
                self.inner.store.close();
                *self.lifecycle() = Lifecycle::Created;
            }
            Lifecycle::Initialized | Lifecycle::Stopped => {
                self.inner.store.close();
            }
        }
    }

    async fn tick(&self) {
        match self.collect_now().await {
            Ok(report) => debug!(
                snapshots = report.snapshots.len(),
                trimmed = ?report.trimmed,
                "цикл сбора метрик завершён"
            ),
            Err(err) => warn!(error = %err, "цикл сбора метрик завершился с ошибкой"),
        }
    }

    async fn run_cycle(&self) -> Result<CycleReport, MonitorError> {
        let _in_flight = self.inner.cycle.lock().await;
        let cfg = self.inner.config.read().await.clone();

        let mut snapshots = Vec::new();
        for sampler in Sampler::plan(&cfg) {
            let kind = sampler.kind();
            let snapshot = self.inner.samplers.sample(&sampler).await;
            if let MetricSnapshot::ProcessManager(pm) = &snapshot {
                if pm.processes.is_empty() {
                    debug!(%kind, "менеджер процессов не вернул процессов, запись пропущена");
                    continue;
                }
            }
            debug!(%kind, "метрики сняты");
            self.inner.store.insert(&snapshot).await?;
            self.inner.events.publish(MonitorEvent::Metrics(snapshot.clone()));
            snapshots.push(snapshot);
        }

        let trimmed = match cfg.max_records {
            Some(cap) => match self.enforce_retention(cap, cfg.interval_ms).await {
                Ok(trimmed) => trimmed,
                Err(err) => {
                    warn!(cap, error = %err, "не удалось применить политику хранения метрик");
                    self.inner.events.publish(MonitorEvent::Error(err.to_string()));
                    None
                }
            },
            None => None,
        };

        self.inner
            .events
            .publish(MonitorEvent::MetricsCollected(snapshots.clone()));
        Ok(CycleReport { snapshots, trimmed })
    }

    async fn enforce_retention(&self, cap: u64, interval_ms: u64) -> Result<Option<usize>, StoreError> {
        let count = self.inner.store.count(None).await?;
        if count <= cap {
            return Ok(None);
        }
        let days = retention_days(cap, interval_ms);
        let deleted = self.inner.store.delete_older_than(days).await?;
        info!(count, cap, days, deleted, "применена политика хранения метрик");
        Ok(Some(deleted))
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub fn retention_days(cap: u64, interval_ms: u64) -> u64 {
    let records_per_day = MS_PER_DAY as f64 / interval_ms.max(1) as f64;
    ((cap as f64 / records_per_day).floor() as u64).max(1)
}

async fn run_ticker(inner: Weak<Inner>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("получен сигнал остановки цикла сбора");
                break;
            }
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                Monitor { inner }.tick().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::MemorySnapshot;
    use std::path::PathBuf;
    use tokio::sync::broadcast::error::TryRecvError;

    fn memory_only() -> MonitorConfig {
        MonitorConfig {
            interval_ms: 60_000,
            store_location: PathBuf::from(":memory:"),
            enable_memory: true,
            enable_cpu: false,
            enable_disk: false,
            enable_process_manager: false,
            max_records: None,
            disk_paths: vec![PathBuf::from("/")],
            process_manager_command: "pm2".to_string(),
            scan_top_folders: false,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<MonitorEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => names.push(event.name()),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
        names
    }

    fn filler() -> MetricSnapshot {
        MetricSnapshot::Memory(MemorySnapshot::default())
    }

    #[test]
    fn retention_days_follows_collection_rate() {
        // one record per minute, 1440 per day
        assert_eq!(retention_days(10_000, 60_000), 6);
        assert_eq!(retention_days(1_440, 60_000), 1);
        assert_eq!(retention_days(14_400, 60_000), 10);
        // fast collection would round down to zero days
        assert_eq!(retention_days(10_000, 1_000), 1);
        assert_eq!(retention_days(10, 0), 1);
    }

    #[tokio::test]
    async fn start_twice_runs_one_cycle_and_arms_one_timer() {
        let monitor = Monitor::new(memory_only());
        let mut rx = monitor.subscribe();

        monitor.start().await.expect("запуск");
        monitor.start().await.expect("повторный запуск");
        assert!(monitor.is_running());

        assert_eq!(
            drain(&mut rx),
            vec!["initialized", "started", "memory_metrics", "metrics_collected"]
        );
        assert_eq!(monitor.inner.store.count(None).await.expect("count"), 1);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn stop_before_start_is_a_silent_noop() {
        let monitor = Monitor::new(memory_only());
        let mut rx = monitor.subscribe();

        monitor.stop().await;
        monitor.stop().await;

        assert!(!monitor.is_running());
        assert!(!monitor.inner.store.is_open());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn stop_closes_store_even_without_start() {
        let monitor = Monitor::new(memory_only());
        monitor.initialize().await.expect("инициализация");
        assert!(monitor.inner.store.is_open());

        monitor.stop().await;
        assert!(!monitor.inner.store.is_open());
    }

    #[tokio::test]
    async fn stop_after_start_publishes_and_closes() {
        let monitor = Monitor::new(memory_only());
        monitor.start().await.expect("запуск");
        let mut rx = monitor.subscribe();

        monitor.stop().await;
        assert!(!monitor.is_running());
        assert!(!monitor.inner.store.is_open());
        assert_eq!(drain(&mut rx), vec!["stopped"]);
    }

    #[tokio::test]
    async fn start_after_stop_reopens_store() {
        let monitor = Monitor::new(memory_only());
        monitor.start().await.expect("запуск");
        monitor.stop().await;

        let mut rx = monitor.subscribe();
        monitor.start().await.expect("повторный запуск");
        assert!(monitor.is_running());
        assert!(monitor.inner.store.is_open());
        assert_eq!(drain(&mut rx)[..2], ["initialized", "started"]);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn initialize_failure_is_returned_and_published() {
        let dir = tempfile::tempdir().expect("временный каталог");
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").expect("файл");

        let mut cfg = memory_only();
        cfg.store_location = blocker.join("metrics.db");
        let monitor = Monitor::new(cfg);
        let mut rx = monitor.subscribe();

        let err = monitor.initialize().await.expect_err("родитель не каталог");
        assert!(matches!(err, MonitorError::Store(StoreError::CreateDir { .. })));
        assert_eq!(drain(&mut rx), vec!["error"]);

        assert!(monitor.start().await.is_err());
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn retention_triggers_above_cap() {
        let mut cfg = memory_only();
        cfg.max_records = Some(10_000);
        let monitor = Monitor::new(cfg);
        monitor.initialize().await.expect("инициализация");

        for _ in 0..15_000 {
            monitor.inner.store.insert(&filler()).await.expect("вставка");
        }
        let report = monitor.collect_now().await.expect("цикл");
        // all records are fresh, nothing is old enough to go
        assert_eq!(report.trimmed, Some(0));
    }

    #[tokio::test]
    async fn retention_skipped_below_cap() {
        let mut cfg = memory_only();
        cfg.max_records = Some(10_000);
        let monitor = Monitor::new(cfg);
        monitor.initialize().await.expect("инициализация");

        for _ in 0..5_000 {
            monitor.inner.store.insert(&filler()).await.expect("вставка");
        }
        let report = monitor.collect_now().await.expect("цикл");
        assert_eq!(report.trimmed, None);
        assert_eq!(monitor.inner.store.count(None).await.expect("count"), 5_001);
    }

    #[tokio::test]
    async fn retention_deletes_records_older_than_kept_days() {
        let mut cfg = memory_only();
        cfg.max_records = Some(10);
        let monitor = Monitor::new(cfg);
        monitor.initialize().await.expect("инициализация");

        let three_days_ago = SystemTime::now() - Duration::from_secs(3 * 86_400);
        for _ in 0..20 {
            monitor
                .inner
                .store
                .insert_at(&filler(), three_days_ago)
                .await
                .expect("вставка");
        }
        let report = monitor.collect_now().await.expect("цикл");
        assert_eq!(report.trimmed, Some(20));
        assert_eq!(monitor.inner.store.count(None).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn retention_failure_still_reports_collected_metrics() {
        let dir = tempfile::tempdir().expect("временный каталог");
        let location = dir.path().join("metrics.db");
        let mut cfg = memory_only();
        cfg.store_location = location.clone();
        cfg.max_records = Some(10);
        let monitor = Monitor::new(cfg);
        monitor.initialize().await.expect("инициализация");

        let three_days_ago = SystemTime::now() - Duration::from_secs(3 * 86_400);
        for _ in 0..20 {
            monitor
                .inner
                .store
                .insert_at(&filler(), three_days_ago)
                .await
                .expect("вставка");
        }
        let other = rusqlite::Connection::open(&location).expect("второе соединение");
        other
            .execute_batch(
                "CREATE TRIGGER block_delete BEFORE DELETE ON metrics
                 BEGIN SELECT RAISE(ABORT, 'удаление запрещено'); END;",
            )
            .expect("триггер");
        drop(other);

        let mut rx = monitor.subscribe();
        let report = monitor.collect_now().await.expect("цикл без ошибки");
        assert_eq!(report.snapshots.len(), 1);
        assert_eq!(report.trimmed, None);
        assert_eq!(
            drain(&mut rx),
            vec!["memory_metrics", "error", "metrics_collected"]
        );
        assert_eq!(monitor.inner.store.count(None).await.expect("count"), 21);
    }

    #[tokio::test]
    async fn initialize_again_reopens_and_notifies() {
        let dir = tempfile::tempdir().expect("временный каталог");
        let mut cfg = memory_only();
        cfg.store_location = dir.path().join("metrics.db");
        let monitor = Monitor::new(cfg);
        let mut rx = monitor.subscribe();

        monitor.initialize().await.expect("инициализация");
        monitor.collect_now().await.expect("цикл");
        monitor.initialize().await.expect("повторная инициализация");

        assert!(monitor.inner.store.is_open());
        assert_eq!(monitor.inner.store.count(None).await.expect("count"), 1);
        let names = drain(&mut rx);
        assert_eq!(names.iter().filter(|n| **n == "initialized").count(), 2);
        assert_eq!(names.last(), Some(&"initialized"));
    }

    #[tokio::test]
    async fn cycle_on_closed_store_reports_error() {
        let monitor = Monitor::new(memory_only());
        monitor.initialize().await.expect("инициализация");
        monitor.stop().await;
        let mut rx = monitor.subscribe();

        let err = monitor.collect_now().await.expect_err("хранилище закрыто");
        assert!(matches!(err, MonitorError::Store(StoreError::NotInitialized)));
        assert_eq!(drain(&mut rx), vec!["error"]);
    }

    #[tokio::test]
    async fn empty_process_manager_list_is_not_persisted() {
        let mut cfg = memory_only();
        cfg.enable_memory = false;
        cfg.enable_process_manager = true;
        cfg.process_manager_command = "hostmon-missing-process-manager".to_string();
        let monitor = Monitor::new(cfg);
        monitor.initialize().await.expect("инициализация");
        let mut rx = monitor.subscribe();

        let report = monitor.collect_now().await.expect("цикл");
        assert!(report.snapshots.is_empty());
        assert_eq!(drain(&mut rx), vec!["metrics_collected"]);
        assert_eq!(monitor.inner.store.count(None).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn memory_and_disk_only_emit_their_events() {
        let dir = tempfile::tempdir().expect("временный каталог");
        let mut cfg = memory_only();
        cfg.interval_ms = 100;
        cfg.enable_disk = true;
        cfg.disk_paths = vec![dir.path().to_path_buf()];
        let monitor = Monitor::new(cfg);
        let mut rx = monitor.subscribe();

        monitor.start().await.expect("запуск");

        let mut names = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("событие до таймаута")
                .expect("канал открыт");
            let name = event.name();
            names.push(name);
            if name == "metrics_collected" {
                break;
            }
        }
        monitor.stop().await;

        let count = |wanted: &str| names.iter().filter(|n| **n == wanted).count();
        assert_eq!(count("memory_metrics"), 1);
        assert_eq!(count("disk_metrics"), 1);
        assert_eq!(count("cpu_metrics"), 0);
        assert_eq!(count("processmanager_metrics"), 0);
    }

    #[tokio::test]
    async fn timer_keeps_collecting() {
        let mut cfg = memory_only();
        cfg.interval_ms = 50;
        let monitor = Monitor::new(cfg);
        let mut rx = monitor.subscribe();
        monitor.start().await.expect("запуск");

        let mut cycles = 0;
        while cycles < 3 {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("событие до таймаута")
                .expect("канал открыт");
            if event.name() == "metrics_collected" {
                cycles += 1;
            }
        }
        monitor.stop().await;
        assert!(monitor.inner.store.count(None).await.is_err());
    }

    #[tokio::test]
    async fn update_config_restarts_running_monitor() {
        let monitor = Monitor::new(memory_only());
        monitor.start().await.expect("запуск");
        let mut rx = monitor.subscribe();

        let next = monitor
            .update_config(ConfigPatch {
                interval_ms: Some(30_000),
                ..ConfigPatch::default()
            })
            .await
            .expect("обновление");
        assert_eq!(next.interval_ms, 30_000);
        assert_eq!(monitor.config().await.interval_ms, 30_000);
        assert!(monitor.is_running());

        let names = drain(&mut rx);
        assert_eq!(names[..3], ["stopped", "initialized", "started"]);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn invalid_update_keeps_previous_config() {
        let monitor = Monitor::new(memory_only());
        let err = monitor
            .update_config(ConfigPatch {
                interval_ms: Some(0),
                ..ConfigPatch::default()
            })
            .await;
        assert!(matches!(err, Err(MonitorError::Config(_))));
        assert_eq!(monitor.config().await.interval_ms, 60_000);
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn history_and_latest_decode_snapshots() {
        let monitor = Monitor::new(memory_only());
        monitor.initialize().await.expect("инициализация");
        let empty = monitor.latest().await.expect("latest");
        assert_eq!(empty, LatestMetrics::default());

        monitor.collect_now().await.expect("цикл");
        monitor.collect_now().await.expect("цикл");

        let history = monitor
            .history(MetricKind::Memory, Some(1), None, None)
            .await
            .expect("история");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].snapshot.kind(), MetricKind::Memory);

        let latest = monitor.latest().await.expect("latest");
        assert_eq!(latest.memory.map(|e| e.id), Some(history[0].id));
        assert!(latest.cpu.is_none());
    }
}
