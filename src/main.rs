mod collectors;
mod config;
mod events;
mod http;
mod monitor;
mod snapshot;
mod store;

use axum::serve;
use clap::Parser;
use config::Config;
use events::MonitorEvent;
use monitor::Monitor;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hostmon")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    info!(
        listen = %cfg.listen,
        interval_ms = cfg.monitor.interval_ms,
        store = %cfg.monitor.store_location.display(),
        "запуск hostmon"
    );

    let monitor = Monitor::new(cfg.monitor.clone());
    let event_task = tokio::spawn(log_events(monitor.subscribe()));

    if let Err(err) = monitor.initialize().await {
        error!(error = %err, "не удалось инициализировать мониторинг");
        std::process::exit(1);
    }
    if let Err(err) = monitor.start().await {
        error!(error = %err, "не удалось запустить сбор метрик");
        std::process::exit(1);
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let http_task = {
        let monitor = monitor.clone();
        let listen = cfg.listen.clone();
        tokio::spawn(async move {
            let app = http::build_router(monitor);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);
    monitor.stop().await;

    let _ = http_task.await;
    event_task.abort();
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn log_events(mut events: broadcast::Receiver<MonitorEvent>) {
    loop {
        match events.recv().await {
            Ok(MonitorEvent::Error(cause)) => warn!(cause = %cause, "ошибка мониторинга"),
            Ok(MonitorEvent::MetricsCollected(snapshots)) => {
                info!(snapshots = snapshots.len(), "метрики собраны")
            }
            Ok(MonitorEvent::Metrics(snapshot)) => {
                debug!(kind = %snapshot.kind(), "снимок сохранён")
            }
            Ok(event) => info!(event = event.name(), "событие мониторинга"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "обработчик событий отстал")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
