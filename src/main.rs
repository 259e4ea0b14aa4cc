mod collectors;
mod config;
mod http;
mod metrics;
mod snapshot;

use axum::http::HeaderValue;
use axum::serve;
use clap::Parser;
use collectors::gpu::GpuCapability;
use collectors::SnapshotAssembler;
use config::Config;
use metrics::Metrics;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hostpulse")]
#[command(version)]
struct Cli {
    /// YAML config; built-in defaults are used when omitted.
    #[arg(long)]
    config: Option<String>,
    /// Overrides `listen` from the config file.
    #[arg(long, env = "HOSTPULSE_LISTEN")]
    listen: Option<String>,
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

    let mut cfg = match &cli.config {
        Some(path) => match Config::load_from_file(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                error!(error = %err, "не удалось загрузить конфигурацию");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
    }
    if let Err(err) = cfg.validate() {
        error!(error = %err, "некорректная конфигурация");
        std::process::exit(1);
    }

    let addr = match cfg.listen_addr() {
        Ok(addr) => addr,
        Err(err) => {
            error!(error = %err, listen = %cfg.listen, "некорректный адрес listen");
            std::process::exit(1);
        }
    };
    let cors_allow_origin = match HeaderValue::from_str(&cfg.cors_allow_origin) {
        Ok(v) => v,
        Err(err) => {
            error!(error = %err, "некорректное значение cors_allow_origin");
            std::process::exit(1);
        }
    };

    info!(
        listen = %cfg.listen,
        network_window = %humantime::format_duration(cfg.network_window),
        cpu_window = %humantime::format_duration(cfg.cpu_window),
        root_mount = %cfg.root_mount,
        "запуск hostpulse"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let gpu = GpuCapability::probe(&cfg.gpu);
    let assembler = Arc::new(SnapshotAssembler::from_config(&cfg, gpu));
    info!(
        gpu_available = assembler.gpu_capability().is_available(),
        "сборщик снимков готов"
    );

    let app = http::build_router(
        http::HttpAppState {
            assembler,
            metrics,
        },
        cors_allow_origin,
    );

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(err) => {
            error!(error = %err, listen = %addr, "не удалось запустить HTTP-сервер");
            std::process::exit(1);
        }
    };

    let server = serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        error!(error = %err, "ошибка HTTP-сервера");
        std::process::exit(1);
    }

    info!("hostpulse остановлен");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "не удалось дождаться Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "не удалось подписаться на SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("получен сигнал остановки, завершение работы");
}
