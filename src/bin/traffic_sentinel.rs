/// 多路车流计数服务 (Traffic Sentinel)
///
/// 系统架构:
/// 1. 解码线程: 每路视频一个 ffmpeg 解码线程 (按需逐帧)
/// 2. 调度线程: 依次读帧、检测、发布每路计数
/// 3. 控制接口: tokio + axum,只读计数表与状态标志
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use traffic_sentinel::{
    control, ffmpeg_source_factory, Args, ControlSurface, DetectionSettings, MonitorConfig,
    StreamSupervisor, YOLOv8Detector, YOLOv8Options,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "traffic_sentinel=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = MonitorConfig::from_args(&args).context("invalid configuration")?;
    tracing::info!("🚦 Traffic Sentinel v{}", env!("CARGO_PKG_VERSION"));
    config.log_summary();

    let detector = YOLOv8Detector::load(
        &config.model,
        YOLOv8Options {
            inf_size: config.inf_size,
            cuda: config.cuda,
            ..Default::default()
        },
    )?;

    let supervisor = Arc::new(StreamSupervisor::new(
        config.feeds(),
        ffmpeg_source_factory(&config),
        Box::new(detector),
        DetectionSettings {
            min_confidence: config.min_confidence,
            allowed_labels: config.labels.clone(),
        },
        config.cycle_interval(),
    ));

    if config.autostart {
        let sup = supervisor.clone();
        tokio::task::spawn_blocking(move || sup.start())
            .await
            .context("autostart task panicked")?
            .context("autostart failed")?;
    }

    let control_surface = Arc::new(ControlSurface::new(
        supervisor.clone(),
        config.stop_timeout(),
    ));
    let app = control::router(control_surface);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(addr = %config.bind, "🌐 控制接口已就绪");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control server failed")?;

    // 退出前停止调度线程
    let sup = supervisor.clone();
    let timeout = config.stop_timeout();
    let stopped = tokio::task::spawn_blocking(move || {
        let _ = sup.stop();
        sup.wait_idle(timeout)
    })
    .await
    .unwrap_or(false);
    if !stopped {
        tracing::warn!("⚠️ 调度线程未在超时内退出");
    }
    tracing::info!("👋 已退出");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "无法监听 Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("收到退出信号");
}
