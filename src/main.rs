use photo_archive_rust::{
    build_router,
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    logging, AppState,
};
use tracing::info;

/// 等待关闭信号（Ctrl+C 或 SIGTERM）
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("监听 Ctrl+C 失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("监听 SIGTERM 失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到 Ctrl+C，开始优雅关闭..."),
        _ = terminate => info!("收到 SIGTERM，开始优雅关闭..."),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 配置只在启动时读取一次
    let mut config = AppConfig::load_or_default(DEFAULT_CONFIG_PATH).await;
    config.apply_env_overrides();

    // 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    info!("Photo Archive Rust v{} 启动中...", env!("CARGO_PKG_VERSION"));
    info!(
        "归档根目录: {:?}, 默认限速: {} KB/s, 终止宽限期: {} ms",
        config.archive.root, config.archive.throttle_kbps, config.archive.grace_period_ms
    );
    if !config.archive.root.is_dir() {
        tracing::warn!("归档根目录不存在，所有下载请求都将返回 404: {:?}", config.archive.root);
    }
    if config.archive.fault_injection {
        tracing::warn!("故障注入已开启，请勿在生产环境使用");
    }

    let addr = config.bind_addr();
    let app_state = AppState::new(config);
    let app = build_router(app_state.clone());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("服务器启动在: http://{}", addr);
    info!("归档下载: http://{}/archive/{{id}}", addr);

    // 收到关闭信号后先取消进行中的传输，它们会中断响应体，连接随之关闭
    let shutdown = app_state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await?;

    info!("正在等待进行中的传输完成清理...");
    app_state.shutdown().await;
    info!("应用已安全退出");

    Ok(())
}
