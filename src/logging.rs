//! 日志系统配置
//!
//! 控制台输出，加上可选的按天滚动的文件输出，启动时清理过期日志

use crate::config::LogConfig;
use chrono::Local;
use std::fs;
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀，完整文件名为 `archive-server.YYYY-MM-DD.log`
const LOG_FILE_PREFIX: &str = "archive-server";
const LOG_FILE_SUFFIX: &str = "log";

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// `RUST_LOG` 优先于配置中的日志级别
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    // 控制台输出层
    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_ansi(true);

    if !config.enabled {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    }

    let appender = fs::create_dir_all(&config.log_dir)
        .map_err(|e| e.to_string())
        .and_then(|_| {
            RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_FILE_PREFIX)
                .filename_suffix(LOG_FILE_SUFFIX)
                .build(&config.log_dir)
                .map_err(|e| e.to_string())
        });

    let appender = match appender {
        Ok(appender) => appender,
        Err(e) => {
            eprintln!(
                "创建日志文件失败: {:?}, 错误: {}，回退到仅控制台输出",
                config.log_dir, e
            );
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .init();
            return LogGuard { _file_guard: None };
        }
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(appender);

    // 文件输出层（不带 ANSI 颜色）
    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}",
        config.log_dir, config.retention_days, config.level
    );

    cleanup_old_logs(&config.log_dir, config.retention_days);

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 清理过期日志文件
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) {
    let today = Local::now().date_naive();
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return;
        }
    };

    let mut deleted_count = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(filename) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(date) = extract_date_from_filename(filename) else {
            continue;
        };

        if is_expired(date, today, retention_days) {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e);
            } else {
                deleted_count += 1;
                tracing::debug!("已删除过期日志文件: {:?}", path);
            }
        }
    }

    if deleted_count > 0 {
        info!("已清理 {} 个过期日志文件", deleted_count);
    }
}

/// 从 `archive-server.YYYY-MM-DD.log` 中提取日期
fn extract_date_from_filename(filename: &str) -> Option<chrono::NaiveDate> {
    let name = filename.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
    let date = name.strip_suffix(LOG_FILE_SUFFIX)?.strip_suffix('.')?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn is_expired(date: chrono::NaiveDate, today: chrono::NaiveDate, retention_days: u32) -> bool {
    today.signed_duration_since(date) > chrono::Duration::days(retention_days as i64)
}
