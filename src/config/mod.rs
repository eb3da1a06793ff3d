// 配置管理模块
//
// 启动时读取一次：先加载 TOML 配置文件，再应用环境变量覆盖，
// 之后以 Arc<AppConfig> 形式只读传入各处理器

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 归档配置
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// 首页文件路径
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_index_path() -> PathBuf {
    PathBuf::from("index.html")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            index_path: default_index_path(),
        }
    }
}

/// 归档配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// 归档根目录，`/archive/{id}` 对应 `<root>/<id>`
    #[serde(default = "default_archive_root")]
    pub root: PathBuf,
    /// 压缩程序（需兼容 `zip -q -r - . -x ...` 参数）
    #[serde(default = "default_zip_program")]
    pub zip_program: String,
    /// 打包时排除的通配符
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
    /// 单次读取的最大块大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// 默认限速（KB/s），0 表示不限速
    #[serde(default)]
    pub throttle_kbps: f64,
    /// 限速下限（KB/s），请求中更小的正数限速会被提升到此值
    #[serde(default = "default_min_rate_kbps")]
    pub min_rate_kbps: f64,
    /// SIGTERM 之后等待进程退出的宽限期（毫秒）
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// 是否允许通过 `fault` 查询参数注入故障（仅测试环境开启）
    #[serde(default)]
    pub fault_injection: bool,
}

fn default_archive_root() -> PathBuf {
    PathBuf::from("archives")
}

fn default_zip_program() -> String {
    "zip".to_string()
}

/// 缓存、版本控制元数据、系统元数据文件
fn default_exclude() -> Vec<String> {
    [
        "*/__pycache__/*",
        "__pycache__/*",
        "*.pyc",
        "*/.git/*",
        ".git/*",
        "*/.svn/*",
        ".svn/*",
        "*/.hg/*",
        ".hg/*",
        "*.DS_Store",
        "*/__MACOSX/*",
        "__MACOSX/*",
        "*Thumbs.db",
        "*desktop.ini",
        "*/.cache/*",
        ".cache/*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_min_rate_kbps() -> f64 {
    16.0
}

fn default_grace_period_ms() -> u64 {
    1500
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root: default_archive_root(),
            zip_program: default_zip_program(),
            exclude: default_exclude(),
            chunk_size: default_chunk_size(),
            throttle_kbps: 0.0,
            min_rate_kbps: default_min_rate_kbps(),
            grace_period_ms: default_grace_period_ms(),
            fault_injection: false,
        }
    }
}

impl ArchiveConfig {
    /// 终止宽限期
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// 加载配置文件，失败时使用默认配置
    ///
    /// 与下载目录不同，归档根目录不会被自动创建：根目录不存在时所有请求都返回 404
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }

    /// 应用进程环境变量覆盖
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// 应用环境变量覆盖（`lookup` 便于测试时注入）
    ///
    /// 非法值记录警告后忽略，保留原配置
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("ARCHIVE_ROOT") {
            self.archive.root = PathBuf::from(root);
        }
        if let Some(rate) = parse_env::<f64>(&lookup, "ARCHIVE_THROTTLE_KBPS") {
            self.archive.throttle_kbps = rate;
        }
        if let Some(enabled) = parse_env_bool(&lookup, "ARCHIVE_FAULT_INJECTION") {
            self.archive.fault_injection = enabled;
        }
        if let Some(host) = lookup("ARCHIVE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = parse_env::<u16>(&lookup, "ARCHIVE_PORT") {
            self.server.port = port;
        }
        if let Some(enabled) = parse_env_bool(&lookup, "ARCHIVE_LOG_ENABLED") {
            self.log.enabled = enabled;
        }
        if let Some(level) = lookup("ARCHIVE_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(dir) = lookup("ARCHIVE_LOG_DIR") {
            self.log.log_dir = PathBuf::from(dir);
        }
    }

    /// 监听地址
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_env<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("环境变量 {} 的值无效，已忽略: {:?}", key, raw);
            None
        }
    }
}

fn parse_env_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => {
            tracing::warn!("环境变量 {} 的值无效，已忽略: {:?}", key, raw);
            None
        }
    }
}
