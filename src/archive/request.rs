// 归档请求与限速参数

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// 可注入的故障类别（测试用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// 在提交响应头之前模拟压缩进程失败，返回 500
    Producer,
    /// 传输中途返回可恢复的错误
    Error,
    /// 传输中途 panic（不可恢复的故障）
    Panic,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Producer => "producer",
            Self::Error => "error",
            Self::Panic => "panic",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaultKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "producer" => Ok(Self::Producer),
            "error" => Ok(Self::Error),
            "panic" => Ok(Self::Panic),
            other => Err(format!("未知的故障类别: {}", other)),
        }
    }
}

/// 传输限速（KB/s，1 KB = 1024 字节）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    kbps: f64,
}

impl RateLimit {
    /// 计算实际生效的限速
    ///
    /// - `requested` 存在且为有限数时覆盖 `default_kbps`
    /// - 结果 <= 0 表示不限速，返回 None
    /// - 低于 `min_kbps` 的正数限速提升到 `min_kbps`
    pub fn resolve(default_kbps: f64, requested: Option<f64>, min_kbps: f64) -> Option<Self> {
        let kbps = match requested {
            Some(rate) if rate.is_finite() => rate,
            _ => default_kbps,
        };

        if !kbps.is_finite() || kbps <= 0.0 {
            return None;
        }

        let floor = if min_kbps.is_finite() && min_kbps > 0.0 {
            min_kbps
        } else {
            0.0
        };

        Some(Self {
            kbps: kbps.max(floor),
        })
    }

    pub fn kbps(&self) -> f64 {
        self.kbps
    }

    /// 转发 `len` 字节前需要等待的时间：len / (rate * 1024) 秒
    pub fn delay_for(&self, len: usize) -> Duration {
        Duration::from_secs_f64(len as f64 / (self.kbps * 1024.0))
    }
}

/// 单次归档下载请求，解析完成后不再修改
#[derive(Debug, Clone)]
pub struct ArchiveRequest {
    /// 归档标识符
    pub id: String,
    /// 解析后的目录
    pub directory: PathBuf,
    /// 生效的限速
    pub rate_limit: Option<RateLimit>,
    /// 注入的故障
    pub fault: Option<FaultKind>,
}

impl ArchiveRequest {
    pub fn new(id: impl Into<String>, directory: PathBuf) -> Self {
        Self {
            id: id.into(),
            directory,
            rate_limit: None,
            fault: None,
        }
    }

    pub fn with_rate_limit(mut self, rate_limit: Option<RateLimit>) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_fault(mut self, fault: Option<FaultKind>) -> Self {
        self.fault = fault;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_resolution() {
        // 未配置默认值也未请求
        assert_eq!(RateLimit::resolve(0.0, None, 16.0), None);
        // 使用默认值
        assert_eq!(RateLimit::resolve(256.0, None, 16.0).unwrap().kbps(), 256.0);
        // 请求覆盖默认值
        assert_eq!(
            RateLimit::resolve(256.0, Some(64.0), 16.0).unwrap().kbps(),
            64.0
        );
        // 负数和零表示不限速，即使配置了默认值
        assert_eq!(RateLimit::resolve(256.0, Some(-5.0), 16.0), None);
        assert_eq!(RateLimit::resolve(256.0, Some(0.0), 16.0), None);
        // 非有限值被忽略
        assert_eq!(
            RateLimit::resolve(256.0, Some(f64::NAN), 16.0).unwrap().kbps(),
            256.0
        );
        // 过小的限速提升到下限
        assert_eq!(RateLimit::resolve(0.0, Some(0.01), 16.0).unwrap().kbps(), 16.0);
        // 下限为 0 时不做提升
        assert_eq!(RateLimit::resolve(0.0, Some(0.5), 0.0).unwrap().kbps(), 0.5);
    }

    #[test]
    fn test_delay_for_chunk() {
        let rate = RateLimit::resolve(64.0, None, 0.0).unwrap();
        // 64 KB 的块在 64 KB/s 下需要 1 秒
        assert_eq!(rate.delay_for(64 * 1024), Duration::from_secs(1));
        assert_eq!(rate.delay_for(0), Duration::ZERO);
    }

    #[test]
    fn test_fault_kind_parse() {
        assert_eq!("producer".parse::<FaultKind>(), Ok(FaultKind::Producer));
        assert_eq!(" Error ".parse::<FaultKind>(), Ok(FaultKind::Error));
        assert_eq!("PANIC".parse::<FaultKind>(), Ok(FaultKind::Panic));
        assert!("timeout".parse::<FaultKind>().is_err());
        assert_eq!(FaultKind::Panic.to_string(), "panic");
    }
}
