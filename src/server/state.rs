// 应用状态

use crate::archive::{DirectoryResolver, ProducerCommand, TransferOptions};
use crate::config::AppConfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// 应用全局状态
///
/// 配置在启动时读取一次，之后只读；各请求之间不共享可变状态
#[derive(Clone)]
pub struct AppState {
    /// 应用配置
    pub config: Arc<AppConfig>,
    /// 归档目录解析器
    pub resolver: DirectoryResolver,
    /// 压缩程序命令行
    pub producer: Arc<ProducerCommand>,
    /// 服务关闭信号，所有进行中的传输都会收到
    pub shutdown: CancellationToken,
    /// 进行中的转发任务
    pub tasks: TaskTracker,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(config: AppConfig) -> Self {
        let producer = ProducerCommand::from_config(&config.archive);
        Self::with_producer(config, producer)
    }

    /// 使用指定的压缩程序命令行
    pub fn with_producer(config: AppConfig, producer: ProducerCommand) -> Self {
        Self {
            resolver: DirectoryResolver::new(config.archive.root.clone()),
            producer: Arc::new(producer),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// 传输参数
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            chunk_size: self.config.archive.chunk_size,
            grace_period: self.config.archive.grace_period(),
        }
    }

    /// 取消所有进行中的传输，并等待它们完成清理
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}
