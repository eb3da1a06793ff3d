// Photo Archive Rust Library
// 按需把目录打包为 ZIP 并通过 HTTP 流式下载

// 归档流水线
pub mod archive;

// 配置管理模块
pub mod config;

// 日志系统
pub mod logging;

// Web服务器模块
pub mod server;

// 导出常用类型
pub use archive::{
    ArchiveError, ArchiveRequest, ArchiveTransfer, DirectoryResolver, FaultKind, ProducerCommand,
    RateLimit, TransferOutcome,
};
pub use config::AppConfig;
pub use server::{build_router, AppState};
