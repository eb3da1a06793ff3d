// 归档流水线
//
// 请求 -> 目录解析 -> 启动压缩进程 -> 转发数据 -> 终止进程 -> 记录结果

pub mod error;
pub mod lifecycle;
pub mod producer;
pub mod relay;
pub mod report;
pub mod request;
pub mod resolver;
pub mod transfer;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{ArchiveError, ArchiveResult};
pub use lifecycle::ProcessState;
pub use producer::{ArchiveProcess, ProducerCommand};
pub use relay::{response_channel, ResponseSink, StreamRelay, TransferState};
pub use report::{TransferOutcome, TransferReport};
pub use request::{ArchiveRequest, FaultKind, RateLimit};
pub use resolver::DirectoryResolver;
pub use transfer::{ArchiveTransfer, TransferOptions};
