// 传输结果分类与记录

use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use super::error::ArchiveError;

/// 一次传输的最终结果，每条退出路径恰好对应一种
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// 完整的归档已发送
    Success,
    /// 客户端中途断开，不算错误
    ClientDisconnect,
    /// 压缩程序失败（非零退出码或注入的故障）
    ProducerFailure {
        code: Option<i32>,
        diagnostic: String,
    },
    /// 服务端取消了请求
    Cancelled,
    /// 其他意外故障
    Fault(String),
}

impl TransferOutcome {
    pub fn from_error(err: &ArchiveError) -> Self {
        match err {
            ArchiveError::ProducerFailure { code, diagnostic } => Self::ProducerFailure {
                code: *code,
                diagnostic: diagnostic.clone(),
            },
            ArchiveError::Cancelled => Self::Cancelled,
            other => Self::Fault(other.to_string()),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ClientDisconnect => "client_disconnect",
            Self::ProducerFailure { .. } => "producer_failure",
            Self::Cancelled => "cancelled",
            Self::Fault(_) => "fault",
        }
    }

    /// 是否应作为失败记录
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::ProducerFailure { .. } | Self::Fault(_))
    }

    /// 响应能否正常结束（否则中断响应体）
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Success | Self::ClientDisconnect)
    }
}

/// 传输报告
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub transfer_id: Uuid,
    pub archive_id: String,
    pub bytes_sent: u64,
    pub elapsed: Duration,
    pub outcome: TransferOutcome,
}

impl TransferReport {
    /// 输出一条结构化日志
    pub fn emit(&self) {
        let transfer_id = self.transfer_id.to_string();
        let elapsed_ms = self.elapsed.as_millis() as u64;
        let outcome = self.outcome.label();

        match &self.outcome {
            TransferOutcome::Success => info!(
                transfer_id = %transfer_id,
                archive_id = %self.archive_id,
                bytes_sent = self.bytes_sent,
                elapsed_ms,
                outcome,
                "归档传输完成"
            ),
            TransferOutcome::ClientDisconnect => info!(
                transfer_id = %transfer_id,
                archive_id = %self.archive_id,
                bytes_sent = self.bytes_sent,
                elapsed_ms,
                outcome,
                "客户端已断开，停止传输"
            ),
            TransferOutcome::Cancelled => warn!(
                transfer_id = %transfer_id,
                archive_id = %self.archive_id,
                bytes_sent = self.bytes_sent,
                elapsed_ms,
                outcome,
                "归档传输被取消"
            ),
            TransferOutcome::ProducerFailure { code, diagnostic } => error!(
                transfer_id = %transfer_id,
                archive_id = %self.archive_id,
                bytes_sent = self.bytes_sent,
                elapsed_ms,
                outcome,
                exit_code = ?code,
                diagnostic = %diagnostic,
                "压缩进程失败"
            ),
            TransferOutcome::Fault(message) => error!(
                transfer_id = %transfer_id,
                archive_id = %self.archive_id,
                bytes_sent = self.bytes_sent,
                elapsed_ms,
                outcome,
                error = %message,
                "归档传输异常终止"
            ),
        }
    }
}
