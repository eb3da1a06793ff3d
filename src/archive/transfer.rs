//! 单次归档传输
//!
//! 分两个阶段：
//! - `start`：启动压缩进程并读出第一块数据，此时响应头还没有提交，
//!   失败可以作为普通的错误响应返回；
//! - `run`：在后台任务中转发剩余数据。
//!
//! 两个阶段的每条退出路径都经过同一个收尾步骤（终止进程、结束响应、记录结果）。
//! 取消和故障在收尾之后重新抛给调用方，panic 会继续展开。

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use axum::body::Body;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::{ArchiveError, ArchiveResult};
use super::producer::ProducerCommand;
use super::relay::{response_channel, StreamRelay};
use super::report::{TransferOutcome, TransferReport};
use super::request::ArchiveRequest;

/// 传输参数
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// 单次读取的最大块大小
    pub chunk_size: usize,
    /// 终止宽限期
    pub grace_period: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            grace_period: Duration::from_millis(1500),
        }
    }
}

/// 已提交响应头、等待转发的传输
pub struct ArchiveTransfer {
    transfer_id: Uuid,
    request: ArchiveRequest,
    relay: StreamRelay,
    started: Instant,
}

impl ArchiveTransfer {
    /// 启动压缩进程并读取第一块数据
    ///
    /// 成功时返回传输句柄和响应体；失败时进程已终止、结果已记录
    pub async fn start(
        request: ArchiveRequest,
        command: &ProducerCommand,
        options: &TransferOptions,
        cancel: CancellationToken,
    ) -> ArchiveResult<(Self, Body)> {
        let transfer_id = Uuid::new_v4();
        let started = Instant::now();

        let process = match command.spawn(&request.directory, options.grace_period) {
            Ok(process) => process,
            Err(e) => {
                Self::report(transfer_id, &request, 0, started, TransferOutcome::from_error(&e));
                return Err(e);
            }
        };

        let (sink, body) = response_channel();
        let mut relay = StreamRelay::new(process, sink, options.chunk_size, cancel)
            .with_rate_limit(request.rate_limit)
            .with_fault(request.fault);

        tracing::debug!(
            "开始归档传输: transfer_id={}, archive_id={}, 限速={:?}",
            transfer_id,
            request.id,
            request.rate_limit.map(|r| r.kbps())
        );

        // 读取第一块期间 handler 可能被丢弃，此时由 Drop 记录结果
        let pending = PendingReport::new(transfer_id, &request.id, started);
        let primed = relay.prime().await;
        pending.disarm();

        if let Err(e) = primed {
            relay.close(false).await;
            Self::report(
                transfer_id,
                &request,
                relay.state().bytes_sent,
                started,
                TransferOutcome::from_error(&e),
            );
            return Err(e);
        }

        Ok((
            Self {
                transfer_id,
                request,
                relay,
                started,
            },
            body,
        ))
    }

    pub fn transfer_id(&self) -> Uuid {
        self.transfer_id
    }

    pub fn request(&self) -> &ArchiveRequest {
        &self.request
    }

    /// 压缩进程 pid
    pub fn producer_pid(&self) -> Option<u32> {
        self.relay.process().pid()
    }

    /// 转发剩余数据
    ///
    /// 成功和客户端断开返回 Ok；压缩失败、取消和故障在清理之后以 Err 返回
    pub async fn run(self) -> ArchiveResult<TransferOutcome> {
        let Self {
            transfer_id,
            request,
            mut relay,
            started,
        } = self;

        let pumped = AssertUnwindSafe(relay.pump()).catch_unwind().await;

        let outcome = match &pumped {
            Ok(Ok(outcome)) => outcome.clone(),
            Ok(Err(e)) => TransferOutcome::from_error(e),
            Err(panic) => TransferOutcome::Fault(panic_message(panic.as_ref())),
        };

        relay.close(outcome.is_clean()).await;
        Self::report(
            transfer_id,
            &request,
            relay.state().bytes_sent,
            started,
            outcome,
        );

        match pumped {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    fn report(
        transfer_id: Uuid,
        request: &ArchiveRequest,
        bytes_sent: u64,
        started: Instant,
        outcome: TransferOutcome,
    ) {
        TransferReport {
            transfer_id,
            archive_id: request.id.clone(),
            bytes_sent,
            elapsed: started.elapsed(),
            outcome,
        }
        .emit();
    }
}

/// 提交响应头之前的传输记录
///
/// 客户端在第一块数据读出之前断开时，hyper 直接丢弃 handler 的 future，
/// `start` 里的收尾代码不会执行。进程由 `ArchiveProcess` 的 Drop 终止，
/// 结果由这里记录为客户端断开
struct PendingReport {
    transfer_id: Uuid,
    archive_id: String,
    started: Instant,
    armed: bool,
}

impl PendingReport {
    fn new(transfer_id: Uuid, archive_id: &str, started: Instant) -> Self {
        Self {
            transfer_id,
            archive_id: archive_id.to_string(),
            started,
            armed: true,
        }
    }

    /// `prime` 已返回，后续结果由调用方记录
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingReport {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        TransferReport {
            transfer_id: self.transfer_id,
            archive_id: std::mem::take(&mut self.archive_id),
            bytes_sent: 0,
            elapsed: self.started.elapsed(),
            outcome: TransferOutcome::ClientDisconnect,
        }
        .emit();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}
