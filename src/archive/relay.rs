//! 数据转发
//!
//! 从压缩进程读取数据块（默认 64 KB），按限速等待后写入 HTTP 响应体。
//! 响应体是一个容量为 1 的通道：客户端读得慢时写入会挂起，
//! 读取随之暂停，压缩进程最终阻塞在管道上，由此形成背压。

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::Poll;

use axum::body::{Body, Bytes};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::{ArchiveError, ArchiveResult};
use super::producer::ArchiveProcess;
use super::report::TransferOutcome;
use super::request::{FaultKind, RateLimit};

/// 创建响应体及其写入端
pub fn response_channel() -> (ResponseSink, Body) {
    let (tx, mut rx) = mpsc::channel::<Bytes>(1);
    let (abort_tx, abort_rx) = oneshot::channel::<io::Error>();
    let mut abort_rx = Some(abort_rx);

    let stream = futures::stream::poll_fn(move |cx| {
        // 中断信号优先于尚未读取的数据
        if let Some(pending) = abort_rx.as_mut() {
            match Pin::new(pending).poll(cx) {
                Poll::Ready(Ok(err)) => {
                    abort_rx = None;
                    rx.close();
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(Err(_)) => abort_rx = None,
                Poll::Pending => {}
            }
        }
        rx.poll_recv(cx).map(|chunk| chunk.map(Ok::<Bytes, io::Error>))
    });

    let sink = ResponseSink {
        tx: Some(tx),
        abort: Some(abort_tx),
    };
    (sink, Body::from_stream(stream))
}

/// 响应体写入端
///
/// `finish` 正常结束响应（客户端收到完整的分块结束标记），
/// `abort` 让响应体以错误结束，连接被中断，客户端看到的是不完整的下载。
/// 两者都可以重复调用。
#[derive(Debug)]
pub struct ResponseSink {
    tx: Option<mpsc::Sender<Bytes>>,
    abort: Option<oneshot::Sender<io::Error>>,
}

impl ResponseSink {
    /// 客户端是否已断开（响应体已被丢弃）
    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }

    /// 等待客户端断开
    pub async fn closed(&self) {
        match self.tx.as_ref() {
            Some(tx) => tx.closed().await,
            None => {}
        }
    }

    /// 写入一块数据，客户端已断开时返回 false
    pub async fn send(&self, chunk: Bytes) -> bool {
        match self.tx.as_ref() {
            Some(tx) => tx.send(chunk).await.is_ok(),
            None => false,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.tx.is_none()
    }

    /// 正常结束响应
    pub fn finish(&mut self) {
        self.abort.take();
        self.tx.take();
    }

    /// 以错误结束响应
    pub fn abort(&mut self, reason: &str) {
        if let Some(abort) = self.abort.take() {
            let _ = abort.send(io::Error::new(io::ErrorKind::Other, reason.to_string()));
        }
        self.tx.take();
    }
}

/// 传输状态，只由转发循环和进程终止逻辑修改
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferState {
    /// 已写入响应的字节数
    pub bytes_sent: u64,
    /// 响应是否已结束
    pub finalized: bool,
    /// 压缩进程是否已终止
    pub producer_stopped: bool,
}

/// 转发循环
pub struct StreamRelay {
    process: ArchiveProcess,
    sink: ResponseSink,
    rate_limit: Option<RateLimit>,
    chunk_size: usize,
    fault: Option<FaultKind>,
    cancel: CancellationToken,
    state: TransferState,
    /// 提交响应头之前读出的第一块数据
    pending: Option<Bytes>,
}

impl StreamRelay {
    pub fn new(
        process: ArchiveProcess,
        sink: ResponseSink,
        chunk_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            process,
            sink,
            rate_limit: None,
            chunk_size: chunk_size.max(1),
            fault: None,
            cancel,
            state: TransferState::default(),
            pending: None,
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

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn process(&self) -> &ArchiveProcess {
        &self.process
    }

    /// 读取第一块数据
    ///
    /// 在提交响应头之前调用：输出为空时在这里就能确定退出码，
    /// 失败可以作为真正的 500 响应返回
    pub async fn prime(&mut self) -> ArchiveResult<()> {
        if self.fault == Some(FaultKind::Producer) {
            return Err(ArchiveError::ProducerFailure {
                code: None,
                diagnostic: "injected producer fault".to_string(),
            });
        }

        let mut buf = vec![0u8; self.chunk_size];
        let n = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ArchiveError::Cancelled),
            read = self.process.read_chunk(&mut buf) => read?,
        };

        if n > 0 {
            self.pending = Some(Bytes::copy_from_slice(&buf[..n]));
            return Ok(());
        }

        self.await_exit().await.map(|_| ())
    }

    /// 转发剩余数据直到输出结束、客户端断开或出错
    pub async fn pump(&mut self) -> ArchiveResult<TransferOutcome> {
        if let Some(chunk) = self.pending.take() {
            if let Some(outcome) = self.forward(chunk).await? {
                return Ok(outcome);
            }
        }

        match self.fault {
            Some(FaultKind::Error) => return Err(ArchiveError::InjectedFault(FaultKind::Error)),
            Some(FaultKind::Panic) => panic!("injected panic fault"),
            _ => {}
        }

        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ArchiveError::Cancelled),
                _ = self.sink.closed() => return Ok(TransferOutcome::ClientDisconnect),
                read = self.process.read_chunk(&mut buf) => read?,
            };
            if n == 0 {
                break;
            }
            if let Some(outcome) = self.forward(Bytes::copy_from_slice(&buf[..n])).await? {
                return Ok(outcome);
            }
        }

        self.await_exit().await
    }

    /// 限速等待后写入一块数据
    ///
    /// 返回 Some 表示转发应当停止
    async fn forward(&mut self, chunk: Bytes) -> ArchiveResult<Option<TransferOutcome>> {
        if let Some(rate) = self.rate_limit {
            let delay = rate.delay_for(chunk.len());
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ArchiveError::Cancelled),
                _ = self.sink.closed() => return Ok(Some(TransferOutcome::ClientDisconnect)),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.sink.is_closed() {
            return Ok(Some(TransferOutcome::ClientDisconnect));
        }

        let len = chunk.len() as u64;
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ArchiveError::Cancelled),
            sent = self.sink.send(chunk) => sent,
        };
        if !sent {
            return Ok(Some(TransferOutcome::ClientDisconnect));
        }

        self.state.bytes_sent += len;
        Ok(None)
    }

    /// 输出结束后等待退出码，非零退出码视为压缩失败
    ///
    /// 关闭了标准输出却迟迟不退出的进程不能拖住转发：客户端断开时直接结束
    async fn await_exit(&mut self) -> ArchiveResult<TransferOutcome> {
        let code = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ArchiveError::Cancelled),
            _ = self.sink.closed(), if !self.sink.is_finalized() => {
                return Ok(TransferOutcome::ClientDisconnect)
            }
            code = self.process.wait() => code?,
        };

        match code {
            Some(0) => Ok(TransferOutcome::Success),
            code => {
                let diagnostic = self.process.diagnostic().await;
                Err(ArchiveError::ProducerFailure { code, diagnostic })
            }
        }
    }

    /// 终止压缩进程，可重复调用
    pub async fn stop_producer(&mut self) {
        if self.state.producer_stopped {
            return;
        }
        let code = self.process.terminate().await;
        self.state.producer_stopped = true;
        debug!(
            "压缩进程已终止: pid={:?}, 退出码={:?}",
            self.process.pid(),
            code
        );
    }

    /// 结束响应，可重复调用
    ///
    /// `clean` 为 false 时以错误结束，客户端能分辨出下载不完整
    pub fn finalize(&mut self, clean: bool) {
        if self.state.finalized {
            return;
        }
        if clean {
            self.sink.finish();
        } else {
            self.sink.abort("archive stream aborted");
        }
        self.state.finalized = true;
    }

    /// 每条退出路径都会执行的收尾：先终止进程，再结束响应
    pub async fn close(&mut self, clean: bool) {
        self.stop_producer().await;
        self.finalize(clean);
    }
}
