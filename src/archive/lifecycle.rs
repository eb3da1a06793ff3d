//! 压缩进程生命周期管理
//!
//! 终止流程是一个由单个截止时间驱动的状态机：
//!
//! ```text
//! Running --SIGTERM--> TerminateRequested{deadline} --超时, SIGKILL--> KillRequested
//!    |                          |                                          |
//!    +--------------------------+------------------------------------------+--> Exited
//! ```
//!
//! 信号发送给整个进程组（压缩程序可能派生子进程），拿不到进程组时退回到单个进程。
//! `terminate` 可重复调用，进程已退出时不做任何事。

use std::io;
use std::process::ExitStatus;

use tokio::process::{Child, ChildStdout};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::producer::ArchiveProcess;

/// 进程生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// 运行中
    Running,
    /// 已发送 SIGTERM，等待到截止时间
    TerminateRequested { deadline: Instant },
    /// 已发送 SIGKILL，无条件等待退出
    KillRequested,
    /// 已退出（被信号终止时退出码为 None）
    Exited(Option<i32>),
}

/// 终止信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TermSignal {
    /// SIGTERM
    Graceful,
    /// SIGKILL
    Forceful,
}

impl ArchiveProcess {
    pub fn is_exited(&self) -> bool {
        matches!(self.state, ProcessState::Exited(_))
    }

    /// 终止压缩进程（及其进程组），返回退出码
    pub async fn terminate(&mut self) -> Option<i32> {
        loop {
            match self.state {
                ProcessState::Exited(code) => return code,
                ProcessState::Running => {
                    if self.try_reap() {
                        continue;
                    }
                    debug!(
                        "发送 SIGTERM: pid={:?}, pgid={:?}, 宽限期={:?}",
                        self.pid, self.pgid, self.grace
                    );
                    self.send_signal(TermSignal::Graceful);
                    self.state = ProcessState::TerminateRequested {
                        deadline: Instant::now() + self.grace,
                    };
                }
                ProcessState::TerminateRequested { deadline } => {
                    let Some(child) = self.child.as_mut() else {
                        self.state = ProcessState::Exited(None);
                        continue;
                    };
                    let waited =
                        tokio::time::timeout_at(deadline, wait_draining(child, self.stdout.as_mut()))
                            .await;
                    match waited {
                        Ok(Ok(status)) => self.state = ProcessState::Exited(status.code()),
                        Ok(Err(e)) => {
                            warn!("等待压缩进程退出失败: pid={:?}, 错误: {}", self.pid, e);
                            self.send_signal(TermSignal::Forceful);
                            self.state = ProcessState::KillRequested;
                        }
                        Err(_) => {
                            warn!(
                                "压缩进程在宽限期内未退出，发送 SIGKILL: pid={:?}, pgid={:?}",
                                self.pid, self.pgid
                            );
                            self.send_signal(TermSignal::Forceful);
                            self.state = ProcessState::KillRequested;
                        }
                    }
                }
                ProcessState::KillRequested => {
                    let code = match self.child.as_mut() {
                        Some(child) => match child.wait().await {
                            Ok(status) => status.code(),
                            Err(e) => {
                                warn!("等待被杀死的压缩进程失败: pid={:?}, 错误: {}", self.pid, e);
                                None
                            }
                        },
                        None => None,
                    };
                    self.state = ProcessState::Exited(code);
                }
            }
        }
    }

    /// 非阻塞地检查进程是否已经退出
    fn try_reap(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            self.state = ProcessState::Exited(None);
            return true;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.state = ProcessState::Exited(status.code());
                true
            }
            Ok(None) => false,
            Err(e) => {
                debug!("检查压缩进程状态失败: pid={:?}, 错误: {}", self.pid, e);
                false
            }
        }
    }

    #[cfg(unix)]
    fn send_signal(&mut self, signal: TermSignal) {
        use nix::sys::signal::{kill, killpg, Signal};
        use nix::unistd::Pid;

        let signal = match signal {
            TermSignal::Graceful => Signal::SIGTERM,
            TermSignal::Forceful => Signal::SIGKILL,
        };
        let result = match (self.pgid, self.pid) {
            (Some(pgid), _) => killpg(Pid::from_raw(pgid), signal),
            (None, Some(pid)) => kill(Pid::from_raw(pid as i32), signal),
            (None, None) => return,
        };
        // ESRCH：进程已经不存在
        if let Err(e) = result {
            debug!("发送 {:?} 失败: pid={:?}, pgid={:?}, 错误: {}", signal, self.pid, self.pgid, e);
        }
    }

    #[cfg(not(unix))]
    fn send_signal(&mut self, _signal: TermSignal) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                debug!("终止压缩进程失败: pid={:?}, 错误: {}", self.pid, e);
            }
        }
    }

    /// 把进程的所有权转移到一个新句柄，原句柄标记为已退出
    fn detach(&mut self) -> ArchiveProcess {
        let state = std::mem::replace(&mut self.state, ProcessState::Exited(None));
        ArchiveProcess {
            child: self.child.take(),
            pid: self.pid,
            pgid: self.pgid,
            stdout: self.stdout.take(),
            stderr: self.stderr.take(),
            state,
            grace: self.grace,
            detached: true,
        }
    }
}

/// 等待进程退出，同时读空标准输出，避免进程阻塞在写管道上
async fn wait_draining(child: &mut Child, stdout: Option<&mut ChildStdout>) -> io::Result<ExitStatus> {
    let drain = async {
        if let Some(stdout) = stdout {
            let _ = tokio::io::copy(stdout, &mut tokio::io::sink()).await;
        }
    };
    let (status, ()) = tokio::join!(child.wait(), drain);
    status
}

impl Drop for ArchiveProcess {
    fn drop(&mut self) {
        if self.is_exited() || self.child.is_none() {
            return;
        }

        // 有运行时就在后台走完整的 SIGTERM -> SIGKILL 流程
        if !self.detached {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let mut orphan = self.detach();
                debug!("压缩进程句柄被提前丢弃，后台终止: pid={:?}", orphan.pid);
                handle.spawn(async move {
                    orphan.terminate().await;
                });
                return;
            }
        }

        // 没有运行时（或后台任务本身被丢弃）时只能立即强制终止
        self.send_signal(TermSignal::Forceful);
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
        self.state = ProcessState::Exited(None);
    }
}
