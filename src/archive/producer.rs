// 压缩进程（生产者）
//
// 在解析出的目录中启动压缩程序，ZIP 数据写到标准输出。
// 进程作为新进程组的组长启动，便于整组终止。

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::error::{ArchiveError, ArchiveResult};
use super::lifecycle::ProcessState;
use crate::config::ArchiveConfig;

/// 保留的标准错误输出上限（只保留末尾部分）
const STDERR_TAIL_LIMIT: usize = 16 * 1024;

/// 压缩程序命令行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerCommand {
    program: String,
    args: Vec<String>,
}

impl ProducerCommand {
    /// 任意命令（测试中用 `sh -c` 脚本模拟压缩程序）
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `zip -q -r - . -x <patterns>`：递归压缩当前目录并写到标准输出
    pub fn zip(program: impl Into<String>, exclude: &[String]) -> Self {
        let mut args: Vec<String> = ["-q", "-r", "-", "."].iter().map(|s| s.to_string()).collect();
        if !exclude.is_empty() {
            args.push("-x".to_string());
            args.extend(exclude.iter().cloned());
        }
        Self::new(program, args)
    }

    pub fn from_config(config: &ArchiveConfig) -> Self {
        Self::zip(config.zip_program.clone(), &config.exclude)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// 在 `directory` 中启动压缩进程
    pub fn spawn(&self, directory: &Path, grace: Duration) -> ArchiveResult<ArchiveProcess> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(ArchiveError::Spawn)?;
        let pid = child.id();
        let pgid = pid.and_then(process_group_of);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take().map(collect_stderr);

        info!(
            "压缩进程已启动: pid={:?}, pgid={:?}, 目录={:?}",
            pid, pgid, directory
        );

        Ok(ArchiveProcess {
            child: Some(child),
            pid,
            pgid,
            stdout,
            stderr,
            state: ProcessState::Running,
            grace,
            detached: false,
        })
    }
}

/// 查询子进程所在的进程组
///
/// 查询失败，或子进程与本进程同组时返回 None，退回到只向单个进程发信号
#[cfg(unix)]
fn process_group_of(pid: u32) -> Option<i32> {
    use nix::unistd::{getpgid, getpgrp, Pid};

    let pgid = getpgid(Some(Pid::from_raw(pid as i32))).ok()?;
    // 不能向自身所在的进程组发信号
    if pgid == getpgrp() {
        return None;
    }
    Some(pgid.as_raw())
}

#[cfg(not(unix))]
fn process_group_of(_pid: u32) -> Option<i32> {
    None
}

/// 后台收集标准错误输出，防止管道写满阻塞压缩程序
fn collect_stderr(mut stderr: ChildStderr) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut tail = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tail.extend_from_slice(&buf[..n]);
                    if tail.len() > STDERR_TAIL_LIMIT {
                        let excess = tail.len() - STDERR_TAIL_LIMIT;
                        tail.drain(..excess);
                    }
                }
            }
        }
        String::from_utf8_lossy(&tail).trim().to_string()
    })
}

/// 运行中的压缩进程
///
/// 每个请求独占一个实例。终止逻辑见 `lifecycle` 模块；
/// 未终止就被丢弃时，Drop 会安排同样的终止流程。
pub struct ArchiveProcess {
    pub(super) child: Option<Child>,
    pub(super) pid: Option<u32>,
    pub(super) pgid: Option<i32>,
    pub(super) stdout: Option<ChildStdout>,
    pub(super) stderr: Option<JoinHandle<String>>,
    pub(super) state: ProcessState,
    pub(super) grace: Duration,
    /// 已从原句柄分离、由后台任务负责终止
    pub(super) detached: bool,
}

impl ArchiveProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn process_group(&self) -> Option<i32> {
        self.pgid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// 读取一块标准输出，返回 0 表示输出结束
    ///
    /// 可安全地在 `select!` 中取消
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stdout.as_mut() {
            Some(stdout) => stdout.read(buf).await,
            None => Ok(0),
        }
    }

    /// 等待进程退出并返回退出码（被信号终止时为 None）
    ///
    /// 已退出时直接返回记录的退出码
    pub async fn wait(&mut self) -> io::Result<Option<i32>> {
        if let ProcessState::Exited(code) = self.state {
            return Ok(code);
        }
        let code = match self.child.as_mut() {
            Some(child) => child.wait().await?.code(),
            None => None,
        };
        self.state = ProcessState::Exited(code);
        debug!("压缩进程已退出: pid={:?}, 退出码={:?}", self.pid, code);
        Ok(code)
    }

    /// 取出收集到的标准错误输出
    ///
    /// 最多等待一个宽限期；只能取一次，之后返回空串
    pub async fn diagnostic(&mut self) -> String {
        let Some(handle) = self.stderr.take() else {
            return String::new();
        };
        match tokio::time::timeout(self.grace, handle).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                debug!("标准错误收集任务异常: {}", e);
                String::new()
            }
            Err(_) => {
                debug!("等待标准错误输出超时: pid={:?}", self.pid);
                String::new()
            }
        }
    }
}
