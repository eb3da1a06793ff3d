// 集成测试辅助函数

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use photo_archive_rust::{build_router, config::AppConfig, AppState, ProducerCommand};
use tempfile::TempDir;

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub root: TempDir,
    pub scratch: TempDir,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// 在归档根目录下创建一个目录
    pub fn archive_dir(&self, id: &str) -> PathBuf {
        let dir = self.root.path().join(id);
        std::fs::create_dir_all(&dir).expect("create archive dir");
        dir
    }

    /// 测试脚本可以写入的临时文件路径
    pub fn scratch_path(&self, name: &str) -> PathBuf {
        self.scratch.path().join(name)
    }
}

pub fn test_config(root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.archive.root = root.to_path_buf();
    config.archive.grace_period_ms = 500;
    config.archive.min_rate_kbps = 1.0;
    config.archive.fault_injection = true;
    config.server.index_path = root.join("index.html");
    config
}

/// 启动测试服务器；`producer` 为 None 时使用配置中的 zip
pub async fn start_server<F>(customize: F, producer: Option<ProducerCommand>) -> TestServer
where
    F: FnOnce(&mut AppConfig),
{
    let root = TempDir::new().expect("tempdir");
    let scratch = TempDir::new().expect("tempdir");
    let mut config = test_config(root.path());
    customize(&mut config);

    let state = match producer {
        Some(producer) => AppState::with_producer(config, producer),
        None => AppState::new(config),
    };
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve app");
    });

    TestServer {
        addr,
        state,
        root,
        scratch,
    }
}

pub fn sh(script: impl Into<String>) -> ProducerCommand {
    ProducerCommand::new("sh", vec!["-c".to_string(), script.into()])
}

/// 系统中是否安装了 zip
pub fn zip_available() -> bool {
    std::process::Command::new("zip")
        .arg("-v")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// 进程不存在，或只剩僵尸进程
pub fn process_gone(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return true;
    }
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .map(|stat| {
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(false)
        })
        .unwrap_or(false)
}

pub async fn wait_gone(pid: u32, within: Duration) -> bool {
    let deadline = std::time::Instant::now() + within;
    while std::time::Instant::now() < deadline {
        if process_gone(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    process_gone(pid)
}

/// 等待脚本把 pid 写入文件
pub async fn read_pid(path: &Path) -> u32 {
    for _ in 0..100 {
        if let Ok(text) = std::fs::read_to_string(path) {
            if let Ok(pid) = text.trim().parse() {
                return pid;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("pid file {:?} was never written", path);
}

/// 等待所有转发任务结束
pub async fn wait_tasks_idle(state: &AppState, within: Duration) -> bool {
    let deadline = std::time::Instant::now() + within;
    while std::time::Instant::now() < deadline {
        if state.tasks.is_empty() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    state.tasks.is_empty()
}
