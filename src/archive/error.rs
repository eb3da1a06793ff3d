// 归档流水线错误类型

use std::io;

use super::request::FaultKind;

/// 归档流水线错误
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// 标识符无效，或对应目录不存在
    #[error("归档不存在: {0}")]
    NotFound(String),

    /// 压缩程序无法启动
    #[error("启动压缩进程失败: {0}")]
    Spawn(#[source] io::Error),

    /// 压缩程序以非零退出码结束
    #[error("压缩进程异常退出 (退出码 {}): {diagnostic}", display_code(.code))]
    ProducerFailure {
        code: Option<i32>,
        diagnostic: String,
    },

    /// 读取压缩输出失败
    #[error("读取压缩输出失败: {0}")]
    Io(#[from] io::Error),

    /// 服务端取消了请求（例如正在关闭）
    #[error("请求已取消")]
    Cancelled,

    /// 通过 `fault` 参数注入的故障
    #[error("注入故障: {0}")]
    InjectedFault(FaultKind),
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "无（被信号终止）".to_string(),
    }
}

pub type ArchiveResult<T> = std::result::Result<T, ArchiveError>;
