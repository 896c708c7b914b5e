//! 错误类型定义

use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 数据库错误（写入批次提交失败等）
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// 传输错误：连接被拒、重置、DNS 解析失败、读写失败
    #[error("传输错误: {0}")]
    Transport(std::io::Error),

    /// 协议错误：握手 / 登录 / 事务帧不合法
    #[error("协议错误: {0}")]
    Protocol(String),

    /// 阶段超时
    #[error("超时: {phase} 阶段超过 {timeout_ms}ms")]
    Timeout {
        phase: &'static str,
        timeout_ms: u64,
    },

    /// 输入数据错误（tracker / 文件列表字段缺失或格式不对）
    #[error("数据错误: {0}")]
    Data(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP 错误
    #[cfg(feature = "http")]
    #[error("HTTP 错误: {0}")]
    Http(#[from] reqwest::Error),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
