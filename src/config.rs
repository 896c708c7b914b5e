//! 配置
//!
//! 配置以值对象的形式传入一次 cycle：每次 cycle 加载一次，期间不再修改。

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 默认 tracker 地址
pub const DEFAULT_TRACKER_URL: &str = "http://127.0.0.1:8080/servers";

/// 文件记录单批写入条数
pub const DEFAULT_FILE_BATCH_SIZE: usize = 5000;

/// 并发轮询的 worker 数
pub const DEFAULT_POOL_SIZE: usize = 32;

/// 数据库连接配置
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// SQLite 文件路径
    pub url: String,
}

impl DbConfig {
    /// 创建本地 SQLite 配置
    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        Self {
            url: path.display().to_string(),
        }
    }

    /// 获取数据库文件路径
    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.url)
    }
}

/// 登录身份
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    pub username: String,
    pub icon_id: u16,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            username: "Guest".to_string(),
            icon_id: 200,
        }
    }
}

/// 各阶段超时（毫秒），互相独立，不累计
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollTimeouts {
    pub connect_ms: u64,
    pub handshake_ms: u64,
    /// 登录回包的短超时；超时且连接仍在视为登录成功
    pub login_ms: u64,
    pub query_ms: u64,
}

impl Default for PollTimeouts {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            handshake_ms: 10_000,
            login_ms: 1_000,
            query_ms: 10_000,
        }
    }
}

impl PollTimeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn login(&self) -> Duration {
        Duration::from_millis(self.login_ms)
    }

    pub fn query(&self) -> Duration {
        Duration::from_millis(self.query_ms)
    }
}

fn default_tracker_url() -> String {
    DEFAULT_TRACKER_URL.to_string()
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_file_batch_size() -> usize {
    DEFAULT_FILE_BATCH_SIZE
}

/// 镜像任务配置
///
/// `db_path` 与 `servers_to_skip_refresh` 为必填项，缺失时加载直接失败。
#[derive(Debug, Clone, Deserialize)]
pub struct MirrorConfig {
    /// SQLite 数据库路径
    pub db_path: PathBuf,

    /// 文件数据保持不变、不刷新的服务器 unique_id 列表
    pub servers_to_skip_refresh: HashSet<String>,

    /// tracker 目录地址；文件列表地址为 `{tracker_url}/{unique_id}/files`
    #[serde(default = "default_tracker_url")]
    pub tracker_url: String,

    #[serde(default)]
    pub login: LoginConfig,

    #[serde(default)]
    pub timeouts: PollTimeouts,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_file_batch_size")]
    pub file_batch_size: usize,

    /// 文件任务是否包含 127.0.0.0/8 地址的服务器（轮询不受影响）
    #[serde(default)]
    pub include_loopback: bool,
}

impl MirrorConfig {
    /// 以必填项构造，其余取默认值
    pub fn new<P: Into<PathBuf>>(db_path: P, servers_to_skip_refresh: HashSet<String>) -> Self {
        Self {
            db_path: db_path.into(),
            servers_to_skip_refresh,
            tracker_url: default_tracker_url(),
            login: LoginConfig::default(),
            timeouts: PollTimeouts::default(),
            pool_size: DEFAULT_POOL_SIZE,
            file_batch_size: DEFAULT_FILE_BATCH_SIZE,
            include_loopback: false,
        }
    }

    /// 从 JSON 文本解析
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("无法解析配置: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 从 JSON 文件加载
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("无法读取配置文件 {}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// 从环境变量指定的路径或默认路径加载
    ///
    /// 查找顺序：
    /// 1. `HOTLINE_MIRROR_CONFIG`
    /// 2. `~/.hotline-mirror/config.json`
    pub fn from_env() -> Result<Self> {
        let path = match std::env::var("HOTLINE_MIRROR_CONFIG") {
            Ok(p) => PathBuf::from(p),
            Err(_) => Self::default_path(),
        };
        Self::load(&path)
    }

    /// 默认配置文件路径
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".hotline-mirror").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    }

    /// 校验配置；任何网络活动之前调用
    pub fn validate(&self) -> Result<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(Error::Config("db_path 为空".into()));
        }
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size 必须大于 0".into()));
        }
        if self.file_batch_size == 0 {
            return Err(Error::Config("file_batch_size 必须大于 0".into()));
        }
        if self.login.username.is_empty() {
            return Err(Error::Config("login.username 为空".into()));
        }
        if self.login.username.len() > u16::MAX as usize {
            return Err(Error::Config("login.username 过长".into()));
        }
        Ok(())
    }

    /// 数据库配置
    pub fn db_config(&self) -> DbConfig {
        DbConfig::local(&self.db_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let json = r#"{
            "db_path": "/tmp/mirror.db",
            "servers_to_skip_refresh": ["abc"]
        }"#;
        let config = MirrorConfig::from_json_str(json).unwrap();
        assert_eq!(config.file_batch_size, 5000);
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.login.username, "Guest");
        assert_eq!(config.login.icon_id, 200);
        assert_eq!(config.timeouts.login(), Duration::from_secs(1));
        assert!(config.servers_to_skip_refresh.contains("abc"));
        assert!(!config.servers_to_skip_refresh.contains("xyz"));
        assert!(!config.include_loopback);
    }

    #[test]
    fn test_missing_skip_list_is_config_error() {
        let json = r#"{ "db_path": "/tmp/mirror.db" }"#;
        let err = MirrorConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("servers_to_skip_refresh"));
    }

    #[test]
    fn test_missing_db_path_is_config_error() {
        let json = r#"{ "servers_to_skip_refresh": [] }"#;
        assert!(matches!(
            MirrorConfig::from_json_str(json),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let json = r#"{
            "db_path": "/tmp/mirror.db",
            "servers_to_skip_refresh": [],
            "file_batch_size": 0
        }"#;
        assert!(matches!(
            MirrorConfig::from_json_str(json),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = MirrorConfig::load(Path::new("/nonexistent/hotline/config.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
