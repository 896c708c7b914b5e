//! 数据类型定义

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// tracker 标记的假服务器类型，永不轮询
pub const FAKE_SERVER_TYPE: &str = "FAKE";

/// tracker 目录响应
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerDirectory {
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
}

/// tracker 上登记的一台服务器
///
/// 每个 cycle 整体替换；除 `unique_id` 外没有跨 cycle 的身份。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub unique_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub user_count: i64,
    #[serde(default)]
    pub server_type: Option<String>,
    #[serde(default)]
    pub filtered: Option<bool>,
    #[serde(default)]
    pub filtered_by: Option<String>,
    #[serde(default)]
    pub last_checked_in: Option<String>,
    #[serde(default)]
    pub mirror_sources: Vec<String>,
}

impl ServerDescriptor {
    /// 入库时 mirror_sources 以逗号拼接
    pub fn mirror_sources_joined(&self) -> String {
        self.mirror_sources.join(",")
    }

    /// 从入库字符串还原 mirror_sources
    pub fn split_mirror_sources(joined: &str) -> Vec<String> {
        joined
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }

    pub fn is_fake(&self) -> bool {
        self.server_type.as_deref() == Some(FAKE_SERVER_TYPE)
    }

    /// 127.0.0.0/8 或 localhost
    pub fn is_loopback(&self) -> bool {
        match self.ip.parse::<IpAddr>() {
            Ok(addr) => addr.is_loopback(),
            Err(_) => self.ip.eq_ignore_ascii_case("localhost"),
        }
    }

    /// 是否需要连接拉取在线用户：只看 tracker 声明的在线人数
    pub fn is_poll_target(&self) -> bool {
        self.user_count >= 1
    }

    /// 是否需要刷新文件树（跳过列表在 reconcile 中单独判断）
    pub fn is_file_target(&self, include_loopback: bool) -> bool {
        !self.is_fake() && (include_loopback || !self.is_loopback())
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// 单台服务器的文件列表响应
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileListing {
    #[serde(default)]
    pub status: Option<String>,
    /// 目录路径 -> 该目录下的条目
    #[serde(default)]
    pub paths: Option<BTreeMap<String, Vec<FileEntry>>>,
}

impl FileListing {
    /// status 为 "ok" 才是有效数据
    pub fn is_ok(&self) -> bool {
        self.status.as_deref() == Some("ok")
    }

    /// 条目总数
    pub fn entry_count(&self) -> usize {
        self.paths
            .as_ref()
            .map(|p| p.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

/// 文件列表中的单个条目
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub is_folder: Option<bool>,
    #[serde(default)]
    pub type_code: Option<String>,
    #[serde(default)]
    pub creator_code: Option<String>,
}

/// 入库的文件记录
///
/// (server_id, full_path) 唯一；full_path 以 "/" 开头，目录以 "/" 结尾。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub server_id: String,
    pub name: String,
    pub full_path: String,
    pub parent_path: String,
    pub size: Option<i64>,
    pub is_folder: bool,
    pub type_code: Option<String>,
    pub creator_code: Option<String>,
}

/// 入库的在线用户记录，(server_id, user_name) 唯一
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub server_id: String,
    pub server_name: String,
    pub user_name: String,
    pub icon_id: u16,
    /// 最近一次观察到的时间 (毫秒)
    pub observed_at: i64,
}

/// 协议层解析出的一个在线用户
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedUser {
    pub name: String,
    pub icon_id: u16,
}

/// 任务运行记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub script_name: String,
    pub last_run_utc: i64,
}
