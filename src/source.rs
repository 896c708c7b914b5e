//! 远端数据源
//!
//! tracker 目录和文件列表的获取方式与 cycle 逻辑解耦：
//! cycle 只依赖这两个 trait，HTTP 实现在 `http` feature 下提供。

use crate::error::{Error, Result};
use crate::types::{FileListing, ServerDescriptor, TrackerDirectory};
use std::future::Future;

/// tracker 目录
pub trait DirectorySource: Send + Sync {
    fn fetch_servers(&self) -> impl Future<Output = Result<Vec<ServerDescriptor>>> + Send;
}

/// 单台服务器的文件列表
pub trait FileListingSource: Send + Sync {
    fn fetch_files(&self, server_id: &str) -> impl Future<Output = Result<FileListing>> + Send;
}

/// 解析 tracker 目录响应
pub fn parse_directory(body: &str) -> Result<Vec<ServerDescriptor>> {
    let directory: TrackerDirectory = serde_json::from_str(body)
        .map_err(|e| Error::Data(format!("无法解析 tracker 目录: {}", e)))?;
    Ok(directory.servers)
}

/// 解析文件列表响应
pub fn parse_file_listing(body: &str) -> Result<FileListing> {
    serde_json::from_str(body).map_err(|e| Error::Data(format!("无法解析文件列表: {}", e)))
}

/// 文件列表地址：`{tracker_url}/{unique_id}/files`
pub fn files_url(tracker_url: &str, server_id: &str) -> String {
    format!("{}/{}/files", tracker_url.trim_end_matches('/'), server_id)
}

#[cfg(feature = "http")]
pub use http::HttpSource;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use std::time::Duration;

    /// 目录请求超时
    const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(10);

    /// 文件列表请求超时（大服务器的文件树可能有几 MB）
    const FILES_TIMEOUT: Duration = Duration::from_secs(30);

    /// 基于 reqwest 的 tracker 客户端
    #[derive(Clone)]
    pub struct HttpSource {
        client: reqwest::Client,
        tracker_url: String,
    }

    impl HttpSource {
        pub fn new(tracker_url: impl Into<String>) -> Result<Self> {
            let client = reqwest::Client::builder().gzip(true).build()?;
            Ok(Self::with_client(client, tracker_url))
        }

        pub fn with_client(client: reqwest::Client, tracker_url: impl Into<String>) -> Self {
            Self {
                client,
                tracker_url: tracker_url.into(),
            }
        }

        async fn get_text(&self, url: &str, timeout: Duration) -> Result<String> {
            let resp = self
                .client
                .get(url)
                .timeout(timeout)
                .send()
                .await?
                .error_for_status()?;
            Ok(resp.text().await?)
        }
    }

    impl DirectorySource for HttpSource {
        async fn fetch_servers(&self) -> Result<Vec<ServerDescriptor>> {
            let body = self.get_text(&self.tracker_url, DIRECTORY_TIMEOUT).await?;
            let servers = parse_directory(&body)?;
            tracing::debug!("tracker 返回 {} 台服务器", servers.len());
            Ok(servers)
        }
    }

    impl FileListingSource for HttpSource {
        async fn fetch_files(&self, server_id: &str) -> Result<FileListing> {
            let url = files_url(&self.tracker_url, server_id);
            let body = self.get_text(&url, FILES_TIMEOUT).await?;
            parse_file_listing(&body)
        }
    }
}
