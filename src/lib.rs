//! hotline-mirror - Hotline tracker 镜像
//!
//! 把 tracker 登记的 Hotline 服务器、各服务器的文件树和在线用户镜像到本地 SQLite。
//!
//! # 核心功能
//!
//! - **协议客户端**: TRTP 握手、登录、事务帧编解码
//! - **服务器轮询**: 分阶段超时的状态机，有界并发池
//! - **Reconciliation**: 服务器整表替换、文件树按服务器分批替换、用户 upsert
//! - **Cycle**: 一次完整的拉取 + 写入，调度由外部负责
//!
//! # Feature Flags
//!
//! - `http`: 基于 reqwest 的 tracker 数据源（默认开启）

pub mod config;
pub mod cycle;
pub mod db;
pub mod error;
pub mod gateway;
pub mod poller;
pub mod protocol;
pub mod reconcile;
pub mod schema;
pub mod source;
pub mod types;

// Re-exports
pub use config::{DbConfig, LoginConfig, MirrorConfig, PollTimeouts};
pub use cycle::{run_cycle, CycleReport};
pub use db::{current_time_ms, MirrorDB, Stats};
pub use error::{Error, Result};
pub use gateway::PersistenceGateway;
pub use poller::{poll_all, PollFailure, PollOutcome, PollPhase, PollSettings, PollStatus, ServerPoller};
pub use protocol::{Field, LoginResponse, ProtocolMessage, ProtocolSession};
pub use reconcile::{FileSyncResult, ReconciliationEngine, UserSyncResult};
pub use source::{DirectorySource, FileListingSource};
pub use types::*;

#[cfg(feature = "http")]
pub use source::HttpSource;
