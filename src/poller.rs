//! 单台服务器轮询
//!
//! 状态机：Init → Connecting → Handshaking → LoggingIn → Querying → Parsing
//! → Success / Failed。每个阶段独立超时，任何出口都会关闭连接。

use crate::config::{MirrorConfig, PollTimeouts};
use crate::error::Error;
use crate::protocol::{self, LoginRejection, LoginResponse, ProtocolSession};
use crate::types::{ObservedUser, ServerDescriptor, UserRecord};
use std::fmt;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// 轮询阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Init,
    Connecting,
    Handshaking,
    LoggingIn,
    Querying,
    Parsing,
}

impl fmt::Display for PollPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollPhase::Init => write!(f, "init"),
            PollPhase::Connecting => write!(f, "connecting"),
            PollPhase::Handshaking => write!(f, "handshaking"),
            PollPhase::LoggingIn => write!(f, "logging_in"),
            PollPhase::Querying => write!(f, "querying"),
            PollPhase::Parsing => write!(f, "parsing"),
        }
    }
}

/// 失败原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollFailure {
    /// 阶段超时
    Timeout { phase: PollPhase },
    /// 连接被拒、重置、DNS 失败等
    Transport { phase: PollPhase, message: String },
    /// 发送登录后对端关闭连接
    ConnectionClosed,
    /// 登录被拒
    Rejected { result_code: u32 },
    /// 回复不合法
    Protocol { phase: PollPhase, message: String },
}

impl fmt::Display for PollFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollFailure::Timeout { phase } => write!(f, "timeout ({})", phase),
            PollFailure::Transport { phase, message } => {
                write!(f, "transport_error ({}): {}", phase, message)
            }
            PollFailure::ConnectionClosed => write!(f, "connection-closed"),
            PollFailure::Rejected { result_code } => write!(f, "rejected (code {})", result_code),
            PollFailure::Protocol { phase, message } => {
                write!(f, "protocol_error ({}): {}", phase, message)
            }
        }
    }
}

/// 轮询状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Success(Vec<UserRecord>),
    Failed(PollFailure),
}

/// 单台服务器单个 cycle 的轮询结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    pub server_id: String,
    pub status: PollStatus,
}

impl PollOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, PollStatus::Success(_))
    }

    /// 成功时的用户记录，失败为空
    pub fn users(&self) -> &[UserRecord] {
        match &self.status {
            PollStatus::Success(users) => users,
            PollStatus::Failed(_) => &[],
        }
    }

    pub fn failure(&self) -> Option<&PollFailure> {
        match &self.status {
            PollStatus::Success(_) => None,
            PollStatus::Failed(reason) => Some(reason),
        }
    }
}

/// 登录身份与超时
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub username: String,
    pub icon_id: u16,
    pub timeouts: PollTimeouts,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            username: "Guest".to_string(),
            icon_id: 200,
            timeouts: PollTimeouts::default(),
        }
    }
}

impl From<&MirrorConfig> for PollSettings {
    fn from(config: &MirrorConfig) -> Self {
        Self {
            username: config.login.username.clone(),
            icon_id: config.login.icon_id,
            timeouts: config.timeouts.clone(),
        }
    }
}

/// 驱动一个协议会话完成一次轮询
pub struct ServerPoller {
    server: ServerDescriptor,
    settings: PollSettings,
    phase: PollPhase,
}

impl ServerPoller {
    pub fn new(server: ServerDescriptor, settings: PollSettings) -> Self {
        Self {
            server,
            settings,
            phase: PollPhase::Init,
        }
    }

    pub fn phase(&self) -> PollPhase {
        self.phase
    }

    fn enter(&mut self, phase: PollPhase) {
        tracing::trace!(
            "[{}] {} -> {}",
            self.server.unique_id,
            self.phase,
            phase
        );
        self.phase = phase;
    }

    fn failure(&self, err: Error) -> PollFailure {
        let phase = self.phase;
        match err {
            Error::Timeout { .. } => PollFailure::Timeout { phase },
            Error::Transport(e) | Error::Io(e) => PollFailure::Transport {
                phase,
                message: e.to_string(),
            },
            other => PollFailure::Protocol {
                phase,
                message: other.to_string(),
            },
        }
    }

    /// 执行轮询；`observed_at` 为本 cycle 的运行时间 (毫秒)
    pub async fn poll(mut self, observed_at: i64) -> PollOutcome {
        let status = match self.run().await {
            Ok(users) => {
                tracing::debug!(
                    "[{}] {} 在线用户 {} 个",
                    self.server.unique_id,
                    self.server.address(),
                    users.len()
                );
                PollStatus::Success(
                    users
                        .into_iter()
                        .map(|u| UserRecord {
                            server_id: self.server.unique_id.clone(),
                            server_name: self.server.name.clone(),
                            user_name: u.name,
                            icon_id: u.icon_id,
                            observed_at,
                        })
                        .collect(),
                )
            }
            Err(reason) => {
                tracing::warn!(
                    "[{}] {} 轮询失败: {}",
                    self.server.unique_id,
                    self.server.address(),
                    reason
                );
                PollStatus::Failed(reason)
            }
        };

        PollOutcome {
            server_id: self.server.unique_id,
            status,
        }
    }

    async fn run(&mut self) -> Result<Vec<ObservedUser>, PollFailure> {
        self.enter(PollPhase::Connecting);
        let limit = self.settings.timeouts.connect();
        let stream = match tokio::time::timeout(limit, TcpStream::connect(self.server.address())).await {
            Err(_) => return Err(PollFailure::Timeout { phase: self.phase }),
            Ok(Err(e)) => return Err(self.failure(Error::Transport(e))),
            Ok(Ok(stream)) => stream,
        };

        let mut session = ProtocolSession::new(stream);
        let result = self.converse(&mut session).await;
        session.close().await;
        result
    }

    async fn converse(
        &mut self,
        session: &mut ProtocolSession<TcpStream>,
    ) -> Result<Vec<ObservedUser>, PollFailure> {
        let timeouts = self.settings.timeouts.clone();

        self.enter(PollPhase::Handshaking);
        session
            .handshake(timeouts.handshake())
            .await
            .map_err(|e| self.failure(e))?;

        self.enter(PollPhase::LoggingIn);
        let login = session
            .login(&self.settings.username, self.settings.icon_id, timeouts.login())
            .await
            .map_err(|e| self.failure(e))?;
        match login {
            LoginResponse::Accepted { acknowledged } => {
                if !acknowledged {
                    tracing::trace!("[{}] 登录无回复，按接受处理", self.server.unique_id);
                }
            }
            LoginResponse::Rejected(LoginRejection::ConnectionClosed) => {
                return Err(PollFailure::ConnectionClosed);
            }
            LoginResponse::Rejected(LoginRejection::ResultCode(result_code)) => {
                return Err(PollFailure::Rejected { result_code });
            }
        }

        self.enter(PollPhase::Querying);
        let reply = session
            .request_user_list(timeouts.query())
            .await
            .map_err(|e| self.failure(e))?;

        self.enter(PollPhase::Parsing);
        protocol::decode_user_list(&reply.payload).map_err(|e| self.failure(e))
    }
}

/// 并发轮询多台服务器，并发数受 `pool_size` 限制
///
/// 结果顺序不保证与输入一致。
pub async fn poll_all(
    servers: Vec<ServerDescriptor>,
    settings: PollSettings,
    pool_size: usize,
    observed_at: i64,
) -> Vec<PollOutcome> {
    let semaphore = Arc::new(Semaphore::new(pool_size.max(1)));
    let mut tasks = JoinSet::new();

    for server in servers {
        let semaphore = semaphore.clone();
        let settings = settings.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            ServerPoller::new(server, settings).poll(observed_at).await
        });
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => tracing::error!("轮询任务异常退出: {}", e),
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(port: u16) -> ServerDescriptor {
        ServerDescriptor {
            unique_id: "srv".into(),
            name: "Server".into(),
            description: None,
            ip: "127.0.0.1".into(),
            port,
            user_count: 1,
            server_type: None,
            filtered: None,
            filtered_by: None,
            last_checked_in: None,
            mirror_sources: vec![],
        }
    }

    #[test]
    fn test_failure_display() {
        assert_eq!(
            PollFailure::Timeout { phase: PollPhase::Querying }.to_string(),
            "timeout (querying)"
        );
        assert_eq!(PollFailure::ConnectionClosed.to_string(), "connection-closed");
    }

    #[test]
    fn test_outcome_accessors() {
        let failed = PollOutcome {
            server_id: "a".into(),
            status: PollStatus::Failed(PollFailure::ConnectionClosed),
        };
        assert!(!failed.is_success());
        assert!(failed.users().is_empty());
        assert_eq!(failed.failure(), Some(&PollFailure::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        // 绑定后立即释放，端口上没有监听者
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let poller = ServerPoller::new(descriptor(port), PollSettings::default());
        assert_eq!(poller.phase(), PollPhase::Init);
        let outcome = poller.poll(0).await;
        assert!(matches!(
            outcome.failure(),
            Some(PollFailure::Transport { phase: PollPhase::Connecting, .. })
        ));
    }
}
