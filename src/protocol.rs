//! TRTP 二进制协议
//!
//! 通信方式：TCP，所有整数为大端序。
//!
//! ```text
//! 握手:    "TRTPHOTL" | version(2) | sub-version(2)            -> 12 字节
//! 握手回复: "TRTP"     | error code(4)                         -> 8 字节
//! 消息:    type(4) | transaction id(4) | flags(4) | len(4) | payload(len)
//! 字段:    type(2) | len(2) | value(len)
//! ```
//!
//! 本模块只负责字节编解码和单个会话的收发，不涉及服务器目录或存储。

use crate::error::{Error, Result};
use crate::types::ObservedUser;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// 握手包
pub const HANDSHAKE: [u8; 12] = *b"TRTPHOTL\x00\x01\x00\x02";

/// 握手回复魔数
pub const HANDSHAKE_REPLY_MAGIC: &[u8; 4] = b"TRTP";

/// 握手回复长度
pub const HANDSHAKE_REPLY_LEN: usize = 8;

/// 消息头长度
pub const HEADER_LEN: usize = 16;

/// 登录回复中 result code 的偏移（紧跟消息头）
pub const RESULT_CODE_OFFSET: usize = HEADER_LEN;

/// 单帧 payload 上限
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// 登录
pub const TRAN_LOGIN: u32 = 0x0000_006B;

/// 获取在线连接列表
pub const TRAN_GET_USER_LIST: u32 = 0x0000_0069;

/// 字段：用户图标 ID（定长 2 字节）
pub const FIELD_USER_ICON_ID: u16 = 0x0065;

/// 字段：用户名（变长）
pub const FIELD_USER_NAME: u16 = 0x0066;

/// 登录回复状态：错误（需再看 result code）
pub const LOGIN_STATUS_ERROR: u32 = 0x0000_0000;

/// 登录回复状态：成功
pub const LOGIN_STATUS_SUCCESS: u32 = 0x0000_0001;

const READ_CHUNK: usize = 4096;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    let bytes: [u8; 2] = buf.get(at..at + 2)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

// ==================== Field ====================

/// payload 中的一个字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// 定长 2 字节数值（如图标 ID）
    Fixed { code: u16, value: u16 },
    /// 变长字节（如 UTF-8 用户名）
    Variable { code: u16, value: Vec<u8> },
}

impl Field {
    pub fn user_icon_id(icon_id: u16) -> Self {
        Field::Fixed {
            code: FIELD_USER_ICON_ID,
            value: icon_id,
        }
    }

    pub fn user_name(name: &str) -> Self {
        Field::Variable {
            code: FIELD_USER_NAME,
            value: name.as_bytes().to_vec(),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Field::Fixed { code, .. } | Field::Variable { code, .. } => *code,
        }
    }

    /// 编码后的总长度（含 4 字节字段头）
    pub fn encoded_len(&self) -> usize {
        match self {
            Field::Fixed { .. } => 4 + 2,
            Field::Variable { value, .. } => 4 + value.len(),
        }
    }

    /// 追加编码到 buf
    ///
    /// 变长值超过 u16 上限时返回协议错误
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Field::Fixed { code, value } => {
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(&2u16.to_be_bytes());
                buf.extend_from_slice(&value.to_be_bytes());
            }
            Field::Variable { code, value } => {
                let len = u16::try_from(value.len()).map_err(|_| {
                    Error::Protocol(format!("字段 {:#06x} 过长: {} 字节", code, value.len()))
                })?;
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(&len.to_be_bytes());
                buf.extend_from_slice(value);
            }
        }
        Ok(())
    }

    /// 从 buf 头部解码一个字段，返回字段与消耗的字节数
    pub fn decode(buf: &[u8]) -> Result<(Field, usize)> {
        let (code, len) = match (read_u16(buf, 0), read_u16(buf, 2)) {
            (Some(code), Some(len)) => (code, len as usize),
            _ => return Err(Error::Protocol(format!("字段头不完整: {} 字节", buf.len()))),
        };

        let value = buf.get(4..4 + len).ok_or_else(|| {
            Error::Protocol(format!(
                "字段 {:#06x} 被截断: 声明 {} 字节, 实际 {} 字节",
                code,
                len,
                buf.len().saturating_sub(4)
            ))
        })?;

        let field = match (code, value) {
            (FIELD_USER_ICON_ID, [hi, lo]) => Field::Fixed {
                code,
                value: u16::from_be_bytes([*hi, *lo]),
            },
            _ => Field::Variable {
                code,
                value: value.to_vec(),
            },
        };

        Ok((field, 4 + len))
    }
}

/// 按顺序拼接字段
pub fn encode_fields(fields: &[Field]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(fields.iter().map(Field::encoded_len).sum());
    for field in fields {
        field.encode_into(&mut buf)?;
    }
    Ok(buf)
}

/// 遍历 payload 中的全部字段
pub fn decode_fields(payload: &[u8]) -> Result<Vec<Field>> {
    let mut fields = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        let (field, used) = Field::decode(&payload[offset..])?;
        fields.push(field);
        offset += used;
    }
    Ok(fields)
}

/// 从连接列表 payload 解析在线用户
///
/// 每个用户名字段开启一个新用户；图标字段归属当前未设置图标的用户，
/// 否则归属下一个用户。未知字段忽略。
pub fn decode_user_list(payload: &[u8]) -> Result<Vec<ObservedUser>> {
    let mut users = Vec::new();
    let mut current: Option<(ObservedUser, bool)> = None;
    let mut pending_icon: Option<u16> = None;

    for field in decode_fields(payload)? {
        match field {
            Field::Variable {
                code: FIELD_USER_NAME,
                value,
            } => {
                if let Some((user, _)) = current.take() {
                    users.push(user);
                }
                let has_icon = pending_icon.is_some();
                current = Some((
                    ObservedUser {
                        name: String::from_utf8_lossy(&value).into_owned(),
                        icon_id: pending_icon.take().unwrap_or(0),
                    },
                    has_icon,
                ));
            }
            Field::Fixed {
                code: FIELD_USER_ICON_ID,
                value,
            } => match current.as_mut() {
                Some((user, has_icon)) if !*has_icon => {
                    user.icon_id = value;
                    *has_icon = true;
                }
                _ => {
                    if let Some((user, _)) = current.take() {
                        users.push(user);
                    }
                    pending_icon = Some(value);
                }
            },
            other => {
                tracing::trace!("忽略字段 {:#06x}", other.code());
            }
        }
    }

    if let Some((user, _)) = current.take() {
        users.push(user);
    }

    Ok(users)
}

// ==================== Message ====================

/// 消息头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: u32,
    pub transaction_id: u32,
    pub flags: u32,
    pub payload_len: u32,
}

impl MessageHeader {
    /// 解析消息头，不足 16 字节返回 None
    pub fn parse(buf: &[u8]) -> Option<Self> {
        Some(Self {
            kind: read_u32(buf, 0)?,
            transaction_id: read_u32(buf, 4)?,
            flags: read_u32(buf, 8)?,
            payload_len: read_u32(buf, 12)?,
        })
    }
}

/// 一条完整消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub kind: u32,
    pub transaction_id: u32,
    pub flags: u32,
    pub payload: Vec<u8>,
}

impl ProtocolMessage {
    /// 登录消息：图标字段 + 用户名字段，transaction id 与 flags 均为 0
    pub fn login(username: &str, icon_id: u16) -> Result<Self> {
        let payload = encode_fields(&[Field::user_icon_id(icon_id), Field::user_name(username)])?;
        Ok(Self {
            kind: TRAN_LOGIN,
            transaction_id: 0,
            flags: 0,
            payload,
        })
    }

    /// 无 payload 的事务请求
    pub fn request(kind: u32, transaction_id: u32) -> Self {
        Self {
            kind,
            transaction_id,
            flags: 0,
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.kind.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// 从缓冲区头部取出一条完整消息
    ///
    /// 数据不足返回 `Ok(None)`；payload 长度超限返回协议错误。
    pub fn try_decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let header = match MessageHeader::parse(buf) {
            Some(h) => h,
            None => return Ok(None),
        };
        if header.payload_len > MAX_PAYLOAD_LEN {
            return Err(Error::Protocol(format!(
                "payload 长度 {} 超过上限 {}",
                header.payload_len, MAX_PAYLOAD_LEN
            )));
        }

        let total = HEADER_LEN + header.payload_len as usize;
        if buf.len() < total {
            return Ok(None);
        }

        Ok(Some((
            Self {
                kind: header.kind,
                transaction_id: header.transaction_id,
                flags: header.flags,
                payload: buf[HEADER_LEN..total].to_vec(),
            },
            total,
        )))
    }
}

// ==================== Login ====================

/// 登录被拒原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginRejection {
    /// 发送登录后对端立即关闭连接
    ConnectionClosed,
    /// 错误状态 + 非零 result code
    ResultCode(u32),
}

/// 登录回复分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginResponse {
    /// `acknowledged = false` 表示短超时内无回包但连接仍在（默认接受）
    Accepted { acknowledged: bool },
    Rejected(LoginRejection),
}

impl LoginResponse {
    pub fn is_accepted(&self) -> bool {
        matches!(self, LoginResponse::Accepted { .. })
    }
}

/// 对登录后第一次读到的字节分类
///
/// 空字节视为对端关闭。回复过短、缺少 result code 时按 0 处理。
pub fn classify_login_reply(bytes: &[u8]) -> LoginResponse {
    if bytes.is_empty() {
        return LoginResponse::Rejected(LoginRejection::ConnectionClosed);
    }

    match read_u32(bytes, 0) {
        Some(LOGIN_STATUS_ERROR) => {
            let result_code = read_u32(bytes, RESULT_CODE_OFFSET).unwrap_or(0);
            if result_code != 0 {
                LoginResponse::Rejected(LoginRejection::ResultCode(result_code))
            } else {
                LoginResponse::Accepted { acknowledged: true }
            }
        }
        Some(LOGIN_STATUS_SUCCESS) => LoginResponse::Accepted { acknowledged: true },
        other => {
            tracing::debug!("登录回复状态未知 {:?}，按接受处理", other);
            LoginResponse::Accepted { acknowledged: true }
        }
    }
}

// ==================== Session ====================

fn timeout_error(phase: &'static str, limit: Duration) -> Error {
    Error::Timeout {
        phase,
        timeout_ms: limit.as_millis() as u64,
    }
}

/// 单个连接上的协议会话
///
/// 持有传输层和本会话的 transaction id 计数器（从 1 开始）。
pub struct ProtocolSession<S> {
    stream: S,
    next_transaction_id: u32,
    /// 已读取但尚未成帧的字节
    buf: Vec<u8>,
}

impl<S> ProtocolSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            next_transaction_id: 1,
            buf: Vec::new(),
        }
    }

    /// 下一个请求将使用的 transaction id
    pub fn peek_transaction_id(&self) -> u32 {
        self.next_transaction_id
    }

    fn take_transaction_id(&mut self) -> u32 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1).max(1);
        id
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await.map_err(Error::Transport)?;
        self.stream.flush().await.map_err(Error::Transport)
    }

    /// 发送握手并读取 8 字节回复
    pub async fn handshake(&mut self, limit: Duration) -> Result<()> {
        tokio::time::timeout(limit, self.handshake_inner())
            .await
            .map_err(|_| timeout_error("handshake", limit))?
    }

    async fn handshake_inner(&mut self) -> Result<()> {
        self.write_all(&HANDSHAKE).await?;

        let mut reply = [0u8; HANDSHAKE_REPLY_LEN];
        let mut filled = 0;
        while filled < reply.len() {
            let n = self
                .stream
                .read(&mut reply[filled..])
                .await
                .map_err(Error::Transport)?;
            if n == 0 {
                return Err(Error::Protocol(if filled == 0 {
                    "握手阶段对端关闭连接".to_string()
                } else {
                    format!("握手回复被截断: {} 字节", filled)
                }));
            }
            filled += n;
        }

        if &reply[..4] != HANDSHAKE_REPLY_MAGIC {
            return Err(Error::Protocol(format!(
                "握手回复魔数错误: {:02x?}",
                &reply[..4]
            )));
        }
        match read_u32(&reply, 4) {
            Some(0) => Ok(()),
            code => Err(Error::Protocol(format!("握手被拒: error code {:?}", code))),
        }
    }

    /// 发送登录并在短超时内分类回复
    ///
    /// 写入与读取共用同一个截止时间。截止时一个字节都没收到且连接未关闭视为接受；
    /// 收到了不完整的回复则是协议错误。读到的字节保留在缓冲区中，
    /// 后续成帧时按 transaction id 跳过。
    pub async fn login(&mut self, username: &str, icon_id: u16, limit: Duration) -> Result<LoginResponse> {
        let message = ProtocolMessage::login(username, icon_id)?;
        let deadline = Instant::now() + limit;

        tokio::time::timeout_at(deadline, self.write_all(&message.encode()))
            .await
            .map_err(|_| timeout_error("login", limit))??;

        let reply = tokio::time::timeout_at(deadline, self.read_login_reply()).await;
        match reply {
            Ok(response) => response,
            Err(_) if self.buf.is_empty() => Ok(LoginResponse::Accepted {
                acknowledged: false,
            }),
            Err(_) => Err(Error::Protocol(format!(
                "登录回复不完整: {} 字节",
                self.buf.len()
            ))),
        }
    }

    /// 读到足以分类的字节为止
    ///
    /// 先凑齐 4 字节状态；错误状态还要等到 result code，
    /// 除非消息头声明的 payload 放不下它。
    async fn read_login_reply(&mut self) -> Result<LoginResponse> {
        loop {
            if let Some(status) = read_u32(&self.buf, 0) {
                let code_missing = MessageHeader::parse(&self.buf)
                    .is_some_and(|h| (h.payload_len as usize) < 4);
                if status != LOGIN_STATUS_ERROR
                    || code_missing
                    || self.buf.len() >= RESULT_CODE_OFFSET + 4
                {
                    return Ok(classify_login_reply(&self.buf));
                }
            }

            if self.fill_buf().await? == 0 {
                return Ok(LoginResponse::Rejected(LoginRejection::ConnectionClosed));
            }
        }
    }

    /// 发送无 payload 的事务请求，返回使用的 transaction id
    pub async fn send_transaction(&mut self, kind: u32) -> Result<u32> {
        let id = self.take_transaction_id();
        let message = ProtocolMessage::request(kind, id);
        self.write_all(&message.encode()).await?;
        Ok(id)
    }

    /// 读一次传输层追加到缓冲区，返回读到的字节数
    async fn fill_buf(&mut self) -> Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self
            .stream
            .read(&mut chunk)
            .await
            .map_err(Error::Transport)?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// 读取一条完整消息（按 payload 长度成帧）
    async fn read_message(&mut self) -> Result<ProtocolMessage> {
        loop {
            if let Some((message, used)) = ProtocolMessage::try_decode(&self.buf)? {
                self.buf.drain(..used);
                return Ok(message);
            }

            if self.fill_buf().await? == 0 {
                return Err(Error::Protocol(if self.buf.is_empty() {
                    "等待回复时对端关闭连接".to_string()
                } else {
                    format!("消息被截断: 已收到 {} 字节", self.buf.len())
                }));
            }
        }
    }

    async fn wait_reply(&mut self, transaction_id: u32) -> Result<ProtocolMessage> {
        loop {
            let message = self.read_message().await?;
            if message.transaction_id == transaction_id {
                return Ok(message);
            }
            tracing::trace!(
                "跳过消息 type={:#x} id={} ({} 字节)",
                message.kind,
                message.transaction_id,
                message.payload.len()
            );
        }
    }

    /// 读取指定 transaction id 的回复，其他消息跳过
    pub async fn read_reply(&mut self, transaction_id: u32, limit: Duration) -> Result<ProtocolMessage> {
        tokio::time::timeout(limit, self.wait_reply(transaction_id))
            .await
            .map_err(|_| timeout_error("query", limit))?
    }

    /// 请求在线连接列表并等待回复；发送与等待共用 `limit`
    pub async fn request_user_list(&mut self, limit: Duration) -> Result<ProtocolMessage> {
        tokio::time::timeout(limit, async {
            let id = self.send_transaction(TRAN_GET_USER_LIST).await?;
            self.wait_reply(id).await
        })
        .await
        .map_err(|_| timeout_error("query", limit))?
    }

    /// 关闭传输层
    pub async fn close(mut self) {
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.stream.shutdown()).await;
    }
}
