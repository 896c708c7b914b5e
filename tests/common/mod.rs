//! 测试用的进程内 TRTP 服务器

#![allow(dead_code)]

use hotline_mirror::protocol::{
    encode_fields, Field, ProtocolMessage, HEADER_LEN, LOGIN_STATUS_ERROR, LOGIN_STATUS_SUCCESS,
};
use hotline_mirror::{PollSettings, PollTimeouts, ServerDescriptor};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

/// 服务器在每个连接上的行为
#[derive(Debug, Clone)]
pub enum Script {
    /// 登录成功后返回用户列表
    Users(Vec<(&'static str, u16)>),
    /// 先发一条无关消息，再把回复拆成多次写入
    UsersFragmented(Vec<(&'static str, u16)>),
    /// 不回复登录，但之后正常返回用户列表
    SilentLogin(Vec<(&'static str, u16)>),
    /// 读到登录后关闭连接
    CloseAfterLogin,
    /// 以错误状态和 result code 拒绝登录
    RejectLogin(u32),
    /// 收到用户列表请求后不回复
    NeverAnswerQuery,
    /// 握手回复非零错误码
    RejectHandshake,
    /// 读到握手后不回复
    SilentHandshake,
}

pub fn settings() -> PollSettings {
    PollSettings {
        username: "Guest".into(),
        icon_id: 200,
        timeouts: PollTimeouts {
            connect_ms: 1_000,
            handshake_ms: 1_000,
            login_ms: 200,
            query_ms: 500,
        },
    }
}

pub fn descriptor(unique_id: &str, port: u16, user_count: i64) -> ServerDescriptor {
    ServerDescriptor {
        unique_id: unique_id.into(),
        name: format!("Server {}", unique_id),
        description: Some("test server".into()),
        ip: "127.0.0.1".into(),
        port,
        user_count,
        server_type: None,
        filtered: Some(false),
        filtered_by: None,
        last_checked_in: None,
        mirror_sources: vec!["tracker.test".into()],
    }
}

/// 返回一个没有监听者的端口
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// 启动服务器，逐个连接执行同一脚本；返回监听端口
pub async fn spawn_server(script: Script) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let script = script.clone();
            tokio::spawn(async move {
                let _ = serve(stream, script).await;
            });
        }
    });

    port
}

/// 只接受一个连接；通道返回服务器是否看到客户端关闭连接
pub async fn spawn_observed_server(script: Script) -> (u16, oneshot::Receiver<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let closed = serve(stream, script).await.unwrap_or(false);
            let _ = tx.send(closed);
        }
    });

    (port, rx)
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<ProtocolMessage> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let mut payload = vec![0u8; u32::from_be_bytes([header[12], header[13], header[14], header[15]]) as usize];
    stream.read_exact(&mut payload).await?;
    Ok(ProtocolMessage {
        kind: u32::from_be_bytes([header[0], header[1], header[2], header[3]]),
        transaction_id: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
        flags: u32::from_be_bytes([header[8], header[9], header[10], header[11]]),
        payload,
    })
}

fn user_list_reply(request: &ProtocolMessage, users: &[(&str, u16)]) -> Vec<u8> {
    let fields: Vec<Field> = users
        .iter()
        .flat_map(|(name, icon)| [Field::user_icon_id(*icon), Field::user_name(name)])
        .collect();
    ProtocolMessage {
        kind: request.kind,
        transaction_id: request.transaction_id,
        flags: 0,
        payload: encode_fields(&fields).unwrap(),
    }
    .encode()
}

fn login_success() -> Vec<u8> {
    ProtocolMessage::request(LOGIN_STATUS_SUCCESS, 0).encode()
}

/// 执行脚本；返回是否在结束前读到客户端的 EOF
async fn serve(mut stream: TcpStream, script: Script) -> std::io::Result<bool> {
    let mut hello = [0u8; 12];
    stream.read_exact(&mut hello).await?;
    match script {
        Script::RejectHandshake => {
            stream.write_all(b"TRTP\x00\x00\x00\x01").await?;
            return Ok(false);
        }
        Script::SilentHandshake => return wait_for_close(&mut stream).await,
        _ => stream.write_all(b"TRTP\x00\x00\x00\x00").await?,
    }

    let _login = read_frame(&mut stream).await?;

    match script {
        Script::Users(users) => {
            stream.write_all(&login_success()).await?;
            let request = read_frame(&mut stream).await?;
            stream.write_all(&user_list_reply(&request, &users)).await?;
        }
        Script::UsersFragmented(users) => {
            stream.write_all(&login_success()).await?;
            let request = read_frame(&mut stream).await?;

            let noise = ProtocolMessage {
                kind: 0x012D,
                transaction_id: 99,
                flags: 0,
                payload: encode_fields(&[Field::user_name("broadcast")]).unwrap(),
            };
            stream.write_all(&noise.encode()).await?;

            let reply = user_list_reply(&request, &users);
            for piece in reply.chunks(5) {
                stream.write_all(piece).await?;
                stream.flush().await?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        Script::SilentLogin(users) => {
            let request = read_frame(&mut stream).await?;
            stream.write_all(&user_list_reply(&request, &users)).await?;
        }
        Script::CloseAfterLogin => return Ok(false),
        Script::RejectLogin(code) => {
            let reply = ProtocolMessage {
                kind: LOGIN_STATUS_ERROR,
                transaction_id: 0,
                flags: 0,
                payload: code.to_be_bytes().to_vec(),
            };
            stream.write_all(&reply.encode()).await?;
        }
        Script::NeverAnswerQuery => {
            stream.write_all(&login_success()).await?;
            let _request = read_frame(&mut stream).await?;
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Script::RejectHandshake | Script::SilentHandshake => unreachable!(),
    }

    wait_for_close(&mut stream).await
}

/// 等客户端先关闭
async fn wait_for_close(stream: &mut TcpStream) -> std::io::Result<bool> {
    let mut rest = Vec::new();
    match tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await {
        Ok(read) => read.map(|_| true),
        Err(_) => Ok(false),
    }
}
