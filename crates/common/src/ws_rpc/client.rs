/// WebSocket RPC 客户端
///
/// 以 HTTP Basic 认证连接 Agent，发送单个请求并等待对应响应

use super::{RpcError, RpcErrorCode, RpcMessage};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::debug;

/// Agent RPC 客户端
#[derive(Debug, Clone)]
pub struct AgentRpcClient {
    url: String,
    authorization: HeaderValue,
}

impl AgentRpcClient {
    /// 为 `ip:port` 上的 Agent 构造客户端
    pub fn new(addr: SocketAddr, username: &str, password: &str) -> Result<Self, RpcError> {
        Self::with_url(format!("ws://{}/", addr), username, password)
    }

    /// 使用完整 URL 构造客户端，URL 非法时立即失败
    pub fn with_url(
        url: impl Into<String>,
        username: &str,
        password: &str,
    ) -> Result<Self, RpcError> {
        let url = url.into();
        url.as_str()
            .into_client_request()
            .map_err(|e| RpcError::invalid_endpoint(format!("无效的 Agent 地址 {}: {}", url, e)))?;

        let token = STANDARD.encode(format!("{}:{}", username, password));
        let authorization = HeaderValue::from_str(&format!("Basic {}", token))
            .map_err(|e| RpcError::invalid_endpoint(format!("无效的认证信息: {}", e)))?;

        Ok(Self { url, authorization })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// 发送请求并等待响应（带超时）
    pub async fn call(
        &self,
        method: impl Into<String>,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<RpcMessage, RpcError> {
        let method = method.into();
        match tokio::time::timeout(timeout, self.call_once(&method, payload)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::timeout(format!(
                "请求超时: {} {} ({:?})",
                self.url, method, timeout
            ))),
        }
    }

    async fn call_once(
        &self,
        method: &str,
        payload: serde_json::Value,
    ) -> Result<RpcMessage, RpcError> {
        let request = self.build_request()?;
        let (mut ws, _) = connect_async(request).await.map_err(map_ws_error)?;

        let msg = RpcMessage::request(method, payload);
        let request_id = msg.id.clone();
        ws.send(codec::encode(&msg)?).await.map_err(map_ws_error)?;

        let result = loop {
            match ws.next().await {
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                Some(Ok(frame)) => match codec::decode(frame) {
                    Ok(reply) if reply.is_response_to(&request_id) => break reply.into_result(),
                    Ok(other) => {
                        debug!("忽略无关消息: id={}, type={:?}", other.id, other.message_type);
                    }
                    Err(e) => break Err(e),
                },
                Some(Err(e)) => break Err(map_ws_error(e)),
                None => break Err(RpcError::connection_closed()),
            }
        };

        let _ = ws.close(None).await;
        result
    }

    fn build_request(&self) -> Result<Request, RpcError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RpcError::invalid_endpoint(e.to_string()))?;
        request
            .headers_mut()
            .insert(AUTHORIZATION, self.authorization.clone());
        Ok(request)
    }
}

/// 将底层 WebSocket 错误归类为 RPC 错误码
fn map_ws_error(err: WsError) -> RpcError {
    match err {
        WsError::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            RpcError::new(RpcErrorCode::ConnectionRefused, e.to_string())
        }
        WsError::Http(resp)
            if resp.status() == StatusCode::UNAUTHORIZED || resp.status() == StatusCode::FORBIDDEN =>
        {
            RpcError::new(
                RpcErrorCode::Unauthorized,
                format!("握手被拒绝: {}", resp.status()),
            )
        }
        WsError::Url(e) => RpcError::invalid_endpoint(e.to_string()),
        WsError::ConnectionClosed | WsError::AlreadyClosed => RpcError::connection_closed(),
        other => RpcError::new(RpcErrorCode::NetworkError, other.to_string()),
    }
}

/// 消息编解码辅助函数
pub mod codec {
    use super::*;

    /// 编码 RPC 消息为 WebSocket 消息
    pub fn encode(msg: &RpcMessage) -> Result<WsMessage, RpcError> {
        let json = msg.to_json()?;
        Ok(WsMessage::Text(json))
    }

    /// 解码 WebSocket 消息为 RPC 消息
    pub fn decode(ws_msg: WsMessage) -> Result<RpcMessage, RpcError> {
        match ws_msg {
            WsMessage::Text(text) => RpcMessage::from_json(&text).map_err(RpcError::from),
            WsMessage::Binary(data) => {
                let text = String::from_utf8(data).map_err(RpcError::serialization_error)?;
                RpcMessage::from_json(&text).map_err(RpcError::from)
            }
            WsMessage::Close(_) => Err(RpcError::connection_closed()),
            _ => Err(RpcError::new(
                RpcErrorCode::InvalidRequest,
                "不支持的 WebSocket 消息类型",
            )),
        }
    }
}
