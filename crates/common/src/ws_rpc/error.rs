/// WebSocket RPC 错误定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// RPC 错误码
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RpcErrorCode {
    // 通用错误
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    Timeout,
    SerializationError,

    // 连接错误
    InvalidEndpoint,
    ConnectionRefused,
    ConnectionClosed,
    NetworkError,

    // 认证错误
    Unauthorized,
}

impl RpcErrorCode {
    /// 转换为字符串码
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::InternalError => "INTERNAL_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::SerializationError => "SERIALIZATION_ERROR",

            Self::InvalidEndpoint => "INVALID_ENDPOINT",
            Self::ConnectionRefused => "CONNECTION_REFUSED",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::NetworkError => "NETWORK_ERROR",

            Self::Unauthorized => "UNAUTHORIZED",
        }
    }

    /// 从对端返回的字符串码解析，未知码视为内部错误
    pub fn from_wire(code: &str) -> Self {
        match code {
            "INVALID_REQUEST" => Self::InvalidRequest,
            "METHOD_NOT_FOUND" => Self::MethodNotFound,
            "INVALID_PARAMS" => Self::InvalidParams,
            "TIMEOUT" => Self::Timeout,
            "SERIALIZATION_ERROR" => Self::SerializationError,
            "UNAUTHORIZED" | "FORBIDDEN" => Self::Unauthorized,
            _ => Self::InternalError,
        }
    }
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// RPC 错误
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: RpcErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_endpoint(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidEndpoint, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::Timeout, message)
    }

    pub fn connection_closed() -> Self {
        Self::new(RpcErrorCode::ConnectionClosed, "连接已关闭")
    }

    pub fn serialization_error(err: impl fmt::Display) -> Self {
        Self::new(
            RpcErrorCode::SerializationError,
            format!("序列化错误: {}", err),
        )
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_error(err)
    }
}

impl From<RpcError> for crate::Error {
    fn from(err: RpcError) -> Self {
        crate::Error::Network(err.to_string())
    }
}
