/// WebSocket RPC 模块
///
/// 与 Agent 通信使用的 JSON RPC 协议及一次性调用客户端

pub mod message;
pub mod error;
pub mod types;
pub mod client;

pub use message::{RpcMessage, MessageType};
pub use error::{RpcError, RpcErrorCode};
pub use client::AgentRpcClient;
pub use types::*;
