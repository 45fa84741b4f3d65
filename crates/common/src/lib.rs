/// Supervisor Fleet - 公共库
///
/// 提供 Server 与 Agent 协议共享的类型、错误处理、工具函数等

pub mod errors;
pub mod models;
pub mod utils;
pub mod ws_rpc;

// 重新导出常用类型
pub use errors::{Error, Result};
pub use ws_rpc::{AgentRpcClient, RpcMessage, RpcError, RpcErrorCode, MessageType};
