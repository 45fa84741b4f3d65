/// WebSocket 模块
///
/// 管理前端客户端的 WebSocket 连接，并作为发现事件的推送出口

pub mod frontend_handler;

pub use frontend_handler::{handle_frontend_websocket, FrontendConnectionManager, FrontendMessage};
