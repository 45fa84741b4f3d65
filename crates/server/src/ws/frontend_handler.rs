/// 前端 WebSocket 连接处理器
///
/// 向前端推送发现进度、新节点与任务结束事件。连接可以订阅单个任务，只接收该任务的事件。

use async_trait::async_trait;
use axum::extract::ws::{Message as AxumWsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::discovery::events::{
    DiscoveryCompleted, DiscoveryEvent, DiscoveryProgress, EventSink, NodeDiscovered,
};

/// 前端连接信息
#[derive(Debug)]
pub struct FrontendConnection {
    /// 连接 ID
    pub connection_id: String,

    /// 发送消息的通道
    pub sender: mpsc::UnboundedSender<FrontendMessage>,

    /// 只接收该任务的事件，`None` 表示接收全部
    task_filter: StdRwLock<Option<String>>,

    /// 连接时间
    pub connected_at: chrono::DateTime<chrono::Utc>,
}

impl FrontendConnection {
    pub fn subscribe(&self, task_id: Option<String>) {
        *self
            .task_filter
            .write()
            .unwrap_or_else(PoisonError::into_inner) = task_id;
    }

    fn wants(&self, message: &FrontendMessage) -> bool {
        let filter = self
            .task_filter
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match (filter.as_deref(), message.task_id()) {
            (Some(wanted), Some(task_id)) => wanted == task_id,
            _ => true,
        }
    }
}

/// 前端消息类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FrontendMessage {
    /// 扫描进度
    DiscoveryProgress(DiscoveryProgress),
    /// 发现新节点
    NodeDiscovered(NodeDiscovered),
    /// 扫描结束（完成、失败或取消）
    DiscoveryCompleted(DiscoveryCompleted),
    /// 心跳响应
    Pong { timestamp: i64 },
}

impl FrontendMessage {
    fn task_id(&self) -> Option<&str> {
        match self {
            FrontendMessage::DiscoveryProgress(e) => Some(&e.task_id),
            FrontendMessage::NodeDiscovered(e) => Some(&e.task_id),
            FrontendMessage::DiscoveryCompleted(e) => Some(&e.task_id),
            FrontendMessage::Pong { .. } => None,
        }
    }
}

impl From<DiscoveryEvent> for FrontendMessage {
    fn from(event: DiscoveryEvent) -> Self {
        match event {
            DiscoveryEvent::DiscoveryProgress(e) => FrontendMessage::DiscoveryProgress(e),
            DiscoveryEvent::NodeDiscovered(e) => FrontendMessage::NodeDiscovered(e),
            DiscoveryEvent::DiscoveryCompleted(e) => FrontendMessage::DiscoveryCompleted(e),
        }
    }
}

/// 前端发来的控制消息
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FrontendRequest {
    Ping,
    Subscribe { task_id: String },
    Unsubscribe,
}

/// 前端连接管理器
#[derive(Clone)]
pub struct FrontendConnectionManager {
    /// 所有连接的映射：connection_id -> FrontendConnection
    connections: Arc<RwLock<HashMap<String, Arc<FrontendConnection>>>>,
}

impl FrontendConnectionManager {
    /// 创建新的连接管理器
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 注册新的前端连接
    pub async fn register(
        &self,
        connection_id: String,
        sender: mpsc::UnboundedSender<FrontendMessage>,
    ) -> Arc<FrontendConnection> {
        let connection = Arc::new(FrontendConnection {
            connection_id: connection_id.clone(),
            sender,
            task_filter: StdRwLock::new(None),
            connected_at: chrono::Utc::now(),
        });

        let mut connections = self.connections.write().await;
        connections.insert(connection_id.clone(), connection.clone());

        info!("前端连接已注册: {}", connection_id);
        connection
    }

    /// 注销前端连接
    pub async fn unregister(&self, connection_id: &str) {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.remove(connection_id) {
            let seconds = (chrono::Utc::now() - conn.connected_at).num_seconds();
            info!("前端连接已注销: {} (在线 {}s)", connection_id, seconds);
        }
    }

    /// 获取连接数量
    pub async fn count(&self) -> usize {
        let connections = self.connections.read().await;
        connections.len()
    }

    /// 向所有关心该消息的连接广播，返回成功发送的连接数
    pub async fn send_to_all(&self, message: FrontendMessage) -> usize {
        let connections = self.connections.read().await;
        let mut count = 0;

        for (connection_id, conn) in connections.iter() {
            if !conn.wants(&message) {
                continue;
            }
            if let Err(e) = conn.sender.send(message.clone()) {
                warn!("向前端连接 {} 发送消息失败: {}", connection_id, e);
            } else {
                count += 1;
            }
        }

        debug!("广播消息已发送到 {} 个前端连接", count);
        count
    }
}

impl Default for FrontendConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for FrontendConnectionManager {
    async fn broadcast(&self, event: DiscoveryEvent) -> usize {
        debug!(task_id = %event.task_id(), "推送发现事件");
        self.send_to_all(event.into()).await
    }
}

/// WebSocket 升级处理器
pub async fn handle_frontend_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_frontend_connection(socket, state))
}

/// 处理前端 WebSocket 连接
async fn handle_frontend_connection(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    info!("新的前端 WebSocket 连接: {}", connection_id);

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // 创建消息发送通道
    let (tx, mut rx) = mpsc::unbounded_channel::<FrontendMessage>();

    let manager = state.frontend_manager();
    let connection = manager.register(connection_id.clone(), tx).await;

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = send_frontend_message(&mut ws_sender, msg).await {
                error!("发送前端消息失败: {}", e);
                break;
            }
        }
        debug!("前端消息发送任务结束");
    });

    let connection_clone = connection.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(AxumWsMessage::Close(_)) => break,
                Ok(msg) => handle_frontend_incoming_message(msg, &connection_clone),
                Err(e) => {
                    error!("接收前端消息错误: {}", e);
                    break;
                }
            }
        }
        debug!("前端消息接收任务结束");
    });

    // 等待任一任务完成
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    manager.unregister(&connection_id).await;
    info!("前端连接已关闭: {}", connection_id);
}

/// 处理收到的前端消息
fn handle_frontend_incoming_message(ws_msg: AxumWsMessage, connection: &FrontendConnection) {
    let AxumWsMessage::Text(text) = ws_msg else {
        return;
    };

    match serde_json::from_str::<FrontendRequest>(&text) {
        Ok(FrontendRequest::Ping) => {
            let pong = FrontendMessage::Pong {
                timestamp: chrono::Utc::now().timestamp(),
            };
            if let Err(e) = connection.sender.send(pong) {
                warn!("发送心跳响应失败: {}", e);
            }
        }
        Ok(FrontendRequest::Subscribe { task_id }) => {
            debug!("前端连接 {} 订阅任务 {}", connection.connection_id, task_id);
            connection.subscribe(Some(task_id));
        }
        Ok(FrontendRequest::Unsubscribe) => connection.subscribe(None),
        Err(e) => debug!("忽略无法识别的前端消息: {} ({})", text, e),
    }
}

/// 发送前端消息
async fn send_frontend_message(
    sender: &mut futures_util::stream::SplitSink<WebSocket, AxumWsMessage>,
    msg: FrontendMessage,
) -> Result<(), String> {
    let json = serde_json::to_string(&msg)
        .map_err(|e| format!("序列化前端消息失败: {}", e))?;

    sender
        .send(AxumWsMessage::Text(json))
        .await
        .map_err(|e| format!("发送前端 WebSocket 消息失败: {}", e))?;

    Ok(())
}
