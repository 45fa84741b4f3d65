/// 发现过程事件
///
/// 由编排器发出，经 `EventSink` 推送给实时订阅方，不保证送达

use async_trait::async_trait;
use common::models::{DiscoveryStatus, DiscoveryTask, ProgressSnapshot};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryProgress {
    pub task_id: String,
    pub scanned: u64,
    pub total: u64,
    pub found: u64,
    pub failed: u64,
    pub percent: f64,
}

impl DiscoveryProgress {
    pub fn new(task_id: &str, snapshot: ProgressSnapshot) -> Self {
        Self {
            task_id: task_id.to_string(),
            scanned: snapshot.scanned,
            total: snapshot.total,
            found: snapshot.found,
            failed: snapshot.failed,
            percent: snapshot.percent(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDiscovered {
    pub task_id: String,
    pub ip: String,
    pub port: u16,
    pub node_name: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryCompleted {
    pub task_id: String,
    pub status: DiscoveryStatus,
    pub total: u64,
    pub found: u64,
    pub duration_seconds: f64,
}

impl From<&DiscoveryTask> for DiscoveryCompleted {
    fn from(task: &DiscoveryTask) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            total: task.total_ips,
            found: task.found_nodes,
            duration_seconds: task.duration_seconds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DiscoveryEvent {
    DiscoveryProgress(DiscoveryProgress),
    NodeDiscovered(NodeDiscovered),
    DiscoveryCompleted(DiscoveryCompleted),
}

impl DiscoveryEvent {
    pub fn task_id(&self) -> &str {
        match self {
            DiscoveryEvent::DiscoveryProgress(e) => &e.task_id,
            DiscoveryEvent::NodeDiscovered(e) => &e.task_id,
            DiscoveryEvent::DiscoveryCompleted(e) => &e.task_id,
        }
    }
}

/// 实时事件出口
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    /// 发后即忘，返回收到事件的订阅方数量
    async fn broadcast(&self, event: DiscoveryEvent) -> usize;
}
