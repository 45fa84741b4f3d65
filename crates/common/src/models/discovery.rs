use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DiscoveryStatus, NodeStatus, ProbeStatus};
use crate::errors::{Error, Result};

/// 发现任务进度快照
///
/// 三个计数器总是一起读取、一起写入
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub scanned: u64,
    pub found: u64,
    pub failed: u64,
}

impl ProgressSnapshot {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// 记录一个探测结果
    pub fn record(&mut self, status: ProbeStatus) {
        self.scanned += 1;
        if status.is_success() {
            self.found += 1;
        } else {
            self.failed += 1;
        }
    }

    /// 完成百分比，限制在 [0, 100]
    pub fn percent(&self) -> f64 {
        crate::utils::percent(self.scanned, self.total)
    }

    pub fn is_finished(&self) -> bool {
        self.scanned >= self.total
    }
}

/// 发现任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryTask {
    pub id: String,

    // 创建后不可变的输入
    pub cidr: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    pub timeout_secs: u64,
    pub max_workers: u32,
    pub created_by: String,

    pub status: DiscoveryStatus,
    pub total_ips: u64,
    pub scanned_ips: u64,
    pub found_nodes: u64,
    pub failed_ips: u64,
    pub error_msg: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DiscoveryTask {
    pub fn progress(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total_ips,
            scanned: self.scanned_ips,
            found: self.found_nodes,
            failed: self.failed_ips,
        }
    }

    /// 写入计数器，终态任务拒绝修改
    pub fn apply_progress(&mut self, snapshot: ProgressSnapshot) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "任务 {} 已处于终态 {}",
                self.id, self.status
            )));
        }
        self.scanned_ips = snapshot.scanned;
        self.found_nodes = snapshot.found;
        self.failed_ips = snapshot.failed;
        Ok(())
    }

    /// 按迁移表切换状态，并维护时间戳
    pub fn transition(&mut self, next: DiscoveryStatus, now: DateTime<Utc>) -> Result<()> {
        self.status = self.status.transition_to(next)?;
        match next {
            DiscoveryStatus::Running => self.started_at = Some(now),
            DiscoveryStatus::Completed | DiscoveryStatus::Failed | DiscoveryStatus::Cancelled => {
                self.completed_at = Some(now)
            }
            DiscoveryStatus::Pending => {}
        }
        Ok(())
    }

    /// 迁移到 failed 并记录原因
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(DiscoveryStatus::Failed, now)?;
        self.error_msg = Some(message.into());
        Ok(())
    }

    /// 运行时长（秒），未开始时为 0
    pub fn duration_seconds(&self) -> f64 {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as f64 / 1000.0,
            (Some(start), None) => (Utc::now() - start).num_milliseconds().max(0) as f64 / 1000.0,
            _ => 0.0,
        }
    }
}

/// 单个地址的探测记录，只追加不修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub id: String,
    pub task_id: String,
    pub ip: String,
    pub port: u16,
    pub status: ProbeStatus,
    pub version: Option<String>,
    pub error_msg: Option<String>,
    pub duration_ms: u64,
    pub node_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 受管节点（发现流程关心的字段）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    pub status: NodeStatus,
    pub version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 审计/系统事件日志
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLog {
    pub id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub actor: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
