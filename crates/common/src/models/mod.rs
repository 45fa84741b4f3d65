/// 共享数据模型
///
/// 定义发现任务、探测结果与节点的领域结构，以及状态机

mod discovery;

pub use discovery::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{Error, Result};

/// 发现任务状态
///
/// 合法迁移：`pending -> running -> {completed, failed, cancelled}`，
/// 以及 `pending -> failed`。终态不可再迁移。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl DiscoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryStatus::Pending => "pending",
            DiscoveryStatus::Running => "running",
            DiscoveryStatus::Completed => "completed",
            DiscoveryStatus::Failed => "failed",
            DiscoveryStatus::Cancelled => "cancelled",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DiscoveryStatus::Completed | DiscoveryStatus::Failed | DiscoveryStatus::Cancelled
        )
    }

    /// 迁移表
    pub fn can_transition_to(&self, next: DiscoveryStatus) -> bool {
        use DiscoveryStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    /// 校验并返回下一个状态
    pub fn transition_to(self, next: DiscoveryStatus) -> Result<DiscoveryStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }
}

impl fmt::Display for DiscoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscoveryStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DiscoveryStatus::Pending),
            "running" => Ok(DiscoveryStatus::Running),
            "completed" => Ok(DiscoveryStatus::Completed),
            "failed" => Ok(DiscoveryStatus::Failed),
            "cancelled" => Ok(DiscoveryStatus::Cancelled),
            other => Err(Error::Database(format!("未知的任务状态: {}", other))),
        }
    }
}

/// 单次探测的分类结果（封闭集合）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Success,
    Timeout,
    ConnectionRefused,
    AuthFailed,
    Error,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Success => "success",
            ProbeStatus::Timeout => "timeout",
            ProbeStatus::ConnectionRefused => "connection_refused",
            ProbeStatus::AuthFailed => "auth_failed",
            ProbeStatus::Error => "error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProbeStatus::Success)
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(ProbeStatus::Success),
            "timeout" => Ok(ProbeStatus::Timeout),
            "connection_refused" => Ok(ProbeStatus::ConnectionRefused),
            "auth_failed" => Ok(ProbeStatus::AuthFailed),
            "error" => Ok(ProbeStatus::Error),
            other => Err(Error::Database(format!("未知的探测状态: {}", other))),
        }
    }
}

/// 节点状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Discovered,
    Online,
    Offline,
    Error,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Discovered => "discovered",
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Error => "error",
        }
    }
}

impl FromStr for NodeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "discovered" => Ok(NodeStatus::Discovered),
            "online" => Ok(NodeStatus::Online),
            "offline" => Ok(NodeStatus::Offline),
            "error" => Ok(NodeStatus::Error),
            other => Err(Error::Database(format!("未知的节点状态: {}", other))),
        }
    }
}

/// 常量定义
pub mod constants {
    /// 默认 Server 端口
    pub const DEFAULT_SERVER_PORT: u16 = 3000;

    /// 默认单次探测超时（秒）
    pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 3;

    /// 单次探测超时上限（秒）
    pub const MAX_PROBE_TIMEOUT_SECS: u64 = 60;

    /// 默认并发探测数
    pub const DEFAULT_MAX_WORKERS: usize = 50;

    /// 并发探测数上限
    pub const MAX_WORKERS_LIMIT: usize = 500;

    /// 允许扫描的最宽前缀（/16 = 65536 个地址）
    pub const DEFAULT_MIN_PREFIX_LEN: u8 = 16;

    /// 每处理多少个结果持久化一次进度
    pub const PROGRESS_CHECKPOINT_INTERVAL: u64 = 10;

    /// 自动发现节点的名称前缀
    pub const NODE_NAME_PREFIX: &str = "node-";
}
