/// 仓储接口
///
/// 发现流程只通过这些接口访问持久化层，默认实现基于 SeaORM

mod activity_log;
mod discovery_result;
mod discovery_task;
mod node;

#[cfg(test)]
pub mod memory;

pub use activity_log::SeaActivityLogRepository;
pub use discovery_result::SeaResultRepository;
pub use discovery_task::SeaTaskRepository;
pub use node::SeaNodeRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::models::{
    ActivityLog, DiscoveryResult, DiscoveryStatus, DiscoveryTask, Node, ProgressSnapshot,
};
use common::Result;
use std::sync::Arc;

/// 发现任务仓储
#[async_trait]
pub trait TaskRepository: Send + Sync + 'static {
    async fn create(&self, task: &DiscoveryTask) -> Result<()>;

    /// 不存在时返回 `Error::NotFound`
    async fn get(&self, id: &str) -> Result<DiscoveryTask>;

    async fn update(&self, task: &DiscoveryTask) -> Result<()>;

    /// 只在任务仍为 pending 时写入 running 与开始时间；返回是否写入
    async fn mark_running(&self, id: &str, started_at: DateTime<Utc>) -> Result<bool>;

    /// 只写计数器，且只在任务仍为 running 时生效；返回是否写入
    async fn update_progress(&self, id: &str, progress: ProgressSnapshot) -> Result<bool>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// 按创建时间倒序分页，返回 (任务, 总数)
    async fn list(
        &self,
        offset: u64,
        limit: u64,
        status: Option<DiscoveryStatus>,
    ) -> Result<(Vec<DiscoveryTask>, u64)>;
}

/// 发现结果仓储（只追加）
#[async_trait]
pub trait ResultRepository: Send + Sync + 'static {
    async fn create(&self, result: &DiscoveryResult) -> Result<()>;

    async fn list_by_task(&self, task_id: &str) -> Result<Vec<DiscoveryResult>>;
}

/// 节点仓储
#[async_trait]
pub trait NodeRepository: Send + Sync + 'static {
    async fn exists_by_host_port(&self, host: &str, port: u16) -> Result<bool>;

    /// (host, port) 已存在时返回 `Error::AlreadyExists`
    async fn create(&self, node: &Node) -> Result<()>;

    /// 不存在时返回 `Error::NotFound`；名称与端口无关，同一主机的多个端口共用一个名称
    async fn get_by_name(&self, name: &str) -> Result<Node>;

    async fn get_by_host_port(&self, host: &str, port: u16) -> Result<Option<Node>>;
}

/// 审计日志仓储
#[async_trait]
pub trait ActivityLogRepository: Send + Sync + 'static {
    async fn record(&self, entry: &ActivityLog) -> Result<()>;
}

/// 发现流程使用的仓储集合
#[derive(Clone)]
pub struct Repositories {
    pub tasks: Arc<dyn TaskRepository>,
    pub results: Arc<dyn ResultRepository>,
    pub nodes: Arc<dyn NodeRepository>,
    pub activity: Arc<dyn ActivityLogRepository>,
}

impl Repositories {
    /// 基于 SeaORM 连接构建全部仓储
    pub fn sea_orm(db: sea_orm::DatabaseConnection) -> Self {
        Self {
            tasks: Arc::new(SeaTaskRepository::new(db.clone())),
            results: Arc::new(SeaResultRepository::new(db.clone())),
            nodes: Arc::new(SeaNodeRepository::new(db.clone())),
            activity: Arc::new(SeaActivityLogRepository::new(db)),
        }
    }
}
