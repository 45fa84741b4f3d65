//! 内存仓储，仅用于测试

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::models::{
    ActivityLog, DiscoveryResult, DiscoveryStatus, DiscoveryTask, Node, ProgressSnapshot,
};
use common::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{
    ActivityLogRepository, NodeRepository, Repositories, ResultRepository, TaskRepository,
};

#[derive(Default)]
pub struct MemoryTaskRepository {
    tasks: RwLock<HashMap<String, DiscoveryTask>>,
    /// 每次写入后的计数器快照
    history: RwLock<Vec<DiscoveryTask>>,
    fail_progress: AtomicBool,
}

impl MemoryTaskRepository {
    pub async fn history(&self) -> Vec<DiscoveryTask> {
        self.history.read().await.clone()
    }

    pub fn set_fail_progress(&self, fail: bool) {
        self.fail_progress.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn create(&self, task: &DiscoveryTask) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(Error::AlreadyExists(task.id.clone()));
        }
        tasks.insert(task.id.clone(), task.clone());
        self.history.write().await.push(task.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<DiscoveryTask> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn update(&self, task: &DiscoveryTask) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let slot = tasks
            .get_mut(&task.id)
            .ok_or_else(|| Error::NotFound(task.id.clone()))?;
        *slot = task.clone();
        self.history.write().await.push(task.clone());
        Ok(())
    }

    async fn mark_running(&self, id: &str, started_at: DateTime<Utc>) -> Result<bool> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if task.status != DiscoveryStatus::Pending {
            return Ok(false);
        }
        task.transition(DiscoveryStatus::Running, started_at)?;
        self.history.write().await.push(task.clone());
        Ok(true)
    }

    async fn update_progress(&self, id: &str, progress: ProgressSnapshot) -> Result<bool> {
        if self.fail_progress.load(Ordering::SeqCst) {
            return Err(Error::Database("injected progress failure".to_string()));
        }
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if task.status != DiscoveryStatus::Running {
            return Ok(false);
        }
        task.apply_progress(progress)?;
        self.history.write().await.push(task.clone());
        Ok(true)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.tasks
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn list(
        &self,
        offset: u64,
        limit: u64,
        status: Option<DiscoveryStatus>,
    ) -> Result<(Vec<DiscoveryTask>, u64)> {
        let tasks = self.tasks.read().await;
        let mut matched: Vec<DiscoveryTask> = tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matched.len() as u64;
        let page = matched
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok((page, total))
    }
}

#[derive(Default)]
pub struct MemoryResultRepository {
    results: RwLock<Vec<DiscoveryResult>>,
    fail_writes: AtomicBool,
}

impl MemoryResultRepository {
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResultRepository for MemoryResultRepository {
    async fn create(&self, result: &DiscoveryResult) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Database("injected result failure".to_string()));
        }
        self.results.write().await.push(result.clone());
        Ok(())
    }

    async fn list_by_task(&self, task_id: &str) -> Result<Vec<DiscoveryResult>> {
        Ok(self
            .results
            .read()
            .await
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryNodeRepository {
    nodes: RwLock<Vec<Node>>,
}

impl MemoryNodeRepository {
    pub async fn all(&self) -> Vec<Node> {
        self.nodes.read().await.clone()
    }

    pub async fn insert(&self, node: Node) {
        self.nodes.write().await.push(node);
    }
}

#[async_trait]
impl NodeRepository for MemoryNodeRepository {
    async fn exists_by_host_port(&self, host: &str, port: u16) -> Result<bool> {
        Ok(self
            .nodes
            .read()
            .await
            .iter()
            .any(|n| n.host == host && n.port == port))
    }

    async fn create(&self, node: &Node) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        if nodes.iter().any(|n| n.host == node.host && n.port == node.port) {
            return Err(Error::AlreadyExists(format!("{}:{}", node.host, node.port)));
        }
        nodes.push(node.clone());
        Ok(())
    }

    async fn get_by_name(&self, name: &str) -> Result<Node> {
        self.nodes
            .read()
            .await
            .iter()
            .find(|n| n.name == name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    async fn get_by_host_port(&self, host: &str, port: u16) -> Result<Option<Node>> {
        Ok(self
            .nodes
            .read()
            .await
            .iter()
            .find(|n| n.host == host && n.port == port)
            .cloned())
    }
}

#[derive(Default)]
pub struct MemoryActivityLogRepository {
    entries: RwLock<Vec<ActivityLog>>,
}

impl MemoryActivityLogRepository {
    pub async fn entries(&self) -> Vec<ActivityLog> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl ActivityLogRepository for MemoryActivityLogRepository {
    async fn record(&self, entry: &ActivityLog) -> Result<()> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }
}

/// 内存仓储集合，保留具体类型以便断言
#[derive(Clone, Default)]
pub struct MemoryStore {
    pub tasks: Arc<MemoryTaskRepository>,
    pub results: Arc<MemoryResultRepository>,
    pub nodes: Arc<MemoryNodeRepository>,
    pub activity: Arc<MemoryActivityLogRepository>,
}

impl MemoryStore {
    pub fn repositories(&self) -> Repositories {
        Repositories {
            tasks: self.tasks.clone(),
            results: self.results.clone(),
            nodes: self.nodes.clone(),
            activity: self.activity.clone(),
        }
    }
}
