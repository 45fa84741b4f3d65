/// 活动扫描注册表
///
/// 按任务 ID 保存正在运行的扫描上下文。完成路径与取消请求都会尝试移除条目，
/// 先移除者负责写入终态，另一方拿到 `None` 后直接返回。

use common::models::{ProbeStatus, ProgressSnapshot};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::pool::WorkerPool;
use super::probe::ProbeReport;

/// 任务级计数器，三个字段在同一把锁下一起更新
///
/// `freeze` 之后不再接受新结果，冻结时的快照即为任务最终计数
#[derive(Debug)]
pub struct ProgressTracker {
    inner: Mutex<TrackerState>,
}

#[derive(Debug)]
struct TrackerState {
    progress: ProgressSnapshot,
    frozen: bool,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        Self {
            inner: Mutex::new(TrackerState {
                progress: ProgressSnapshot::new(total),
                frozen: false,
            }),
        }
    }

    /// 记录一个结果并返回更新后的快照，已冻结时返回 `None`
    pub fn record(&self, status: ProbeStatus) -> Option<ProgressSnapshot> {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if state.frozen {
            return None;
        }
        state.progress.record(status);
        Some(state.progress)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .progress
    }

    /// 停止计数并返回最终快照
    pub fn freeze(&self) -> ProgressSnapshot {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.frozen = true;
        state.progress
    }
}

/// 单个运行中任务的上下文
pub struct ScanContext {
    task_id: String,
    cancel: CancellationToken,
    pool: WorkerPool<ProbeReport>,
    progress: ProgressTracker,
}

impl ScanContext {
    pub fn new(
        task_id: impl Into<String>,
        cancel: CancellationToken,
        pool: WorkerPool<ProbeReport>,
        total: u64,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            cancel,
            pool,
            progress: ProgressTracker::new(total),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn pool(&self) -> &WorkerPool<ProbeReport> {
        &self.pool
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 发出取消信号并等待工作池退出
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.pool.stop().await;
    }
}

#[derive(Clone, Default)]
pub struct ScanRegistry {
    scans: Arc<RwLock<HashMap<String, Arc<ScanContext>>>>,
}

impl ScanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, ctx: Arc<ScanContext>) {
        self.scans
            .write()
            .await
            .insert(ctx.task_id().to_string(), ctx);
    }

    /// 移除并返回上下文，同一任务只有第一次调用能拿到
    pub async fn remove(&self, task_id: &str) -> Option<Arc<ScanContext>> {
        self.scans.write().await.remove(task_id)
    }

    pub async fn get(&self, task_id: &str) -> Option<Arc<ScanContext>> {
        self.scans.read().await.get(task_id).cloned()
    }

    /// 运行中任务的实时进度
    pub async fn snapshot(&self, task_id: &str) -> Option<ProgressSnapshot> {
        self.get(task_id).await.map(|ctx| ctx.progress().snapshot())
    }

    pub async fn task_ids(&self) -> Vec<String> {
        self.scans.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.scans.read().await.len()
    }
}
