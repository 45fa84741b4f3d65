/// 节点发现服务
///
/// 负责扫描任务的生命周期：校验并创建任务，在后台把网段内每个地址交给工作池探测，
/// 汇总进度、登记新节点，写入终态，以及响应外部取消。
///
/// 完成、失败与取消三条路径都先从注册表移除扫描上下文，只有移除成功的一方写终态。

use chrono::Utc;
use common::models::constants::PROGRESS_CHECKPOINT_INTERVAL;
use common::models::{
    ActivityLog, DiscoveryResult, DiscoveryStatus, DiscoveryTask, Node, NodeStatus, ProbeStatus,
    ProgressSnapshot,
};
use common::utils::{generate_id, generate_node_name};
use common::{Error, Result};
use serde_json::json;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use validator::Validate;

use crate::config::DiscoveryConfig;
use crate::db::models::discovery_task::{DiscoveryTaskListResponse, ScanRequest};
use crate::discovery::events::{DiscoveryCompleted, DiscoveryProgress, NodeDiscovered};
use crate::discovery::pool::{JobOutcome, JobResult, PoolConfig, WorkerPool};
use crate::discovery::{
    AddressRange, AgentConnector, Credentials, DiscoveryEvent, EventSink, Probe, ProbeReport,
    ScanContext, ScanRegistry,
};
use crate::repositories::Repositories;

/// 工作池截止时间比单次探测超时多出的余量
const POOL_DEADLINE_GRACE: Duration = Duration::from_secs(1);
const TERMINAL_WRITE_ATTEMPTS: u32 = 3;
const TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(200);
const MAX_PAGE_SIZE: u64 = 100;

type Prepared = (
    Arc<ScanContext>,
    AddressRange,
    mpsc::Receiver<JobOutcome<ProbeReport>>,
);

#[derive(Clone)]
pub struct DiscoveryService {
    inner: Arc<Inner>,
}

struct Inner {
    repos: Repositories,
    events: Arc<dyn EventSink>,
    connector: Arc<dyn AgentConnector>,
    config: DiscoveryConfig,
    registry: ScanRegistry,
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
    /// 所有扫描令牌的父令牌，服务关闭时取消
    closing: CancellationToken,
}

impl DiscoveryService {
    pub fn new(
        repos: Repositories,
        events: Arc<dyn EventSink>,
        connector: Arc<dyn AgentConnector>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                repos,
                events,
                connector,
                config,
                registry: ScanRegistry::new(),
                handles: Mutex::new(HashMap::new()),
                closing: CancellationToken::new(),
            }),
        }
    }

    /// 创建发现任务
    ///
    /// 校验通过后以 pending 状态入库并立即返回，扫描在后台进行
    pub async fn create_task(&self, req: ScanRequest) -> Result<DiscoveryTask> {
        let task = self.build_task(req)?;
        self.inner.repos.tasks.create(&task).await?;

        info!(
            task_id = %task.id,
            cidr = %task.cidr,
            port = task.port,
            total = task.total_ips,
            "发现任务已创建"
        );

        self.launch(task.clone()).await;
        Ok(task)
    }

    /// 获取任务详情，运行中的任务使用内存中的实时计数
    pub async fn get_task(&self, task_id: &str) -> Result<DiscoveryTask> {
        let mut task = self.inner.repos.tasks.get(task_id).await?;
        self.overlay_live_progress(&mut task).await?;
        Ok(task)
    }

    /// 分页查询任务，按创建时间倒序
    pub async fn list_tasks(
        &self,
        page: u64,
        page_size: u64,
        status: Option<DiscoveryStatus>,
    ) -> Result<DiscoveryTaskListResponse> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);

        let (mut tasks, total) = self
            .inner
            .repos
            .tasks
            .list((page - 1).saturating_mul(page_size), page_size, status)
            .await?;
        for task in tasks.iter_mut() {
            self.overlay_live_progress(task).await?;
        }

        Ok(DiscoveryTaskListResponse {
            tasks,
            total,
            page,
            page_size,
        })
    }

    /// 获取任务的探测结果
    pub async fn list_results(&self, task_id: &str) -> Result<Vec<DiscoveryResult>> {
        self.inner.repos.tasks.get(task_id).await?;
        self.inner.repos.results.list_by_task(task_id).await
    }

    /// 删除任务，仅允许删除已结束的任务
    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        let task = self.inner.repos.tasks.get(task_id).await?;
        if !task.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "任务 {} 尚未结束 ({})，无法删除",
                task_id, task.status
            )));
        }

        self.inner.repos.tasks.delete(task_id).await?;
        info!(task_id = %task_id, "发现任务已删除");
        Ok(())
    }

    /// 取消运行中的任务
    ///
    /// 已登记扫描上下文的任务视为运行中，即使库里的状态还没写成 running。
    /// 未开始或已结束的任务返回 `Error::Conflict`
    pub async fn cancel_task(&self, task_id: &str) -> Result<DiscoveryTask> {
        let mut task = self.inner.repos.tasks.get(task_id).await?;
        if task.status.is_terminal() {
            return Err(Error::Conflict(format!("任务已结束: {}", task.status)));
        }

        if let Some(ctx) = self.inner.registry.remove(task_id).await {
            return self.cancel_scan(task, &ctx).await;
        }

        if task.status != DiscoveryStatus::Running {
            return Err(Error::Conflict(format!("任务尚未开始运行: {}", task.status)));
        }
        if self.is_live(task_id).await {
            return Err(Error::Conflict("任务正在结束".to_string()));
        }

        // 没有对应的扫描协程，多半是服务重启前遗留的 running 记录
        warn!(task_id = %task_id, "任务没有活动的扫描，直接标记为已取消");
        task.transition(DiscoveryStatus::Cancelled, Utc::now())?;
        self.finish(&task).await?;
        Ok(task)
    }

    /// 当前活动的扫描数
    pub async fn active_scans(&self) -> usize {
        self.inner.registry.len().await
    }

    /// 取消全部扫描并等待后台协程退出
    ///
    /// 各扫描协程自行写终态：已运行的记为 cancelled，尚未开始的记为 failed
    pub async fn shutdown(&self) {
        self.inner.closing.cancel();

        loop {
            let handles: Vec<_> = self.inner.handles.lock().await.drain().collect();
            if handles.is_empty() {
                break;
            }

            info!(count = handles.len(), "正在停止发现任务");
            for (task_id, handle) in handles {
                if let Err(e) = handle.await {
                    error!(task_id = %task_id, "扫描协程异常退出: {}", e);
                }
            }
        }
    }

    /// 等待任务的后台扫描协程退出
    pub async fn wait(&self, task_id: &str) {
        let handle = self.inner.handles.lock().await.remove(task_id);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(task_id = %task_id, "扫描协程异常退出: {}", e);
            }
        }
    }

    fn build_task(&self, req: ScanRequest) -> Result<DiscoveryTask> {
        let config = &self.inner.config;

        req.validate()
            .map_err(|e| Error::Validation(format!("验证失败: {}", e)))?;
        for (field, value) in [
            ("username", &req.username),
            ("password", &req.password),
            ("created_by", &req.created_by),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Validation(format!("{} 不能为空", field)));
            }
        }

        let port = u16::try_from(req.port)
            .map_err(|_| Error::Validation(format!("端口超出范围: {}", req.port)))?;

        let max_workers = req.max_workers.unwrap_or(config.default_workers as u32);
        if max_workers as usize > config.max_workers {
            return Err(Error::Validation(format!(
                "并发数不能超过 {}: {}",
                config.max_workers, max_workers
            )));
        }

        let range = AddressRange::parse_bounded(&req.cidr, config.min_prefix_len)?;
        let now = Utc::now();

        Ok(DiscoveryTask {
            id: generate_id(),
            cidr: range.to_string(),
            port,
            username: req.username,
            password: req.password,
            timeout_secs: req.timeout_seconds.unwrap_or(config.default_timeout_secs),
            max_workers,
            created_by: req.created_by,
            status: DiscoveryStatus::Pending,
            total_ips: range.count(),
            scanned_ips: 0,
            found_nodes: 0,
            failed_ips: 0,
            error_msg: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        })
    }

    async fn overlay_live_progress(&self, task: &mut DiscoveryTask) -> Result<()> {
        if task.status != DiscoveryStatus::Running {
            return Ok(());
        }
        if let Some(progress) = self.inner.registry.snapshot(&task.id).await {
            task.apply_progress(progress)?;
        }
        Ok(())
    }

    async fn is_live(&self, task_id: &str) -> bool {
        self.inner
            .handles
            .lock()
            .await
            .get(task_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// 在后台启动扫描
    async fn launch(&self, task: DiscoveryTask) {
        let task_id = task.id.clone();
        let service = self.clone();
        let handle = tokio::spawn(async move { service.run(task).await });

        let mut handles = self.inner.handles.lock().await;
        handles.retain(|_, handle| !handle.is_finished());
        handles.insert(task_id, handle);
    }

    async fn run(self, task: DiscoveryTask) {
        let task_id = task.id.clone();
        if let Err(e) = self.execute(task).await {
            error!(task_id = %task_id, "发现任务异常结束: {}", e);
        }
    }

    async fn execute(&self, mut task: DiscoveryTask) -> Result<()> {
        let (ctx, range, mut results) = match self.prepare(&task) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(task_id = %task.id, "扫描无法启动: {}", e);
                task.fail(format!("扫描无法启动: {}", e), Utc::now())?;
                return self.finish(&task).await;
            }
        };

        self.inner.registry.register(ctx.clone()).await;
        if ctx.is_cancelled() {
            return self.abandon(task, &ctx).await;
        }

        let started_at = Utc::now();
        task.transition(DiscoveryStatus::Running, started_at)?;
        match self.inner.repos.tasks.mark_running(&task.id, started_at).await {
            Ok(true) => {}
            Ok(false) => {
                ctx.pool().stop().await;
                if self.inner.registry.remove(&task.id).await.is_some() {
                    warn!(task_id = %task.id, "任务已不是 pending 状态，放弃扫描");
                }
                return Ok(());
            }
            Err(e) => {
                return self
                    .abort(task, &ctx, format!("无法更新任务状态: {}", e))
                    .await;
            }
        }
        info!(
            task_id = %task.id,
            cidr = %task.cidr,
            workers = ctx.pool().config().workers,
            "开始扫描"
        );

        let credentials = Arc::new(Credentials {
            username: task.username.clone(),
            password: task.password.clone(),
        });
        let timeout = Duration::from_secs(task.timeout_secs);
        for ip in range.addresses() {
            let probe = Probe::new(
                ip,
                task.port,
                credentials.clone(),
                timeout,
                self.inner.connector.clone(),
            );
            if let Err(e) = ctx.pool().submit(probe) {
                if ctx.is_cancelled() {
                    break;
                }
                return self
                    .abort(task, &ctx, format!("提交探测失败: {}", e))
                    .await;
            }
        }
        ctx.pool().close();

        let mut consumed = 0u64;
        let mut progress = ctx.progress().snapshot();
        loop {
            let outcome = tokio::select! {
                biased;
                _ = ctx.token().cancelled() => break,
                next = results.recv() => match next {
                    Some(outcome) => outcome,
                    None => break,
                },
            };
            let Some(report) = report_from(outcome, task.port) else {
                continue;
            };
            let Some(snapshot) = self.handle_report(&task, &ctx, report).await else {
                break;
            };

            progress = snapshot;
            consumed += 1;
            if consumed % PROGRESS_CHECKPOINT_INTERVAL == 0 || progress.is_finished() {
                self.checkpoint(&task.id, progress).await;
            }
            if progress.is_finished() {
                break;
            }
        }

        if ctx.is_cancelled() && !progress.is_finished() {
            let Some(ctx) = self.inner.registry.remove(&task.id).await else {
                debug!(task_id = %task.id, "扫描已被取消，停止消费结果");
                return Ok(());
            };
            info!(task_id = %task.id, "服务关闭，取消扫描");
            return self.cancel_scan(task, &ctx).await.map(|_| ());
        }
        if !progress.is_finished() {
            return self
                .abort(
                    task,
                    &ctx,
                    format!(
                        "工作池提前结束: 已扫描 {}/{}",
                        progress.scanned, progress.total
                    ),
                )
                .await;
        }

        self.complete(task, &ctx).await
    }

    fn prepare(&self, task: &DiscoveryTask) -> Result<Prepared> {
        let range = AddressRange::parse(&task.cidr)?;
        let total = usize::try_from(range.count()).unwrap_or(usize::MAX);
        let workers = usize::try_from(task.max_workers)
            .unwrap_or(usize::MAX)
            .min(total);

        let config = PoolConfig {
            workers,
            queue_capacity: total,
            result_capacity: workers.max(1) * 2,
            job_timeout: Duration::from_secs(task.timeout_secs) + POOL_DEADLINE_GRACE,
        };

        let cancel = self.inner.closing.child_token();
        let pool = WorkerPool::with_parent(config, &cancel)?;
        let results = pool
            .take_results()
            .ok_or_else(|| Error::Internal("结果通道不可用".to_string()))?;

        let ctx = Arc::new(ScanContext::new(task.id.clone(), cancel, pool, range.count()));
        Ok((ctx, range, results))
    }

    /// 处理一个探测结果，返回更新后的进度；任务已被取消时返回 `None`
    async fn handle_report(
        &self,
        task: &DiscoveryTask,
        ctx: &ScanContext,
        report: ProbeReport,
    ) -> Option<ProgressSnapshot> {
        let snapshot = ctx.progress().record(report.status)?;

        let mut node_id = None;
        if report.status.is_success() {
            let node_name = generate_node_name(report.ip);
            node_id = match self.register_node(task, &report, &node_name).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(task_id = %task.id, ip = %report.ip, "登记节点失败: {}", e);
                    None
                }
            };

            self.emit(DiscoveryEvent::NodeDiscovered(NodeDiscovered {
                task_id: task.id.clone(),
                ip: report.ip.to_string(),
                port: report.port,
                node_name,
                version: report.version.clone(),
            }))
            .await;
        }

        let duration_ms = report.duration_ms();
        let result = DiscoveryResult {
            id: generate_id(),
            task_id: task.id.clone(),
            ip: report.ip.to_string(),
            port: report.port,
            status: report.status,
            version: report.version,
            error_msg: report.error,
            duration_ms,
            node_id,
            created_at: Utc::now(),
        };
        if let Err(e) = self.inner.repos.results.create(&result).await {
            warn!(task_id = %task.id, ip = %result.ip, "保存探测结果失败: {}", e);
        }

        Some(snapshot)
    }

    /// 登记发现的节点，返回新建或已存在节点的 ID
    async fn register_node(
        &self,
        task: &DiscoveryTask,
        report: &ProbeReport,
        node_name: &str,
    ) -> Result<Option<String>> {
        let host = report.ip.to_string();
        let nodes = &self.inner.repos.nodes;

        if nodes.exists_by_host_port(&host, report.port).await? {
            debug!(host = %host, port = report.port, "节点已存在，跳过登记");
            return self.existing_node_id(&host, report.port).await;
        }

        let now = Utc::now();
        let node = Node {
            id: generate_id(),
            name: node_name.to_string(),
            host: host.clone(),
            port: report.port,
            username: task.username.clone(),
            password: task.password.clone(),
            status: NodeStatus::Discovered,
            version: report.version.clone(),
            created_at: now,
            updated_at: now,
        };

        match nodes.create(&node).await {
            Ok(()) => {
                info!(
                    task_id = %task.id,
                    node_id = %node.id,
                    name = %node.name,
                    "发现新节点"
                );
                Ok(Some(node.id))
            }
            Err(Error::AlreadyExists(_)) => self.existing_node_id(&host, report.port).await,
            Err(e) => Err(e),
        }
    }

    async fn existing_node_id(&self, host: &str, port: u16) -> Result<Option<String>> {
        let node = self.inner.repos.nodes.get_by_host_port(host, port).await?;
        Ok(node.map(|n| n.id))
    }

    async fn checkpoint(&self, task_id: &str, progress: ProgressSnapshot) {
        match self.inner.repos.tasks.update_progress(task_id, progress).await {
            Ok(true) => {}
            Ok(false) => debug!(task_id = %task_id, "任务已不在运行状态，跳过进度写入"),
            Err(e) => warn!(task_id = %task_id, "保存扫描进度失败: {}", e),
        }

        self.emit(DiscoveryEvent::DiscoveryProgress(DiscoveryProgress::new(
            task_id, progress,
        )))
        .await;
    }

    async fn complete(&self, mut task: DiscoveryTask, ctx: &ScanContext) -> Result<()> {
        ctx.pool().stop().await;
        if self.inner.registry.remove(&task.id).await.is_none() {
            debug!(task_id = %task.id, "任务已由取消路径结束");
            return Ok(());
        }

        task.apply_progress(ctx.progress().freeze())?;
        task.transition(DiscoveryStatus::Completed, Utc::now())?;
        info!(
            task_id = %task.id,
            total = task.total_ips,
            found = task.found_nodes,
            failed = task.failed_ips,
            "扫描完成"
        );

        self.finish(&task).await
    }

    /// 以 cancelled 结束已从注册表取下的扫描；库里仍是 pending 时补记开始时间
    async fn cancel_scan(
        &self,
        mut task: DiscoveryTask,
        ctx: &ScanContext,
    ) -> Result<DiscoveryTask> {
        let progress = ctx.progress().freeze();
        ctx.shutdown().await;

        let now = Utc::now();
        if task.status == DiscoveryStatus::Pending {
            task.transition(DiscoveryStatus::Running, now)?;
        }
        task.apply_progress(progress)?;
        task.transition(DiscoveryStatus::Cancelled, now)?;
        info!(
            task_id = %task.id,
            scanned = progress.scanned,
            total = progress.total,
            "发现任务已取消"
        );

        self.finish(&task).await?;
        Ok(task)
    }

    /// 服务关闭时尚未开始的扫描记为 failed
    async fn abandon(&self, mut task: DiscoveryTask, ctx: &ScanContext) -> Result<()> {
        ctx.pool().stop().await;
        if self.inner.registry.remove(&task.id).await.is_none() {
            return Ok(());
        }

        warn!(task_id = %task.id, "服务正在关闭，扫描未启动");
        task.fail("服务关闭，扫描未启动", Utc::now())?;
        self.finish(&task).await
    }

    async fn abort(&self, mut task: DiscoveryTask, ctx: &ScanContext, message: String) -> Result<()> {
        ctx.pool().stop().await;
        if self.inner.registry.remove(&task.id).await.is_none() {
            return Ok(());
        }

        error!(task_id = %task.id, "扫描失败: {}", message);
        task.apply_progress(ctx.progress().freeze())?;
        task.fail(message, Utc::now())?;
        self.finish(&task).await
    }

    /// 写入终态、推送完成事件并记录审计日志
    async fn finish(&self, task: &DiscoveryTask) -> Result<()> {
        let persisted = self.persist_terminal(task).await;
        self.emit(DiscoveryEvent::DiscoveryCompleted(DiscoveryCompleted::from(task)))
            .await;
        self.audit(task).await;
        persisted
    }

    async fn persist_terminal(&self, task: &DiscoveryTask) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.inner.repos.tasks.update(task).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < TERMINAL_WRITE_ATTEMPTS => {
                    warn!(
                        task_id = %task.id,
                        attempt,
                        "写入任务终态失败，稍后重试: {}", e
                    );
                    tokio::time::sleep(TERMINAL_WRITE_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        task_id = %task.id,
                        status = %task.status,
                        "写入任务终态失败，任务可能停留在运行状态: {}", e
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn audit(&self, task: &DiscoveryTask) {
        let entry = ActivityLog {
            id: generate_id(),
            action: format!("discovery.{}", task.status),
            resource_type: "discovery_task".to_string(),
            resource_id: task.id.clone(),
            actor: task.created_by.clone(),
            detail: json!({
                "cidr": task.cidr,
                "port": task.port,
                "status": task.status,
                "total_ips": task.total_ips,
                "scanned_ips": task.scanned_ips,
                "found_nodes": task.found_nodes,
                "failed_ips": task.failed_ips,
                "duration_seconds": task.duration_seconds(),
                "error_msg": task.error_msg,
            }),
            created_at: Utc::now(),
        };

        if let Err(e) = self.inner.repos.activity.record(&entry).await {
            warn!(task_id = %task.id, "写入审计日志失败: {}", e);
        }
    }

    async fn emit(&self, event: DiscoveryEvent) {
        self.inner.events.broadcast(event).await;
    }
}

/// 把工作池的结果转换为探测报告，工作池超时或取消的探测按超时处理
fn report_from(outcome: JobOutcome<ProbeReport>, port: u16) -> Option<ProbeReport> {
    let (status, message) = match outcome.result {
        JobResult::Completed(report) => return Some(report),
        JobResult::TimedOut => (ProbeStatus::Timeout, "探测超过截止时间".to_string()),
        JobResult::Cancelled => (ProbeStatus::Timeout, "探测被取消".to_string()),
        JobResult::Failed(message) => (ProbeStatus::Error, message),
    };

    match outcome.job_id.parse::<IpAddr>() {
        Ok(ip) => Some(ProbeReport::failed(
            ip,
            port,
            status,
            message,
            outcome.elapsed,
        )),
        Err(e) => {
            error!(job_id = %outcome.job_id, "无法识别的探测结果: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::cidr;
    use crate::discovery::testing::{RecordingSink, Script, ScriptedConnector};
    use crate::repositories::memory::MemoryStore;
    use crate::repositories::{NodeRepository, TaskRepository};
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    struct Harness {
        service: DiscoveryService,
        store: MemoryStore,
        sink: Arc<RecordingSink>,
        connector: Arc<ScriptedConnector>,
    }

    fn harness(connector: ScriptedConnector) -> Harness {
        let store = MemoryStore::default();
        let sink = Arc::new(RecordingSink::default());
        let connector = Arc::new(connector);
        let service = DiscoveryService::new(
            store.repositories(),
            sink.clone(),
            connector.clone(),
            DiscoveryConfig::default(),
        );
        Harness {
            service,
            store,
            sink,
            connector,
        }
    }

    fn request(cidr: &str) -> ScanRequest {
        ScanRequest {
            cidr: cidr.to_string(),
            port: 9001,
            username: "admin".to_string(),
            password: "secret".to_string(),
            timeout_seconds: Some(1),
            max_workers: None,
            created_by: "alice".to_string(),
        }
    }

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    async fn wait_until<F>(service: &DiscoveryService, task_id: &str, pred: F) -> DiscoveryTask
    where
        F: Fn(&DiscoveryTask) -> bool,
    {
        for _ in 0..300 {
            let task = service.get_task(task_id).await.unwrap();
            if pred(&task) {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("等待任务 {} 超时", task_id);
    }

    fn last_completed(sink: &RecordingSink, task_id: &str) -> DiscoveryCompleted {
        sink.events_for(task_id)
            .into_iter()
            .rev()
            .find_map(|e| match e {
                DiscoveryEvent::DiscoveryCompleted(c) => Some(c),
                _ => None,
            })
            .expect("应有完成事件")
    }

    #[tokio::test]
    async fn test_all_timeouts_complete() {
        let h = harness(ScriptedConnector::new(Script::Hang));

        let task = h.service.create_task(request("10.0.0.0/30")).await.unwrap();
        assert_eq!(task.status, DiscoveryStatus::Pending);
        assert_eq!(task.total_ips, 4);

        h.service.wait(&task.id).await;
        let done = h.service.get_task(&task.id).await.unwrap();
        assert_eq!(done.status, DiscoveryStatus::Completed);
        assert_eq!(
            (done.scanned_ips, done.found_nodes, done.failed_ips),
            (4, 0, 4)
        );
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());

        let results = h.service.list_results(&task.id).await.unwrap();
        assert_eq!(results.len(), 4);
        let range = AddressRange::parse(&task.cidr).unwrap();
        let ips: HashSet<_> = results.iter().map(|r| r.ip.clone()).collect();
        assert_eq!(ips.len(), 4);
        for result in &results {
            assert_eq!(result.status, ProbeStatus::Timeout);
            assert!(cidr::contains(&range, &result.ip));
        }

        let completed = last_completed(&h.sink, &task.id);
        assert_eq!(completed.status, DiscoveryStatus::Completed);
        assert_eq!((completed.total, completed.found), (4, 0));
        assert!(h.sink.events_for(&task.id).iter().any(|e| matches!(
            e,
            DiscoveryEvent::DiscoveryProgress(p) if p.scanned == 4 && p.percent == 100.0
        )));

        let audit = h.store.activity.entries().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "discovery.completed");
        assert_eq!(audit[0].resource_id, task.id);
        assert_eq!(h.service.active_scans().await, 0);
    }

    #[tokio::test]
    async fn test_success_registers_node() {
        let h = harness(
            ScriptedConnector::new(Script::Hang)
                .with(ip(192, 168, 1, 0), Script::Agent(Some("4.2.5".to_string()))),
        );

        let task = h.service.create_task(request("192.168.1.0/31")).await.unwrap();
        h.service.wait(&task.id).await;

        let done = h.service.get_task(&task.id).await.unwrap();
        assert_eq!(done.status, DiscoveryStatus::Completed);
        assert_eq!(
            (done.scanned_ips, done.found_nodes, done.failed_ips),
            (2, 1, 1)
        );

        let nodes = h.store.nodes.all().await;
        assert_eq!(nodes.len(), 1);
        let node = &nodes[0];
        assert_eq!(node.name, "node-192-168-1-0");
        assert_eq!((node.host.as_str(), node.port), ("192.168.1.0", 9001));
        assert_eq!(node.status, NodeStatus::Discovered);
        assert_eq!(node.version.as_deref(), Some("4.2.5"));

        let results = h.service.list_results(&task.id).await.unwrap();
        assert_eq!(results.len(), 2);
        let success = results
            .iter()
            .find(|r| r.status == ProbeStatus::Success)
            .unwrap();
        assert_eq!(success.ip, "192.168.1.0");
        assert_eq!(success.node_id.as_deref(), Some(node.id.as_str()));
        assert_eq!(success.version.as_deref(), Some("4.2.5"));

        assert!(h.sink.events_for(&task.id).iter().any(|e| matches!(
            e,
            DiscoveryEvent::NodeDiscovered(n) if n.node_name == "node-192-168-1-0" && n.port == 9001
        )));
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected_before_persisting() {
        let h = harness(ScriptedConnector::new(Script::Refused));

        let mut bad_port = request("10.0.0.0/30");
        bad_port.port = 70000;
        assert!(matches!(
            h.service.create_task(bad_port).await,
            Err(Error::Validation(_))
        ));

        let mut zero_port = request("10.0.0.0/30");
        zero_port.port = 0;
        assert!(matches!(
            h.service.create_task(zero_port).await,
            Err(Error::Validation(_))
        ));

        for cidr in ["10.0.0.0/33", "not-a-cidr", "10.0.0.0/8", "fd00::/120"] {
            assert!(
                matches!(
                    h.service.create_task(request(cidr)).await,
                    Err(Error::InvalidRange(_))
                ),
                "应拒绝 {}",
                cidr
            );
        }

        let mut no_user = request("10.0.0.0/30");
        no_user.username = String::new();
        let mut blank_password = request("10.0.0.0/30");
        blank_password.password = "   ".to_string();
        let mut no_creator = request("10.0.0.0/30");
        no_creator.created_by = String::new();
        let mut too_many_workers = request("10.0.0.0/30");
        too_many_workers.max_workers = Some(501);
        let mut zero_timeout = request("10.0.0.0/30");
        zero_timeout.timeout_seconds = Some(0);

        for req in [no_user, blank_password, no_creator, too_many_workers, zero_timeout] {
            assert!(matches!(
                h.service.create_task(req).await,
                Err(Error::Validation(_))
            ));
        }

        let listed = h.service.list_tasks(1, 20, None).await.unwrap();
        assert_eq!(listed.total, 0);
        assert_eq!(h.connector.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let h = harness(ScriptedConnector::new(Script::Hang));
        let mut req = request("10.1.0.0/28");
        req.timeout_seconds = Some(30);
        req.max_workers = Some(2);

        let task = h.service.create_task(req).await.unwrap();
        wait_until(&h.service, &task.id, |t| t.status == DiscoveryStatus::Running).await;

        let cancelled = h.service.cancel_task(&task.id).await.unwrap();
        assert_eq!(cancelled.status, DiscoveryStatus::Cancelled);
        assert!(cancelled.scanned_ips < cancelled.total_ips);
        assert!(cancelled.completed_at.is_some());

        tokio::time::timeout(Duration::from_secs(2), h.service.wait(&task.id))
            .await
            .expect("取消后扫描协程应及时退出");

        let stored = h.service.get_task(&task.id).await.unwrap();
        assert_eq!(stored.status, DiscoveryStatus::Cancelled);
        assert!(matches!(
            h.service.cancel_task(&task.id).await,
            Err(Error::Conflict(_))
        ));

        assert_eq!(
            last_completed(&h.sink, &task.id).status,
            DiscoveryStatus::Cancelled
        );
        assert_eq!(h.service.active_scans().await, 0);

        let history = h.store.tasks.history().await;
        assert!(history
            .iter()
            .all(|t| t.status != DiscoveryStatus::Completed));
    }

    #[tokio::test]
    async fn test_cancel_keeps_reached_progress() {
        let h = harness(
            ScriptedConnector::new(Script::Hang).with(ip(10, 3, 0, 0), Script::Refused),
        );
        let mut req = request("10.3.0.0/30");
        req.timeout_seconds = Some(30);

        let task = h.service.create_task(req).await.unwrap();
        let live = wait_until(&h.service, &task.id, |t| t.scanned_ips == 1).await;
        assert_eq!(live.status, DiscoveryStatus::Running);

        // 未到检查点，库里仍是旧计数
        let stored = h.store.tasks.get(&task.id).await.unwrap();
        assert_eq!(stored.scanned_ips, 0);

        let cancelled = h.service.cancel_task(&task.id).await.unwrap();
        assert_eq!(
            (cancelled.scanned_ips, cancelled.found_nodes, cancelled.failed_ips),
            (1, 0, 1)
        );
        h.service.wait(&task.id).await;
        assert_eq!(h.service.list_results(&task.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_requires_running_task() {
        let h = harness(ScriptedConnector::new(Script::Refused));

        let task = h.service.create_task(request("10.0.0.1/32")).await.unwrap();
        h.service.wait(&task.id).await;
        assert_eq!(
            h.service.get_task(&task.id).await.unwrap().status,
            DiscoveryStatus::Completed
        );
        assert!(matches!(
            h.service.cancel_task(&task.id).await,
            Err(Error::Conflict(_))
        ));

        let pending = h.service.build_task(request("10.0.0.2/32")).unwrap();
        h.store.tasks.create(&pending).await.unwrap();
        assert!(matches!(
            h.service.cancel_task(&pending.id).await,
            Err(Error::Conflict(_))
        ));

        assert!(matches!(
            h.service.cancel_task("missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_orphaned_running_task_can_be_cancelled() {
        let h = harness(ScriptedConnector::new(Script::Refused));
        let mut task = h.service.build_task(request("10.0.0.3/32")).unwrap();
        task.transition(DiscoveryStatus::Running, Utc::now()).unwrap();
        h.store.tasks.create(&task).await.unwrap();

        let cancelled = h.service.cancel_task(&task.id).await.unwrap();
        assert_eq!(cancelled.status, DiscoveryStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_start_failure_marks_failed() {
        let h = harness(ScriptedConnector::new(Script::Refused));
        let mut task = h.service.build_task(request("10.0.0.0/30")).unwrap();
        task.max_workers = 0;
        h.store.tasks.create(&task).await.unwrap();

        h.service.launch(task.clone()).await;
        h.service.wait(&task.id).await;

        let failed = h.service.get_task(&task.id).await.unwrap();
        assert_eq!(failed.status, DiscoveryStatus::Failed);
        assert!(failed.error_msg.is_some());
        assert!(failed.started_at.is_none());
        assert!(failed.completed_at.is_some());
        assert_eq!(
            last_completed(&h.sink, &task.id).status,
            DiscoveryStatus::Failed
        );
        assert_eq!(h.connector.calls(), 0);
        assert_eq!(h.service.active_scans().await, 0);
    }

    #[tokio::test]
    async fn test_existing_node_not_duplicated() {
        let h = harness(ScriptedConnector::new(Script::Agent(None)));
        let existing_ip = ip(10, 0, 0, 1);
        let now = Utc::now();
        let existing = Node {
            id: "existing".to_string(),
            name: generate_node_name(existing_ip),
            host: existing_ip.to_string(),
            port: 9001,
            username: "admin".to_string(),
            password: "old".to_string(),
            status: NodeStatus::Online,
            version: None,
            created_at: now,
            updated_at: now,
        };
        h.store.nodes.insert(existing.clone()).await;

        let first = h.service.create_task(request("10.0.0.0/31")).await.unwrap();
        h.service.wait(&first.id).await;

        let nodes = h.store.nodes.all().await;
        assert_eq!(nodes.len(), 2);
        let kept = nodes.iter().find(|n| n.id == "existing").unwrap();
        assert_eq!(kept, &existing);

        let results = h.service.list_results(&first.id).await.unwrap();
        let reused = results.iter().find(|r| r.ip == "10.0.0.1").unwrap();
        assert_eq!(reused.node_id.as_deref(), Some("existing"));

        // 再扫一遍同一网段不会新增节点
        let second = h.service.create_task(request("10.0.0.0/31")).await.unwrap();
        h.service.wait(&second.id).await;
        assert_eq!(h.store.nodes.all().await.len(), 2);
        let done = h.service.get_task(&second.id).await.unwrap();
        assert_eq!(done.found_nodes, 2);
    }

    #[tokio::test]
    async fn test_counters_consistent_at_every_write() {
        let mut connector = ScriptedConnector::new(Script::Refused);
        for last in (0..64u8).step_by(3) {
            connector = connector.with(ip(10, 2, 0, last), Script::Agent(None));
        }
        for last in (1..64u8).step_by(5) {
            connector = connector.with(ip(10, 2, 0, last), Script::Unauthorized);
        }
        let h = harness(connector);
        let mut req = request("10.2.0.0/26");
        req.max_workers = Some(8);

        let task = h.service.create_task(req).await.unwrap();
        h.service.wait(&task.id).await;

        let done = h.service.get_task(&task.id).await.unwrap();
        assert_eq!(done.status, DiscoveryStatus::Completed);
        assert_eq!(done.scanned_ips, done.total_ips);
        // 3 的倍数为 Agent，其中 6/21/36/51 被认证失败覆盖
        assert_eq!(done.found_nodes, 18);
        assert_eq!(done.failed_ips, 46);

        let history: Vec<_> = h
            .store
            .tasks
            .history()
            .await
            .into_iter()
            .filter(|t| t.id == task.id)
            .collect();
        assert!(history.len() >= 7);
        let mut last_scanned = 0;
        for snapshot in &history {
            assert!(snapshot.scanned_ips <= snapshot.total_ips);
            assert!(snapshot.found_nodes + snapshot.failed_ips <= snapshot.scanned_ips);
            assert!(snapshot.scanned_ips >= last_scanned);
            last_scanned = snapshot.scanned_ips;
        }

        let auth_failed = h
            .service
            .list_results(&task.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.status == ProbeStatus::AuthFailed)
            .count();
        assert!(auth_failed > 0);
    }

    #[tokio::test]
    async fn test_persistence_failures_do_not_abort_scan() {
        let h = harness(ScriptedConnector::new(Script::Refused));
        h.store.results.set_fail_writes(true);
        h.store.tasks.set_fail_progress(true);

        let task = h.service.create_task(request("10.0.0.0/30")).await.unwrap();
        h.service.wait(&task.id).await;

        let done = h.service.get_task(&task.id).await.unwrap();
        assert_eq!(done.status, DiscoveryStatus::Completed);
        assert_eq!(
            (done.scanned_ips, done.found_nodes, done.failed_ips),
            (4, 0, 4)
        );
        assert!(h.service.list_results(&task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_creates_have_unique_ids() {
        let h = harness(ScriptedConnector::new(Script::Refused));

        let creates = (0..20).map(|i| {
            let service = h.service.clone();
            tokio::spawn(async move {
                service
                    .create_task(request(&format!("10.9.0.{}/32", i)))
                    .await
                    .unwrap()
            })
        });
        let tasks = futures::future::join_all(creates).await;

        let mut ids = HashSet::new();
        for task in tasks {
            let task = task.unwrap();
            assert!(ids.insert(task.id.clone()));
            h.service.wait(&task.id).await;
        }
        assert_eq!(ids.len(), 20);
    }

    #[tokio::test]
    async fn test_delete_only_terminal_tasks() {
        let h = harness(ScriptedConnector::new(Script::Hang));
        let mut req = request("10.4.0.1/32");
        req.timeout_seconds = Some(30);

        let task = h.service.create_task(req).await.unwrap();
        wait_until(&h.service, &task.id, |t| t.status == DiscoveryStatus::Running).await;
        assert!(matches!(
            h.service.delete_task(&task.id).await,
            Err(Error::Conflict(_))
        ));

        h.service.cancel_task(&task.id).await.unwrap();
        h.service.wait(&task.id).await;
        h.service.delete_task(&task.id).await.unwrap();

        assert!(matches!(
            h.service.get_task(&task.id).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            h.service.list_results(&task.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_tasks_paginates_and_filters() {
        let h = harness(ScriptedConnector::new(Script::Refused));
        for i in 1..=3 {
            let task = h
                .service
                .create_task(request(&format!("10.5.0.{}/32", i)))
                .await
                .unwrap();
            h.service.wait(&task.id).await;
        }

        let page = h.service.list_tasks(1, 2, None).await.unwrap();
        assert_eq!(page.tasks.len(), 2);
        assert_eq!(page.total, 3);

        let page = h.service.list_tasks(2, 2, None).await.unwrap();
        assert_eq!(page.tasks.len(), 1);

        let completed = h
            .service
            .list_tasks(1, 20, Some(DiscoveryStatus::Completed))
            .await
            .unwrap();
        assert_eq!(completed.total, 3);
        let cancelled = h
            .service
            .list_tasks(1, 20, Some(DiscoveryStatus::Cancelled))
            .await
            .unwrap();
        assert_eq!(cancelled.total, 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_all_scans() {
        let h = harness(ScriptedConnector::new(Script::Hang));
        let mut ids = Vec::new();
        for cidr in ["10.6.0.0/30", "10.7.0.0/30"] {
            let mut req = request(cidr);
            req.timeout_seconds = Some(30);
            let task = h.service.create_task(req).await.unwrap();
            wait_until(&h.service, &task.id, |t| t.status == DiscoveryStatus::Running).await;
            ids.push(task.id);
        }
        assert_eq!(h.service.active_scans().await, 2);

        tokio::time::timeout(Duration::from_secs(5), h.service.shutdown())
            .await
            .expect("shutdown 应及时返回");

        assert_eq!(h.service.active_scans().await, 0);
        for id in ids {
            assert_eq!(
                h.service.get_task(&id).await.unwrap().status,
                DiscoveryStatus::Cancelled
            );
        }
    }

    #[tokio::test]
    async fn test_rescan_host_with_agents_on_two_ports() {
        let h = harness(ScriptedConnector::new(Script::Agent(None)));

        let mut ids = Vec::new();
        for port in [9002, 9001, 9001] {
            let mut req = request("10.0.0.1/32");
            req.port = port;
            let task = h.service.create_task(req).await.unwrap();
            h.service.wait(&task.id).await;
            ids.push(task.id);
        }

        // 两个端口共用同一个节点名
        let nodes = h.store.nodes.all().await;
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.name == "node-10-0-0-1"));
        let on_9001 = nodes.iter().find(|n| n.port == 9001).unwrap();
        let by_name = h.store.nodes.get_by_name("node-10-0-0-1").await.unwrap();
        assert_eq!(by_name.port, 9002);

        for id in &ids[1..] {
            let results = h.service.list_results(id).await.unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].node_id.as_deref(), Some(on_9001.id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_list_tasks_with_huge_page() {
        let h = harness(ScriptedConnector::new(Script::Refused));
        let task = h.service.create_task(request("10.5.1.1/32")).await.unwrap();
        h.service.wait(&task.id).await;

        let page = h.service.list_tasks(u64::MAX, 100, None).await.unwrap();
        assert!(page.tasks.is_empty());
        assert_eq!(page.total, 1);
        assert_eq!(page.page, u64::MAX);
    }

    #[tokio::test]
    async fn test_cancel_registered_scan_not_yet_marked_running() {
        let h = harness(ScriptedConnector::new(Script::Hang));
        let task = h.service.build_task(request("10.6.1.0/30")).unwrap();
        h.store.tasks.create(&task).await.unwrap();

        // 扫描上下文已登记，但库里还没写成 running
        let (ctx, _, _results) = h.service.prepare(&task).unwrap();
        h.service.inner.registry.register(ctx.clone()).await;

        let cancelled = h.service.cancel_task(&task.id).await.unwrap();
        assert_eq!(cancelled.status, DiscoveryStatus::Cancelled);
        assert!(cancelled.started_at.is_some());
        assert!(ctx.is_cancelled());
        assert_eq!(h.service.active_scans().await, 0);

        // 之后扫描协程再写 running 不会覆盖终态
        assert!(!h.store.tasks.mark_running(&task.id, Utc::now()).await.unwrap());
        assert_eq!(
            h.store.tasks.get(&task.id).await.unwrap().status,
            DiscoveryStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_shutdown_right_after_create_leaves_no_task_open() {
        let h = harness(ScriptedConnector::new(Script::Hang));
        let mut ids = Vec::new();
        for i in 0..8 {
            let mut req = request(&format!("10.8.{}.0/30", i));
            req.timeout_seconds = Some(30);
            ids.push(h.service.create_task(req).await.unwrap().id);
        }

        tokio::time::timeout(Duration::from_secs(5), h.service.shutdown())
            .await
            .expect("shutdown 不应等待扫描跑完");
        assert_eq!(h.service.active_scans().await, 0);

        for id in &ids {
            let task = h.service.get_task(id).await.unwrap();
            match task.status {
                DiscoveryStatus::Cancelled => assert!(task.started_at.is_some()),
                DiscoveryStatus::Failed => {
                    assert!(task.started_at.is_none());
                    assert!(task.error_msg.is_some());
                }
                other => panic!("任务 {} 停留在 {}", id, other),
            }
            assert_eq!(last_completed(&h.sink, id).status, task.status);
        }

        // 关闭后创建的任务不会开始扫描
        let mut req = request("10.8.9.0/30");
        req.timeout_seconds = Some(30);
        let late = h.service.create_task(req).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), h.service.wait(&late.id))
            .await
            .expect("关闭后的任务应立即结束");
        assert_eq!(
            h.service.get_task(&late.id).await.unwrap().status,
            DiscoveryStatus::Failed
        );
    }

    #[test]
    fn test_pool_outcome_fallbacks() {
        let outcome = JobOutcome {
            job_id: "10.0.0.7".to_string(),
            result: JobResult::TimedOut,
            elapsed: Duration::from_secs(4),
        };
        let report = report_from(outcome, 9001).unwrap();
        assert_eq!(report.status, ProbeStatus::Timeout);
        assert_eq!(report.ip, ip(10, 0, 0, 7));

        let outcome = JobOutcome::<ProbeReport> {
            job_id: "10.0.0.8".to_string(),
            result: JobResult::Failed("boom".to_string()),
            elapsed: Duration::ZERO,
        };
        assert_eq!(report_from(outcome, 9001).unwrap().status, ProbeStatus::Error);
    }
}
