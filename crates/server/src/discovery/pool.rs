/// 通用工作池
///
/// 固定数量的工作协程从有界队列取任务，带超时执行，并把结果按完成顺序写入结果通道。
/// `close` 停止接收新任务并让队列排空；`stop` 额外取消执行中的任务并丢弃未开始的任务。

use async_trait::async_trait;
use common::{Error, Result};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 工作单元
#[async_trait]
pub trait Job: Send + Sync + 'static {
    type Output: Send + 'static;

    /// 用于把结果关联回提交方
    fn id(&self) -> &str;

    /// 执行任务，必须及时响应 `cancel`
    async fn execute(&self, cancel: CancellationToken) -> anyhow::Result<Self::Output>;
}

type BoxedJob<T> = Box<dyn Job<Output = T>>;

/// 单个任务的执行结果
#[derive(Debug)]
pub enum JobResult<T> {
    Completed(T),
    Failed(String),
    /// 超过单任务超时
    TimedOut,
    /// 工作池停止时仍在执行
    Cancelled,
}

#[derive(Debug)]
pub struct JobOutcome<T> {
    pub job_id: String,
    pub result: JobResult<T>,
    pub elapsed: Duration,
}

/// 工作池配置
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub result_capacity: usize,
    pub job_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: common::models::constants::DEFAULT_MAX_WORKERS,
            queue_capacity: 1024,
            result_capacity: 1024,
            job_timeout: Duration::from_secs(common::models::constants::DEFAULT_PROBE_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Validation("工作协程数必须大于 0".to_string()));
        }
        if self.queue_capacity == 0 || self.result_capacity == 0 {
            return Err(Error::Validation("队列容量必须大于 0".to_string()));
        }
        if self.job_timeout.is_zero() {
            return Err(Error::Validation("任务超时必须大于 0".to_string()));
        }
        Ok(())
    }
}

/// 工作池
pub struct WorkerPool<T: Send + 'static> {
    config: PoolConfig,
    queue: Mutex<Option<mpsc::Sender<BoxedJob<T>>>>,
    results: Mutex<Option<mpsc::Receiver<JobOutcome<T>>>>,
    cancel: CancellationToken,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// 创建并立即启动工作协程，必须在 tokio 运行时内调用
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::with_parent(config, &CancellationToken::new())
    }

    /// 父令牌取消时工作池随之停止
    pub fn with_parent(config: PoolConfig, parent: &CancellationToken) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("没有可用的 tokio 运行时: {}", e)))?;

        let (queue_tx, queue_rx) = mpsc::channel::<BoxedJob<T>>(config.queue_capacity);
        let (result_tx, result_rx) = mpsc::channel(config.result_capacity);
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let cancel = parent.child_token();

        let handles = (0..config.workers)
            .map(|index| {
                runtime.spawn(worker_loop(
                    index,
                    queue_rx.clone(),
                    result_tx.clone(),
                    cancel.clone(),
                    config.job_timeout,
                ))
            })
            .collect();

        debug!(
            "工作池已启动: workers={}, queue={}, timeout={:?}",
            config.workers, config.queue_capacity, config.job_timeout
        );

        Ok(Self {
            config,
            queue: Mutex::new(Some(queue_tx)),
            results: Mutex::new(Some(result_rx)),
            cancel,
            workers: tokio::sync::Mutex::new(handles),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// 非阻塞提交，队列满时返回 `Error::QueueFull`
    pub fn submit<J>(&self, job: J) -> Result<()>
    where
        J: Job<Output = T>,
    {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = queue
            .as_ref()
            .ok_or_else(|| Error::Conflict("工作池已关闭".to_string()))?;

        sender.try_send(Box::new(job)).map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueFull(self.config.queue_capacity),
            TrySendError::Closed(_) => Error::Conflict("工作池已关闭".to_string()),
        })
    }

    /// 取走结果通道（只能取一次）
    ///
    /// 通道在所有工作协程退出后结束：`close` 后队列排空，或 `stop` 后
    pub fn take_results(&self) -> Option<mpsc::Receiver<JobOutcome<T>>> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// 不再接收新任务，已排队的任务继续执行
    pub fn close(&self) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// 停止工作池：取消执行中的任务，丢弃未开始的任务，等待所有工作协程退出。可重复调用
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.close();

        let handles = std::mem::take(&mut *self.workers.lock().await);
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!("工作协程异常退出: {}", e);
                }
            }
        }
        debug!("工作池已停止");
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn worker_loop<T: Send + 'static>(
    index: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<BoxedJob<T>>>>,
    results: mpsc::Sender<JobOutcome<T>>,
    cancel: CancellationToken,
    job_timeout: Duration,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            job = async { queue.lock().await.recv().await } => job,
        };
        let Some(job) = next else {
            break;
        };

        let outcome = run_job(job.as_ref(), &cancel, job_timeout).await;

        tokio::select! {
            biased;
            sent = results.send(outcome) => {
                if sent.is_err() {
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    debug!("工作协程退出: worker={}", index);
}

async fn run_job<T: Send + 'static>(
    job: &dyn Job<Output = T>,
    pool_cancel: &CancellationToken,
    job_timeout: Duration,
) -> JobOutcome<T> {
    let started = Instant::now();
    let token = pool_cancel.child_token();

    let result = tokio::select! {
        biased;
        _ = pool_cancel.cancelled() => JobResult::Cancelled,
        res = tokio::time::timeout(job_timeout, job.execute(token.clone())) => match res {
            Ok(Ok(value)) => JobResult::Completed(value),
            Ok(Err(e)) => JobResult::Failed(format!("{:#}", e)),
            Err(_) => {
                token.cancel();
                JobResult::TimedOut
            }
        },
    };

    JobOutcome {
        job_id: job.id().to_string(),
        result,
        elapsed: started.elapsed(),
    }
}
