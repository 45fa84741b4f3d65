/// 单地址探测
///
/// 一个探测对应一个 ip:port，向远端 Agent 发起一次状态查询并把结果归为
/// success / timeout / connection_refused / auth_failed / error 之一。

use async_trait::async_trait;
use common::models::ProbeStatus;
use common::ws_rpc::{methods, AgentStateResponse};
use common::{AgentRpcClient, RpcError, RpcErrorCode};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::pool::Job;

/// 探测使用的凭据，同一任务内的所有探测共享
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// 远端 Agent 连接器
#[async_trait]
pub trait AgentConnector: Send + Sync + 'static {
    /// 查询 `addr` 上 Agent 的运行状态
    async fn query_state(
        &self,
        addr: SocketAddr,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<AgentStateResponse, RpcError>;
}

/// 基于 WebSocket RPC 的连接器
#[derive(Debug, Default, Clone)]
pub struct WsAgentConnector;

#[async_trait]
impl AgentConnector for WsAgentConnector {
    async fn query_state(
        &self,
        addr: SocketAddr,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<AgentStateResponse, RpcError> {
        let client = AgentRpcClient::new(addr, &credentials.username, &credentials.password)?;
        let reply = client
            .call(methods::GET_STATE, serde_json::json!({}), timeout)
            .await?;
        reply.payload_as::<AgentStateResponse>()
    }
}

/// 单个探测的结果
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub ip: IpAddr,
    pub port: u16,
    pub status: ProbeStatus,
    pub version: Option<String>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl ProbeReport {
    /// 未拿到探测自身结果时的兜底记录
    pub fn failed(
        ip: IpAddr,
        port: u16,
        status: ProbeStatus,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            ip,
            port,
            status,
            version: None,
            error: Some(error.into()),
            duration,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}

/// 将 RPC 错误归类为探测结果
pub fn classify(err: &RpcError) -> ProbeStatus {
    match err.code {
        RpcErrorCode::ConnectionRefused => ProbeStatus::ConnectionRefused,
        RpcErrorCode::Unauthorized => ProbeStatus::AuthFailed,
        RpcErrorCode::Timeout => ProbeStatus::Timeout,
        _ => ProbeStatus::Error,
    }
}

/// 探测任务
pub struct Probe {
    id: String,
    addr: SocketAddr,
    credentials: Arc<Credentials>,
    timeout: Duration,
    connector: Arc<dyn AgentConnector>,
}

impl Probe {
    pub fn new(
        ip: IpAddr,
        port: u16,
        credentials: Arc<Credentials>,
        timeout: Duration,
        connector: Arc<dyn AgentConnector>,
    ) -> Self {
        Self {
            id: ip.to_string(),
            addr: SocketAddr::new(ip, port),
            credentials,
            timeout,
            connector,
        }
    }

    /// 执行探测，总是恰好产生一个结果
    pub async fn run(&self, cancel: CancellationToken) -> ProbeReport {
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RpcError::timeout("探测被取消")),
            res = tokio::time::timeout(
                self.timeout,
                self.connector.query_state(self.addr, &self.credentials, self.timeout),
            ) => match res {
                Ok(inner) => inner,
                Err(_) => Err(RpcError::timeout(format!("探测超时 ({:?})", self.timeout))),
            },
        };

        let duration = started.elapsed();
        let report = match outcome {
            Ok(state) => ProbeReport {
                ip: self.addr.ip(),
                port: self.addr.port(),
                status: ProbeStatus::Success,
                version: state.version_string(),
                error: None,
                duration,
            },
            Err(e) => ProbeReport::failed(
                self.addr.ip(),
                self.addr.port(),
                classify(&e),
                e.message,
                duration,
            ),
        };

        debug!(
            "探测完成: {} -> {} ({} ms)",
            self.addr,
            report.status,
            report.duration_ms()
        );
        report
    }
}

#[async_trait]
impl Job for Probe {
    type Output = ProbeReport;

    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, cancel: CancellationToken) -> anyhow::Result<ProbeReport> {
        Ok(self.run(cancel).await)
    }
}
