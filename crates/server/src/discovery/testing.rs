//! 测试替身：脚本化的 Agent 连接器与记录型事件出口

use async_trait::async_trait;
use common::ws_rpc::AgentStateResponse;
use common::{RpcError, RpcErrorCode};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::events::{DiscoveryEvent, EventSink};
use super::probe::{AgentConnector, Credentials};

/// 某个地址上的预设行为
#[derive(Debug, Clone)]
pub enum Script {
    Agent(Option<String>),
    Refused,
    Unauthorized,
    Broken,
    /// 永不返回，只能靠超时或取消结束
    Hang,
}

pub struct ScriptedConnector {
    scripts: HashMap<IpAddr, Script>,
    default: Script,
    calls: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(default: Script) -> Self {
        Self {
            scripts: HashMap::new(),
            default,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, ip: IpAddr, script: Script) -> Self {
        self.scripts.insert(ip, script);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentConnector for ScriptedConnector {
    async fn query_state(
        &self,
        addr: SocketAddr,
        _credentials: &Credentials,
        _timeout: Duration,
    ) -> Result<AgentStateResponse, RpcError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .get(&addr.ip())
            .cloned()
            .unwrap_or_else(|| self.default.clone());

        match script {
            Script::Agent(version) => Ok(AgentStateResponse {
                statecode: 1,
                statename: "RUNNING".to_string(),
                version,
                identification: None,
            }),
            Script::Refused => Err(RpcError::new(RpcErrorCode::ConnectionRefused, "refused")),
            Script::Unauthorized => Err(RpcError::new(RpcErrorCode::Unauthorized, "401")),
            Script::Broken => Err(RpcError::new(RpcErrorCode::NetworkError, "no route")),
            Script::Hang => {
                futures::future::pending::<()>().await;
                Err(RpcError::connection_closed())
            }
        }
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DiscoveryEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<DiscoveryEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for(&self, task_id: &str) -> Vec<DiscoveryEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.task_id() == task_id)
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn broadcast(&self, event: DiscoveryEvent) -> usize {
        self.events.lock().unwrap().push(event);
        1
    }
}
