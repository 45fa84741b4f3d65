/// 应用全局状态

use crate::services::DiscoveryService;
use crate::ws::FrontendConnectionManager;

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    /// 节点发现服务，持有全部运行中的扫描
    pub discovery: DiscoveryService,
    /// 前端 WebSocket 连接管理器，同时是发现事件的出口
    pub frontend_manager: FrontendConnectionManager,
}

impl AppState {
    pub fn new(discovery: DiscoveryService, frontend_manager: FrontendConnectionManager) -> Self {
        Self {
            discovery,
            frontend_manager,
        }
    }

    /// 获取节点发现服务
    pub fn discovery(&self) -> DiscoveryService {
        self.discovery.clone()
    }

    /// 获取前端连接管理器
    pub fn frontend_manager(&self) -> FrontendConnectionManager {
        self.frontend_manager.clone()
    }
}
