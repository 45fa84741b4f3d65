/// WebSocket RPC 数据类型定义
///
/// Agent（进程守护程序）对外暴露的方法与响应结构

use serde::{Deserialize, Serialize};

/// 方法名
pub mod methods {
    /// 查询守护进程状态
    pub const GET_STATE: &str = "supervisor.getState";
}

/// `supervisor.getState` 响应
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentStateResponse {
    pub statecode: i32,
    pub statename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identification: Option<String>,
}

impl AgentStateResponse {
    /// 尽力提取版本/标识字符串
    pub fn version_string(&self) -> Option<String> {
        self.version
            .as_deref()
            .or(self.identification.as_deref())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}
