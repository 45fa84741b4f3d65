/// 工具函数集合

use std::net::IpAddr;
use uuid::Uuid;

use crate::models::constants::NODE_NAME_PREFIX;

/// 生成唯一 ID
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// 根据 IP 生成节点名称
///
/// 名称只取决于地址本身（与端口无关），不含 `.`，不同地址不会得到相同名称。
/// IPv4 为四段十进制，IPv6 为展开后的八段十六进制，段数不同因此两族不会冲突。
pub fn generate_node_name(ip: IpAddr) -> String {
    let body = match ip {
        IpAddr::V4(v4) => v4
            .octets()
            .iter()
            .map(|o| o.to_string())
            .collect::<Vec<_>>()
            .join("-"),
        IpAddr::V6(v6) => v6
            .segments()
            .iter()
            .map(|s| format!("{:x}", s))
            .collect::<Vec<_>>()
            .join("-"),
    };
    format!("{}{}", NODE_NAME_PREFIX, body)
}

/// 计算百分比，total 为 0 时返回 0，结果限制在 [0, 100]
pub fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}
