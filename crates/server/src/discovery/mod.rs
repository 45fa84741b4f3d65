/// 节点发现核心
///
/// 网段枚举、通用工作池、单地址探测、活动扫描注册表以及发现事件

pub mod cidr;
pub mod events;
pub mod pool;
pub mod probe;
pub mod registry;

#[cfg(test)]
pub mod testing;

pub use cidr::AddressRange;
pub use events::{DiscoveryEvent, EventSink};
pub use probe::{AgentConnector, Credentials, Probe, ProbeReport, WsAgentConnector};
pub use registry::{ScanContext, ScanRegistry};
