/// 发现任务数据模型

use chrono::Utc;
use common::models::{DiscoveryStatus, DiscoveryTask};
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// 发现任务模型
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "discovery_tasks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    // 扫描参数
    pub cidr: String,
    pub port: i32,
    pub username: String,
    pub password: String,
    pub timeout_secs: i64,
    pub max_workers: i32,
    pub created_by: String,

    // 状态与进度
    pub status: String, // pending, running, completed, failed, cancelled
    pub total_ips: i64,
    pub scanned_ips: i64,
    pub found_nodes: i64,
    pub failed_ips: i64,
    pub error_msg: Option<String>,

    // 时间戳
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
    pub started_at: Option<DateTimeWithTimeZone>,
    pub completed_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::discovery_result::Entity")]
    Results,
}

impl Related<super::discovery_result::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Results.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for DiscoveryTask {
    type Error = common::Error;

    fn try_from(m: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            status: m.status.parse::<DiscoveryStatus>()?,
            id: m.id,
            cidr: m.cidr,
            port: m.port as u16,
            username: m.username,
            password: m.password,
            timeout_secs: m.timeout_secs as u64,
            max_workers: m.max_workers as u32,
            created_by: m.created_by,
            total_ips: m.total_ips as u64,
            scanned_ips: m.scanned_ips as u64,
            found_nodes: m.found_nodes as u64,
            failed_ips: m.failed_ips as u64,
            error_msg: m.error_msg,
            created_at: m.created_at.with_timezone(&Utc),
            started_at: m.started_at.map(|t| t.with_timezone(&Utc)),
            completed_at: m.completed_at.map(|t| t.with_timezone(&Utc)),
        })
    }
}

impl From<&DiscoveryTask> for ActiveModel {
    fn from(task: &DiscoveryTask) -> Self {
        Self {
            id: Set(task.id.clone()),
            cidr: Set(task.cidr.clone()),
            port: Set(task.port as i32),
            username: Set(task.username.clone()),
            password: Set(task.password.clone()),
            timeout_secs: Set(task.timeout_secs as i64),
            max_workers: Set(task.max_workers as i32),
            created_by: Set(task.created_by.clone()),
            status: Set(task.status.as_str().to_string()),
            total_ips: Set(task.total_ips as i64),
            scanned_ips: Set(task.scanned_ips as i64),
            found_nodes: Set(task.found_nodes as i64),
            failed_ips: Set(task.failed_ips as i64),
            error_msg: Set(task.error_msg.clone()),
            created_at: Set(task.created_at.into()),
            updated_at: Set(Utc::now().into()),
            started_at: Set(task.started_at.map(Into::into)),
            completed_at: Set(task.completed_at.map(Into::into)),
        }
    }
}

/// 发起扫描请求 DTO
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ScanRequest {
    #[validate(length(min = 1, max = 64))]
    pub cidr: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u32,

    #[validate(length(min = 1, max = 255))]
    pub username: String,

    #[validate(length(min = 1, max = 255))]
    pub password: String,

    /// 单次探测超时（秒），缺省使用配置值
    #[validate(range(min = 1, max = 60))]
    pub timeout_seconds: Option<u64>,

    /// 并发探测数，缺省使用配置值
    #[validate(range(min = 1))]
    pub max_workers: Option<u32>,

    #[validate(length(min = 1, max = 255))]
    pub created_by: String,
}

/// 任务列表响应 DTO
#[derive(Debug, Serialize, Deserialize)]
pub struct DiscoveryTaskListResponse {
    pub tasks: Vec<DiscoveryTask>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
}
