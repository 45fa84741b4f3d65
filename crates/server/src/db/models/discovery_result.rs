/// 发现结果数据模型

use chrono::Utc;
use common::models::{DiscoveryResult, ProbeStatus};
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "discovery_results")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub task_id: String,
    pub ip: String,
    pub port: i32,
    pub status: String, // success, timeout, connection_refused, auth_failed, error
    pub version: Option<String>,
    pub error_msg: Option<String>,
    pub duration_ms: i64,
    pub node_id: Option<String>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::discovery_task::Entity",
        from = "Column::TaskId",
        to = "super::discovery_task::Column::Id"
    )]
    Task,
}

impl Related<super::discovery_task::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Task.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for DiscoveryResult {
    type Error = common::Error;

    fn try_from(m: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            status: m.status.parse::<ProbeStatus>()?,
            id: m.id,
            task_id: m.task_id,
            ip: m.ip,
            port: m.port as u16,
            version: m.version,
            error_msg: m.error_msg,
            duration_ms: m.duration_ms as u64,
            node_id: m.node_id,
            created_at: m.created_at.with_timezone(&Utc),
        })
    }
}

impl From<&DiscoveryResult> for ActiveModel {
    fn from(r: &DiscoveryResult) -> Self {
        Self {
            id: Set(r.id.clone()),
            task_id: Set(r.task_id.clone()),
            ip: Set(r.ip.clone()),
            port: Set(r.port as i32),
            status: Set(r.status.as_str().to_string()),
            version: Set(r.version.clone()),
            error_msg: Set(r.error_msg.clone()),
            duration_ms: Set(r.duration_ms as i64),
            node_id: Set(r.node_id.clone()),
            created_at: Set(r.created_at.into()),
        }
    }
}
