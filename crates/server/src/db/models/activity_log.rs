/// 审计/系统事件日志模型

use chrono::Utc;
use common::models::ActivityLog;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "activity_logs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub action: String,        // discovery.completed, discovery.cancelled, ...
    pub resource_type: String, // discovery_task
    pub resource_id: String,
    pub actor: String,
    pub detail: JsonValue,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for ActivityLog {
    fn from(m: Model) -> Self {
        Self {
            id: m.id,
            action: m.action,
            resource_type: m.resource_type,
            resource_id: m.resource_id,
            actor: m.actor,
            detail: m.detail,
            created_at: m.created_at.with_timezone(&Utc),
        }
    }
}

impl From<&ActivityLog> for ActiveModel {
    fn from(log: &ActivityLog) -> Self {
        Self {
            id: Set(log.id.clone()),
            action: Set(log.action.clone()),
            resource_type: Set(log.resource_type.clone()),
            resource_id: Set(log.resource_id.clone()),
            actor: Set(log.actor.clone()),
            detail: Set(log.detail.clone()),
            created_at: Set(log.created_at.into()),
        }
    }
}
