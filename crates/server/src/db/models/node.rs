use chrono::Utc;
use common::models::{Node, NodeStatus};
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

/// 节点模型
///
/// (host, port) 上有唯一索引，由建表脚本保证
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "nodes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: i32,
    pub username: String,
    pub password: String,
    pub status: String,
    pub version: Option<String>,

    // 时间戳
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for Node {
    type Error = common::Error;

    fn try_from(m: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            status: m.status.parse::<NodeStatus>()?,
            id: m.id,
            name: m.name,
            host: m.host,
            port: m.port as u16,
            username: m.username,
            password: m.password,
            version: m.version,
            created_at: m.created_at.with_timezone(&Utc),
            updated_at: m.updated_at.with_timezone(&Utc),
        })
    }
}

impl From<&Node> for ActiveModel {
    fn from(node: &Node) -> Self {
        Self {
            id: Set(node.id.clone()),
            name: Set(node.name.clone()),
            host: Set(node.host.clone()),
            port: Set(node.port as i32),
            username: Set(node.username.clone()),
            password: Set(node.password.clone()),
            status: Set(node.status.as_str().to_string()),
            version: Set(node.version.clone()),
            created_at: Set(node.created_at.into()),
            updated_at: Set(node.updated_at.into()),
        }
    }
}
