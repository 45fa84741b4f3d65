use async_trait::async_trait;
use common::models::Node;
use common::{Error, Result};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder,
};

use super::NodeRepository;
use crate::db::map_db_err;
use crate::db::models::node::{
    ActiveModel as NodeActiveModel, Column as NodeColumn, Entity as NodeEntity,
};

pub struct SeaNodeRepository {
    db: DatabaseConnection,
}

impl SeaNodeRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl NodeRepository for SeaNodeRepository {
    async fn exists_by_host_port(&self, host: &str, port: u16) -> Result<bool> {
        let count = NodeEntity::find()
            .filter(NodeColumn::Host.eq(host))
            .filter(NodeColumn::Port.eq(port as i32))
            .count(&self.db)
            .await
            .map_err(map_db_err)?;

        Ok(count > 0)
    }

    async fn create(&self, node: &Node) -> Result<()> {
        NodeActiveModel::from(node)
            .insert(&self.db)
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    async fn get_by_name(&self, name: &str) -> Result<Node> {
        let model = NodeEntity::find()
            .filter(NodeColumn::Name.eq(name))
            .order_by_asc(NodeColumn::CreatedAt)
            .one(&self.db)
            .await
            .map_err(map_db_err)?
            .ok_or_else(|| Error::NotFound(format!("节点不存在: {}", name)))?;

        Node::try_from(model)
    }

    async fn get_by_host_port(&self, host: &str, port: u16) -> Result<Option<Node>> {
        NodeEntity::find()
            .filter(NodeColumn::Host.eq(host))
            .filter(NodeColumn::Port.eq(port as i32))
            .one(&self.db)
            .await
            .map_err(map_db_err)?
            .map(Node::try_from)
            .transpose()
    }
}
