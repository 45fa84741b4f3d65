use async_trait::async_trait;
use common::models::DiscoveryResult;
use common::Result;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};

use super::ResultRepository;
use crate::db::map_db_err;
use crate::db::models::discovery_result::{
    ActiveModel as ResultActiveModel, Column as ResultColumn, Entity as ResultEntity,
};

pub struct SeaResultRepository {
    db: DatabaseConnection,
}

impl SeaResultRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ResultRepository for SeaResultRepository {
    async fn create(&self, result: &DiscoveryResult) -> Result<()> {
        ResultActiveModel::from(result)
            .insert(&self.db)
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    async fn list_by_task(&self, task_id: &str) -> Result<Vec<DiscoveryResult>> {
        ResultEntity::find()
            .filter(ResultColumn::TaskId.eq(task_id))
            .order_by_asc(ResultColumn::CreatedAt)
            .all(&self.db)
            .await
            .map_err(map_db_err)?
            .into_iter()
            .map(DiscoveryResult::try_from)
            .collect()
    }
}
