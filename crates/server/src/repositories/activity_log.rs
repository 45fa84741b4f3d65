use async_trait::async_trait;
use common::models::ActivityLog;
use common::Result;
use sea_orm::{ActiveModelTrait, DatabaseConnection};

use super::ActivityLogRepository;
use crate::db::map_db_err;
use crate::db::models::activity_log::ActiveModel as ActivityLogActiveModel;

pub struct SeaActivityLogRepository {
    db: DatabaseConnection,
}

impl SeaActivityLogRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ActivityLogRepository for SeaActivityLogRepository {
    async fn record(&self, entry: &ActivityLog) -> Result<()> {
        ActivityLogActiveModel::from(entry)
            .insert(&self.db)
            .await
            .map_err(map_db_err)?;
        Ok(())
    }
}
