use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::models::{DiscoveryStatus, DiscoveryTask, ProgressSnapshot};
use common::{Error, Result};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};

use super::TaskRepository;
use crate::db::map_db_err;
use crate::db::models::discovery_result::{Column as ResultColumn, Entity as ResultEntity};
use crate::db::models::discovery_task::{
    ActiveModel as TaskActiveModel, Column as TaskColumn, Entity as TaskEntity,
};

pub struct SeaTaskRepository {
    db: DatabaseConnection,
}

impl SeaTaskRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn not_found(id: &str) -> Error {
    Error::NotFound(format!("发现任务不存在: {}", id))
}

#[async_trait]
impl TaskRepository for SeaTaskRepository {
    async fn create(&self, task: &DiscoveryTask) -> Result<()> {
        let active = TaskActiveModel::from(task);
        active.insert(&self.db).await.map_err(map_db_err)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<DiscoveryTask> {
        let model = TaskEntity::find_by_id(id.to_string())
            .one(&self.db)
            .await
            .map_err(map_db_err)?
            .ok_or_else(|| not_found(id))?;

        DiscoveryTask::try_from(model)
    }

    async fn update(&self, task: &DiscoveryTask) -> Result<()> {
        let active = TaskActiveModel::from(task);
        match active.update(&self.db).await {
            Ok(_) => Ok(()),
            Err(DbErr::RecordNotUpdated) => Err(not_found(&task.id)),
            Err(e) => Err(map_db_err(e)),
        }
    }

    async fn mark_running(&self, id: &str, started_at: DateTime<Utc>) -> Result<bool> {
        let started_at: sea_orm::prelude::DateTimeWithTimeZone = started_at.into();

        let res = TaskEntity::update_many()
            .col_expr(
                TaskColumn::Status,
                Expr::value(DiscoveryStatus::Running.as_str()),
            )
            .col_expr(TaskColumn::StartedAt, Expr::value(started_at))
            .col_expr(TaskColumn::UpdatedAt, Expr::value(started_at))
            .filter(TaskColumn::Id.eq(id))
            .filter(TaskColumn::Status.eq(DiscoveryStatus::Pending.as_str()))
            .exec(&self.db)
            .await
            .map_err(map_db_err)?;

        Ok(res.rows_affected > 0)
    }

    async fn update_progress(&self, id: &str, progress: ProgressSnapshot) -> Result<bool> {
        let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();

        let res = TaskEntity::update_many()
            .col_expr(TaskColumn::ScannedIps, Expr::value(progress.scanned as i64))
            .col_expr(TaskColumn::FoundNodes, Expr::value(progress.found as i64))
            .col_expr(TaskColumn::FailedIps, Expr::value(progress.failed as i64))
            .col_expr(TaskColumn::UpdatedAt, Expr::value(now))
            .filter(TaskColumn::Id.eq(id))
            .filter(TaskColumn::Status.eq(DiscoveryStatus::Running.as_str()))
            .exec(&self.db)
            .await
            .map_err(map_db_err)?;

        Ok(res.rows_affected > 0)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let txn = self.db.begin().await.map_err(map_db_err)?;

        ResultEntity::delete_many()
            .filter(ResultColumn::TaskId.eq(id))
            .exec(&txn)
            .await
            .map_err(map_db_err)?;

        let res = TaskEntity::delete_by_id(id.to_string())
            .exec(&txn)
            .await
            .map_err(map_db_err)?;

        if res.rows_affected == 0 {
            txn.rollback().await.map_err(map_db_err)?;
            return Err(not_found(id));
        }

        txn.commit().await.map_err(map_db_err)?;
        Ok(())
    }

    async fn list(
        &self,
        offset: u64,
        limit: u64,
        status: Option<DiscoveryStatus>,
    ) -> Result<(Vec<DiscoveryTask>, u64)> {
        let mut query = TaskEntity::find();

        // 状态过滤
        if let Some(status) = status {
            query = query.filter(TaskColumn::Status.eq(status.as_str()));
        }

        query = query.order_by_desc(TaskColumn::CreatedAt);

        let total = query.clone().count(&self.db).await.map_err(map_db_err)?;

        let tasks = query
            .offset(offset)
            .limit(limit)
            .all(&self.db)
            .await
            .map_err(map_db_err)?
            .into_iter()
            .map(DiscoveryTask::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok((tasks, total))
    }
}
