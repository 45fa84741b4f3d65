/// 数据库访问层

pub mod models;

use common::Error;
use sea_orm::{Database, DatabaseConnection, DbErr, SqlErr};
use tracing::info;

/// 建立数据库连接 (SeaORM)
pub async fn establish_connection(database_url: &str) -> Result<DatabaseConnection, anyhow::Error> {
    info!("正在连接数据库: {}", redact(database_url));

    let db = Database::connect(database_url).await?;
    info!("数据库连接成功");

    Ok(db)
}

/// 将 SeaORM 错误转换为统一错误，唯一约束冲突单独区分
pub fn map_db_err(err: DbErr) -> Error {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(msg)) => Error::AlreadyExists(msg),
        _ => Error::Database(err.to_string()),
    }
}

/// 日志中隐藏连接串里的密码
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let creds = &url[scheme_end + 3..at];
            match creds.find(':') {
                Some(colon) => format!(
                    "{}{}:***{}",
                    &url[..scheme_end + 3],
                    &creds[..colon],
                    &url[at..]
                ),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}
