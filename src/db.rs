use crate::config::DbConfig;
use sqlx::{mysql::MySqlPoolOptions, MySql, Pool};
use std::time::Duration;

pub type DbPool = Pool<MySql>;

/// Statements run in autocommit mode, so each read sees the latest committed
/// rows rather than a snapshot pinned by an open transaction.
pub async fn connect(cfg: &DbConfig) -> Result<DbPool, sqlx::Error> {
    MySqlPoolOptions::new()
        .max_connections(cfg.max_connections)
        .acquire_timeout(Duration::from_secs(cfg.connect_timeout_secs))
        .connect(&cfg.url)
        .await
}
