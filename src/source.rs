use crate::config::DbConfig;
use crate::db::{self, DbPool};
use crate::error::SourceError;
use crate::logging::DbLogFlusher;
use crate::status::{EquipmentStatus, StatusSnapshot};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use tokio::sync::watch;
use tracing::{debug, info};

/// Opens connections to the equipment data source.
#[async_trait]
pub trait Connector: Send + Sync {
    type Source: StatusSource;

    async fn connect(&self) -> Result<Self::Source, SourceError>;
}

/// A live connection able to report the latest status of every equipment.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn is_alive(&self) -> bool;

    /// One entry per equipment with at least one mode-bearing record.
    async fn fetch_latest_statuses(&self) -> Result<StatusSnapshot, SourceError>;

    async fn close(&self);
}

/// A raw event row carrying a PM mode.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StatusRow {
    pub eqp_id: String,
    pub pm_mode: Option<i64>,
    pub tm: NaiveDateTime,
    /// Tie breaker among rows sharing `tm`.
    pub seq: i64,
}

/// Latest-wins reduction: per equipment, the row with the greatest
/// `(tm, seq)` among rows with a non-null mode. Equipment keep the order in
/// which they first appear.
pub fn reduce_latest<I>(rows: I) -> StatusSnapshot
where
    I: IntoIterator<Item = StatusRow>,
{
    let mut latest: IndexMap<String, StatusRow> = IndexMap::new();
    for row in rows.into_iter().filter(|r| r.pm_mode.is_some()) {
        match latest.get_mut(&row.eqp_id) {
            Some(kept) if (row.tm, row.seq) > (kept.tm, kept.seq) => *kept = row,
            Some(_) => {}
            None => {
                latest.insert(row.eqp_id.clone(), row);
            }
        }
    }

    latest
        .into_values()
        .map(|r| EquipmentStatus::new(r.eqp_id, r.pm_mode, r.tm))
        .collect()
}

pub struct MySqlConnector {
    cfg: DbConfig,
    pool_tx: Option<watch::Sender<Option<DbPool>>>,
    log_flusher: Option<DbLogFlusher>,
}

impl MySqlConnector {
    pub fn new(cfg: DbConfig) -> Self {
        Self {
            cfg,
            pool_tx: None,
            log_flusher: None,
        }
    }

    /// Publish every freshly opened pool, e.g. to the database log writer.
    pub fn with_pool_listener(mut self, tx: watch::Sender<Option<DbPool>>) -> Self {
        self.pool_tx = Some(tx);
        self
    }

    /// Flush the database log writer before a pool is closed, so records
    /// logged up to the close still reach `ecas_logs`.
    pub fn with_log_flusher(mut self, flusher: DbLogFlusher) -> Self {
        self.log_flusher = Some(flusher);
        self
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    type Source = MySqlStatusSource;

    async fn connect(&self) -> Result<MySqlStatusSource, SourceError> {
        let pool = db::connect(&self.cfg).await?;
        sqlx::query("SELECT 1").execute(&pool).await?;

        if let Some(tx) = &self.pool_tx {
            tx.send_replace(Some(pool.clone()));
        }
        info!("Successfully connected to the database.");

        let mut source = MySqlStatusSource::new(
            pool,
            &self.cfg.raw_table,
            self.cfg.tie_break_column.as_deref(),
        );
        source.log_flusher = self.log_flusher.clone();
        Ok(source)
    }
}

pub struct MySqlStatusSource {
    pool: DbPool,
    query: String,
    log_flusher: Option<DbLogFlusher>,
}

impl MySqlStatusSource {
    /// `raw_table` and `tie_break_column` must already be validated as plain
    /// identifiers.
    pub fn new(pool: DbPool, raw_table: &str, tie_break_column: Option<&str>) -> Self {
        Self {
            pool,
            query: latest_status_query(raw_table, tie_break_column),
            log_flusher: None,
        }
    }
}

/// Without a tie-break column, rows sharing `tm` fall back to `seq = 0` and
/// the database picks one of them.
fn latest_status_query(raw_table: &str, tie_break_column: Option<&str>) -> String {
    let (seq, order) = match tie_break_column {
        Some(column) => (
            format!("CAST({column} AS SIGNED)"),
            format!("tm DESC, {column} DESC"),
        ),
        None => ("CAST(0 AS SIGNED)".to_string(), "tm DESC".to_string()),
    };

    format!(
        r#"
        WITH ranked AS (
            SELECT
                eqp_id,
                CAST(pm_mode AS SIGNED) AS pm_mode,
                tm,
                {seq} AS seq,
                ROW_NUMBER() OVER (PARTITION BY eqp_id ORDER BY {order}) AS rn
            FROM {raw_table}
            WHERE pm_mode IS NOT NULL
        )
        SELECT eqp_id, pm_mode, tm, seq
        FROM ranked
        WHERE rn = 1
        ORDER BY eqp_id
        "#
    )
}

#[async_trait]
impl StatusSource for MySqlStatusSource {
    async fn is_alive(&self) -> bool {
        if self.pool.is_closed() {
            return false;
        }
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn fetch_latest_statuses(&self) -> Result<StatusSnapshot, SourceError> {
        let rows = sqlx::query_as::<_, StatusRow>(&self.query)
            .fetch_all(&self.pool)
            .await?;
        debug!(rows = rows.len(), "latest status rows fetched");

        let snapshot = reduce_latest(rows);
        info!("Fetched latest statuses for {} equipments.", snapshot.len());
        Ok(snapshot)
    }

    async fn close(&self) {
        info!("Database connection closed.");
        if let Some(flusher) = &self.log_flusher {
            flusher.flush().await;
        }
        self.pool.close().await;
    }
}
