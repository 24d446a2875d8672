use crate::config::{LogSink, LoggingConfig};
use crate::db::DbPool;
use crate::error::{AppError, Result};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::field::{Field, Visit};
use tracing::{info, Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const DB_LOG_CHANNEL_CAPACITY: usize = 1024;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Only this crate's events are forwarded; sqlx's own query logging would
/// otherwise feed back into the log table.
const FORWARDED_TARGET: &str = "pm_mode_mailer";

/// One row of the `ecas_logs` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: &'static str,
    pub eqp_id: Option<String>,
    pub message: String,
}

pub type DbLogReceiver = mpsc::Receiver<LogRecord>;

/// Keeps the installed sink running. Dropping it flushes and stops the
/// background file writer, so hold it until the process exits.
pub struct LoggingHandle {
    /// Records to hand to a [`DbLogWriter`] when the database sink is active.
    pub db_logs: Option<DbLogReceiver>,
    _file_guard: Option<WorkerGuard>,
}

/// Installs the global subscriber for the configured sink.
pub fn init(cfg: &LoggingConfig) -> Result<LoggingHandle> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let registry = tracing_subscriber::registry().with(filter);

    let mut handle = LoggingHandle {
        db_logs: None,
        _file_guard: None,
    };

    match cfg.sink {
        LogSink::Console => {
            registry
                .with(fmt::layer().with_target(false).compact())
                .try_init()
                .map_err(|e| AppError::Logging(e.to_string()))?;
        }
        LogSink::File => {
            let dir = log_dir(&cfg.file);
            std::fs::create_dir_all(&dir)?;
            let pruned = match cfg.retention() {
                Some(max_age) => prune_old_logs(&dir, &log_prefix(&cfg.file), max_age)?,
                None => Vec::new(),
            };

            let (writer, guard) = tracing_appender::non_blocking(rolling_appender(cfg)?);
            registry
                .with(
                    fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(false),
                )
                .try_init()
                .map_err(|e| AppError::Logging(e.to_string()))?;
            handle._file_guard = Some(guard);

            for path in pruned {
                info!(path = %path.display(), "Deleted old log file");
            }
        }
        LogSink::Database => {
            let (layer, rx) = DbLogLayer::new(DB_LOG_CHANNEL_CAPACITY);
            registry
                .with(fmt::layer().with_target(false).compact())
                .with(layer)
                .try_init()
                .map_err(|e| AppError::Logging(e.to_string()))?;
            handle.db_logs = Some(rx);
        }
    }

    Ok(handle)
}

/// Daily rotating appender for `cfg.file`: `logs/pm_mode_mailer.log` becomes
/// `logs/pm_mode_mailer.2025-05-12.log`, keeping at most `cfg.max_files`.
pub fn rolling_appender(cfg: &LoggingConfig) -> Result<RollingFileAppender> {
    let mut builder = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(log_prefix(&cfg.file))
        .max_log_files(cfg.max_files);
    if let Some(ext) = cfg.file.extension() {
        builder = builder.filename_suffix(ext.to_string_lossy());
    }

    builder
        .build(log_dir(&cfg.file))
        .map_err(|e| AppError::Logging(e.to_string()))
}

/// Removes files in `dir` starting with `prefix` that were last modified
/// more than `max_age` ago. Returns the removed paths.
pub fn prune_old_logs(dir: &Path, prefix: &str, max_age: Duration) -> Result<Vec<PathBuf>> {
    let now = SystemTime::now();
    let mut removed = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        if !entry.file_name().to_string_lossy().starts_with(prefix) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let expired = meta
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > max_age);
        if expired && std::fs::remove_file(entry.path()).is_ok() {
            removed.push(entry.path());
        }
    }

    Ok(removed)
}

fn log_dir(file: &Path) -> PathBuf {
    match file.parent().filter(|d| !d.as_os_str().is_empty()) {
        Some(dir) => dir.to_path_buf(),
        None => PathBuf::from("."),
    }
}

fn log_prefix(file: &Path) -> String {
    file.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "pm_mode_mailer".into())
}

pub fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARNING",
        Level::INFO => "INFO",
        Level::DEBUG | Level::TRACE => "DEBUG",
    }
}

/// Forwards events to a bounded channel; records are dropped when it is full.
pub struct DbLogLayer {
    tx: mpsc::Sender<LogRecord>,
}

impl DbLogLayer {
    pub fn new(capacity: usize) -> (Self, DbLogReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl<S: Subscriber> Layer<S> for DbLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if !meta.target().starts_with(FORWARDED_TARGET) {
            return;
        }

        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let _ = self.tx.try_send(LogRecord {
            level: level_name(meta.level()),
            eqp_id: visitor.eqp_id.take(),
            message: visitor.finish(),
        });
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    eqp_id: Option<String>,
    extra: String,
}

impl RecordVisitor {
    fn finish(self) -> String {
        if self.extra.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.extra)
        }
    }
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "eqp_id" => self.eqp_id = Some(value.to_string()),
            name => {
                let _ = write!(self.extra, " {name}={value}");
            }
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            "eqp_id" => self.eqp_id = Some(format!("{value:?}")),
            name => {
                let _ = write!(self.extra, " {name}={value:?}");
            }
        }
    }
}

/// Asks a running [`DbLogWriter`] to write out everything queued so far.
#[derive(Debug, Clone)]
pub struct DbLogFlusher {
    tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl DbLogFlusher {
    /// Returns false when the writer is gone or did not answer in time.
    pub async fn flush(&self) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(ack_tx).await.is_err() {
            return false;
        }
        matches!(tokio::time::timeout(FLUSH_TIMEOUT, ack_rx).await, Ok(Ok(())))
    }
}

/// Drains forwarded records into `ecas_logs`. Records arriving before the
/// first connection are only visible on the console.
pub struct DbLogWriter {
    records: DbLogReceiver,
    flushes: mpsc::Receiver<oneshot::Sender<()>>,
    pools: watch::Receiver<Option<DbPool>>,
    source_script: String,
}

impl DbLogWriter {
    pub fn new(
        records: DbLogReceiver,
        pools: watch::Receiver<Option<DbPool>>,
        source_script: String,
    ) -> (Self, DbLogFlusher) {
        let (tx, flushes) = mpsc::channel(4);
        let writer = Self {
            records,
            flushes,
            pools,
            source_script,
        };
        (writer, DbLogFlusher { tx })
    }

    pub async fn run(mut self) {
        let mut flushers_alive = true;
        loop {
            tokio::select! {
                biased;
                ack = self.flushes.recv(), if flushers_alive => match ack {
                    Some(ack) => {
                        while let Ok(record) = self.records.try_recv() {
                            self.write(record).await;
                        }
                        let _ = ack.send(());
                    }
                    None => flushers_alive = false,
                },
                record = self.records.recv() => match record {
                    Some(record) => self.write(record).await,
                    None => break,
                },
            }
        }
    }

    async fn write(&self, record: LogRecord) {
        let pool = self.pools.borrow().clone();
        let Some(pool) = pool else {
            return;
        };

        let res = sqlx::query(
            r#"
            INSERT INTO ecas_logs (log_level, source_script, eqp_id, message)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(record.level)
        .bind(&self.source_script)
        .bind(&record.eqp_id)
        .bind(&record.message)
        .execute(&pool)
        .await;

        if let Err(e) = res {
            // tracing would route this straight back into the failing sink
            eprintln!("!!! CRITICAL: FAILED TO LOG TO DATABASE: {e} !!!");
            eprintln!("!!! ORIGINAL LOG: [{}] {} !!!", record.level, record.message);
        }
    }
}
