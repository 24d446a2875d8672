use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DbConfig,
    #[serde(default)]
    pub mailer: MailerConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Table holding the raw equipment events (`eqp_id`, `tm`, `pm_mode`).
    #[serde(default = "default_raw_table")]
    pub raw_table: String,
    /// Orders rows sharing a `tm`; `null` when the table has no such column.
    #[serde(default = "default_tie_break_column")]
    pub tie_break_column: Option<String>,
}

fn default_max_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_raw_table() -> String {
    "atlas_ecas_raw".into()
}

fn default_tie_break_column() -> Option<String> {
    Some("id".into())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,
    #[serde(default = "default_error_cooldown_secs")]
    pub error_cooldown_secs: u64,
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
    /// Reported as `source_script` in database log rows.
    #[serde(default = "default_source_script")]
    pub source_script: String,
}

fn default_poll_interval_secs() -> u64 {
    120
}

fn default_reconnect_backoff_secs() -> u64 {
    10
}

fn default_error_cooldown_secs() -> u64 {
    60
}

fn default_status_file() -> PathBuf {
    PathBuf::from("data/equipment_status.json")
}

fn default_source_script() -> String {
    "pm-mode-mailer".into()
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
            error_cooldown_secs: default_error_cooldown_secs(),
            status_file: default_status_file(),
            source_script: default_source_script(),
        }
    }
}

impl MailerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.error_cooldown_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NotifierConfig {
    #[default]
    Log,
    Webhook {
        url: String,
        #[serde(default = "default_webhook_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSink {
    #[default]
    Console,
    File,
    Database,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub sink: LogSink,
    /// Default filter directive when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Base name for the `file` sink; the active file carries a date suffix.
    #[serde(default = "default_log_file")]
    pub file: PathBuf,
    /// Rotated files kept by the appender.
    #[serde(default = "default_log_max_files")]
    pub max_files: usize,
    /// Log files older than this are deleted at startup; 0 keeps everything.
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u64,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_file() -> PathBuf {
    PathBuf::from("logs/pm_mode_mailer.log")
}

fn default_log_max_files() -> usize {
    30
}

fn default_log_retention_days() -> u64 {
    7
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            sink: LogSink::default(),
            level: default_log_level(),
            file: default_log_file(),
            max_files: default_log_max_files(),
            retention_days: default_log_retention_days(),
        }
    }
}

impl LoggingConfig {
    pub fn retention(&self) -> Option<Duration> {
        (self.retention_days > 0).then(|| Duration::from_secs(self.retention_days * 24 * 60 * 60))
    }
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// Afterwards DATABASE_URL and STATUS_FILE_PATH, when set, override the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut cfg = Self::from_yaml(&raw)?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            cfg.database.url = url;
        }
        if let Ok(status_file) = std::env::var("STATUS_FILE_PATH") {
            cfg.mailer.status_file = PathBuf::from(status_file);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let expanded = expand_env_placeholders(raw)?;
        Ok(serde_yaml::from_str(&expanded)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            return Err(AppError::Config("database url cannot be empty".into()));
        }
        if !is_plain_identifier(&self.database.raw_table) {
            return Err(AppError::Config(format!(
                "raw_table '{}' must be a plain identifier",
                self.database.raw_table
            )));
        }
        if let Some(column) = &self.database.tie_break_column {
            if !is_plain_identifier(column) {
                return Err(AppError::Config(format!(
                    "tie_break_column '{column}' must be a plain identifier"
                )));
            }
        }
        if self.database.max_connections == 0 {
            return Err(AppError::Config(
                "max_connections must be greater than zero".into(),
            ));
        }

        let m = &self.mailer;
        for (name, value) in [
            ("poll_interval_secs", m.poll_interval_secs),
            ("reconnect_backoff_secs", m.reconnect_backoff_secs),
            ("error_cooldown_secs", m.error_cooldown_secs),
        ] {
            if value == 0 {
                return Err(AppError::Config(format!("{name} must be greater than zero")));
            }
        }
        if m.status_file.as_os_str().is_empty() {
            return Err(AppError::Config("status_file cannot be empty".into()));
        }

        if self.logging.sink == LogSink::File {
            if self.logging.file.file_name().is_none() {
                return Err(AppError::Config("logging file must name a file".into()));
            }
            if self.logging.max_files == 0 {
                return Err(AppError::Config("logging max_files must be greater than zero".into()));
            }
        }

        if let NotifierConfig::Webhook { url, .. } = &self.notifier {
            if url.trim().is_empty() {
                return Err(AppError::Config("webhook url cannot be empty".into()));
            }
        }

        Ok(())
    }
}

fn is_plain_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$$" becomes a literal "$".
fn expand_env_placeholders(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let close = match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                continue;
            }
        };
        it.next();
        let var = read_until(&mut it, close).ok_or_else(|| {
            AppError::Config(format!("unterminated env placeholder: missing '{close}'"))
        })?;
        let val = std::env::var(&var)
            .map_err(|_| AppError::Config(format!("missing environment variable: {var}")))?;
        out.push_str(&val);
    }

    Ok(out)
}

/// Consumes the closing delimiter.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}
