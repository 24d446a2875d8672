use crate::config::NotifierConfig;
use crate::detect::{ChangeEvent, PriorMode};
use crate::error::NotifyError;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::info;

/// Human-readable PM mode.
pub fn format_mode(mode: Option<i64>) -> String {
    match mode {
        Some(1) => "ON".to_string(),
        Some(0) => "OFF".to_string(),
        None => "RELEASED (NULL)".to_string(),
        Some(other) => other.to_string(),
    }
}

pub fn format_prior(prior: PriorMode) -> String {
    match prior {
        PriorMode::Unknown => "Not Available".to_string(),
        PriorMode::Known(mode) => format_mode(mode),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub equipment_id: String,
    pub previous_mode: String,
    pub current_mode: String,
    pub observed_at: String,
}

impl Notification {
    pub fn from_event(event: &ChangeEvent) -> Self {
        let previous_mode = format_prior(event.previous_mode);
        let current_mode = format_mode(event.current_mode);
        let observed_at = event.observed_at.render();
        let id = &event.equipment_id;

        let subject = format!("[ECAS PM Alert] PM mode changed for equipment {id}");
        let body = format!(
            "Hello,\n\
             \n\
             The PM mode of equipment {id} has changed.\n\
             \n\
             - Changed at: {observed_at}\n\
             - Equipment ID: {id}\n\
             - Previous state: {previous_mode}\n\
             - Current state: {current_mode}\n\
             \n\
             Regards,\n\
             ECAS monitoring system\n"
        );

        Self {
            subject,
            body,
            equipment_id: id.clone(),
            previous_mode,
            current_mode,
            observed_at,
        }
    }
}

/// Delivery boundary for change notifications. Failures are reported to the
/// caller, which logs them and moves on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &ChangeEvent) -> Result<(), NotifyError>;
}

/// Writes the rendered mail to the log instead of sending it.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &ChangeEvent) -> Result<(), NotifyError> {
        let n = Notification::from_event(event);
        info!(eqp_id = %n.equipment_id, "--- SENDING EMAIL (SIMULATION) ---");
        info!(eqp_id = %n.equipment_id, "Subject: {}", n.subject);
        info!(eqp_id = %n.equipment_id, "Body: {}", n.body);
        Ok(())
    }
}

/// POSTs the rendered notification as JSON.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &ChangeEvent) -> Result<(), NotifyError> {
        let n = Notification::from_event(event);
        self.client
            .post(&self.url)
            .json(&n)
            .send()
            .await?
            .error_for_status()?;
        info!(eqp_id = %n.equipment_id, url = %self.url, "notification delivered");
        Ok(())
    }
}

pub fn build_notifier(cfg: &NotifierConfig) -> Result<Box<dyn Notifier>, NotifyError> {
    Ok(match cfg {
        NotifierConfig::Log => Box::new(LogNotifier),
        NotifierConfig::Webhook { url, timeout_secs } => Box::new(WebhookNotifier::new(
            url.clone(),
            Duration::from_secs(*timeout_secs),
        )?),
    })
}
