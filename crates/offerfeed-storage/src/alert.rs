use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use tracing::{error, info, warn};

const SUBJECT_PREFIX: &str = "[FEED ALERT]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub topic: String,
    pub body: String,
}

impl Alert {
    pub fn warning(topic: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            severity: AlertSeverity::Warning,
            topic: topic.into(),
            body: body.into(),
        }
    }

    pub fn error(topic: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            severity: AlertSeverity::Error,
            topic: topic.into(),
            body: body.into(),
        }
    }

    pub fn subject(&self) -> String {
        format!("{SUBJECT_PREFIX} {}", self.topic)
    }
}

/// Operator notification channel. Delivery failures are logged, never propagated.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn send(&self, alert: &Alert);
}

#[derive(Debug, Default)]
pub struct LogOnlyAlerter;

#[async_trait]
impl Alerter for LogOnlyAlerter {
    async fn send(&self, alert: &Alert) {
        match alert.severity {
            AlertSeverity::Warning => warn!(subject = %alert.subject(), "{}", alert.body),
            AlertSeverity::Error => error!(subject = %alert.subject(), "{}", alert.body),
        }
    }
}

/// Keeps every alert in memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryAlerter {
    sent: Mutex<Vec<Alert>>,
}

impl MemoryAlerter {
    pub fn alerts(&self) -> Vec<Alert> {
        self.sent
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Alerter for MemoryAlerter {
    async fn send(&self, alert: &Alert) {
        if let Ok(mut guard) = self.sent.lock() {
            guard.push(alert.clone());
        }
    }
}

pub struct SmtpAlerter {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl SmtpAlerter {
    pub fn new(config: &SmtpSettings) -> anyhow::Result<Self> {
        let from: Mailbox = config
            .user
            .parse()
            .with_context(|| format!("parsing sender address {}", config.user))?;
        let to: Mailbox = config
            .recipient
            .parse()
            .with_context(|| format!("parsing recipient address {}", config.recipient))?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .with_context(|| format!("configuring smtp relay {}", config.host))?
            .port(config.port)
            .credentials(Credentials::new(
                config.user.clone(),
                config.password.clone(),
            ))
            .build();
        Ok(Self { transport, from, to })
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(alert.subject())
            .header(ContentType::TEXT_PLAIN)
            .body(alert.body.clone())
            .context("building alert email")?;
        self.transport
            .send(message)
            .await
            .context("sending alert email")?;
        Ok(())
    }
}

#[async_trait]
impl Alerter for SmtpAlerter {
    async fn send(&self, alert: &Alert) {
        match self.deliver(alert).await {
            Ok(()) => info!(subject = %alert.subject(), "alert email sent"),
            Err(err) => error!(subject = %alert.subject(), error = %format!("{err:#}"), "alert email failed"),
        }
    }
}

/// Posts `{"text": ...}` to a chat-style incoming webhook.
pub struct WebhookAlerter {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlerter {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    async fn send(&self, alert: &Alert) {
        let payload = serde_json::json!({
            "text": format!("{}\n{}", alert.subject(), alert.body),
            "severity": alert.severity,
            "topic": alert.topic,
        });
        let result = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        if let Err(err) = result {
            error!(subject = %alert.subject(), error = %err, "alert webhook failed");
        }
    }
}

/// Logs every alert, then forwards it to each configured channel.
pub struct FanoutAlerter {
    channels: Vec<Arc<dyn Alerter>>,
}

impl FanoutAlerter {
    pub fn new(channels: Vec<Arc<dyn Alerter>>) -> Self {
        Self { channels }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait]
impl Alerter for FanoutAlerter {
    async fn send(&self, alert: &Alert) {
        LogOnlyAlerter.send(alert).await;
        for channel in &self.channels {
            channel.send(alert).await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub recipient: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertConfig {
    pub smtp: Option<SmtpSettings>,
    pub webhook_url: Option<String>,
}

impl AlertConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Email needs both user and password; anything less leaves email disabled.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let smtp = match (get("EMAIL_USER"), get("EMAIL_PASSWORD")) {
            (Some(user), Some(password)) => Some(SmtpSettings {
                host: get("EMAIL_HOST").unwrap_or_else(|| "smtp.gmail.com".to_string()),
                port: get("EMAIL_PORT")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(587),
                recipient: get("EMAIL_RECIPIENT").unwrap_or_else(|| user.clone()),
                user,
                password,
            }),
            _ => None,
        };

        Self {
            smtp,
            webhook_url: get("ALERT_WEBHOOK_URL"),
        }
    }
}

pub fn build_alerter(config: &AlertConfig) -> Arc<dyn Alerter> {
    let mut channels: Vec<Arc<dyn Alerter>> = Vec::new();

    match &config.smtp {
        Some(settings) => match SmtpAlerter::new(settings) {
            Ok(alerter) => channels.push(Arc::new(alerter)),
            Err(err) => warn!(error = %format!("{err:#}"), "email alerting disabled"),
        },
        None => warn!("email credentials not configured; alerts will only be logged"),
    }

    if let Some(url) = &config.webhook_url {
        channels.push(Arc::new(WebhookAlerter::new(url.clone())));
    }

    Arc::new(FanoutAlerter::new(channels))
}
