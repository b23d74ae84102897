//! Severity-tagged operator alerts
//!
//! Alerts are logged, counted, kept in a bounded in-memory history and handed
//! to every registered callback. An optional webhook receives alerts at or
//! above a minimum severity.

use crate::config::AlertsConfig;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HISTORY_CAPACITY: usize = 500;

/// Alert severity, ordered from least to most urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Critical => "CRITICAL",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "INFO" => Some(AlertSeverity::Info),
            "WARNING" => Some(AlertSeverity::Warning),
            "CRITICAL" => Some(AlertSeverity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub chain_id: Option<u64>,
    pub intent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: AlertSeverity, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            severity,
            title: title.into(),
            message: message.into(),
            chain_id: None,
            intent_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_chain(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    pub fn with_intent(mut self, intent_id: impl Into<String>) -> Self {
        self.intent_id = Some(intent_id.into());
        self
    }
}

pub type AlertCallback = Arc<dyn Fn(&Alert) + Send + Sync>;

struct WebhookSink {
    url: String,
    min_severity: AlertSeverity,
    client: reqwest::Client,
}

/// Fans alerts out to subscribers
pub struct AlertManager {
    callbacks: RwLock<Vec<AlertCallback>>,
    history: Mutex<VecDeque<Alert>>,
    webhook: Option<WebhookSink>,
}

impl AlertManager {
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            webhook: None,
        }
    }

    pub fn from_config(config: &AlertsConfig) -> Self {
        let mut manager = Self::new();
        if let Some(url) = config.webhook_url.as_ref().filter(|u| !u.trim().is_empty()) {
            let min_severity = config
                .webhook_min_severity
                .as_deref()
                .and_then(AlertSeverity::parse)
                .unwrap_or(AlertSeverity::Warning);
            info!("Alert webhook enabled at {} for {}+", url, min_severity);
            manager.webhook = Some(WebhookSink {
                url: url.clone(),
                min_severity,
                client: reqwest::Client::new(),
            });
        }
        manager
    }

    /// Register a callback invoked for every alert
    pub fn on_alert<F>(&self, callback: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(callback));
    }

    /// Raise an alert
    pub fn emit(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Info => info!(
                chain_id = ?alert.chain_id,
                intent_id = ?alert.intent_id,
                "[ALERT] {}: {}",
                alert.title,
                alert.message
            ),
            AlertSeverity::Warning => warn!(
                chain_id = ?alert.chain_id,
                intent_id = ?alert.intent_id,
                "[ALERT] {}: {}",
                alert.title,
                alert.message
            ),
            AlertSeverity::Critical => error!(
                chain_id = ?alert.chain_id,
                intent_id = ?alert.intent_id,
                "[ALERT] {}: {}",
                alert.title,
                alert.message
            ),
        }
        crate::metrics::record_alert(alert.severity.as_str());

        {
            let mut history = self
                .history
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(alert.clone());
        }

        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for callback in callbacks {
            callback(&alert);
        }

        self.forward_to_webhook(&alert);
    }

    pub fn info(&self, title: impl Into<String>, message: impl Into<String>) -> Alert {
        Alert::new(AlertSeverity::Info, title, message)
    }

    pub fn warning(&self, title: impl Into<String>, message: impl Into<String>) -> Alert {
        Alert::new(AlertSeverity::Warning, title, message)
    }

    pub fn critical(&self, title: impl Into<String>, message: impl Into<String>) -> Alert {
        Alert::new(AlertSeverity::Critical, title, message)
    }

    /// Most recent alerts, oldest first
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        let history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    fn forward_to_webhook(&self, alert: &Alert) {
        let Some(sink) = &self.webhook else {
            return;
        };
        if alert.severity < sink.min_severity {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available, skipping alert webhook");
            return;
        };

        let request = sink.client.post(&sink.url).json(alert);
        let alert_id = alert.id.clone();
        handle.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => warn!(
                    "Alert webhook returned {} for alert {}",
                    response.status(),
                    alert_id
                ),
                Err(e) => warn!("Alert webhook delivery failed for {}: {}", alert_id, e),
            }
        });
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new()
    }
}
