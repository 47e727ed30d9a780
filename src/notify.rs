//! Notification sink. Delivery is fire-and-forget: failures are logged and
//! never reach the caller.

use crate::models::automation::{Alert, Priority};
use log::{info, warn};
use std::time::Duration;

pub trait Notifier: Send + Sync {
    fn send(&self, title: &str, body: &str, priority: Priority);

    fn send_alert(&self, alert: &Alert) {
        self.send(&alert.title, &alert.body, alert.priority);
    }
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, title: &str, body: &str, priority: Priority) {
        let body = body.replace('\n', " / ");
        match priority {
            Priority::High => warn!("[notify:{}] {}: {}", priority.as_str(), title, body),
            _ => info!("[notify:{}] {}: {}", priority.as_str(), title, body),
        }
    }
}

/// ntfy-style push: plain-text body, title and priority as headers.
pub struct WebhookNotifier {
    agent: ureq::Agent,
    url: String,
}

fn ntfy_priority(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low",
        Priority::Normal => "default",
        Priority::High => "high",
    }
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        WebhookNotifier {
            agent: ureq::Agent::new_with_config(config),
            url: url.into(),
        }
    }
}

impl Notifier for WebhookNotifier {
    fn send(&self, title: &str, body: &str, priority: Priority) {
        LogNotifier.send(title, body, priority);
        let result = self
            .agent
            .post(&self.url)
            .header("Title", title)
            .header("Priority", ntfy_priority(priority))
            .send(body);
        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!("Notification \"{}\" rejected: http {}", title, resp.status().as_u16()),
            Err(e) => warn!("Notification \"{}\" not delivered: {}", title, e),
        }
    }
}
