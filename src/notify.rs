// =============================================================================
// Notifier — fire-and-forget operator messages
// =============================================================================
//
// Producers call `Notifier::send`, which never blocks: messages go into a
// bounded queue and are dropped (with a warning) when the queue is full. One
// worker task drains the queue and posts to Telegram's `sendMessage`. Without
// bot credentials the worker only logs.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::stream::StreamAlert;

/// Telegram's per-message character limit.
pub const MAX_MESSAGE_CHARS: usize = 4096;
const QUEUE_CAPACITY: usize = 256;
const TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Clone)]
pub struct TelegramTarget {
    pub token: String,
    pub chat_id: String,
}

impl std::fmt::Debug for TelegramTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramTarget")
            .field("token", &"[REDACTED]")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct Notifier {
    tx: mpsc::Sender<String>,
}

impl Notifier {
    /// Start the delivery worker.
    pub fn start(
        target: Option<TelegramTarget>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>)> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build notifier HTTP client")?;
        let (notifier, rx) = Self::channel(QUEUE_CAPACITY);
        if target.is_none() {
            info!("Telegram credentials not set, notifications will only be logged");
        }
        let handle = tokio::spawn(delivery_loop(rx, target, http, cancel));
        Ok((notifier, handle))
    }

    /// A notifier whose queue is read by the caller.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn send(&self, text: impl Into<String>) {
        let text = text.into();
        match self.tx.try_send(text) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(chars = dropped.len(), "notification queue full, message dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("notifier stopped, message discarded");
            }
        }
    }

    /// Relay transport escalations until the alert channel closes. `on_alert`
    /// sees each alert before it is queued for delivery.
    pub fn forward_alerts<F>(
        &self,
        mut alerts: mpsc::UnboundedReceiver<StreamAlert>,
        cancel: CancellationToken,
        on_alert: F,
    ) -> JoinHandle<()>
    where
        F: Fn(&StreamAlert) + Send + 'static,
    {
        let notifier = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    alert = alerts.recv() => match alert {
                        Some(alert) => {
                            warn!(alert = ?alert, "transport escalation");
                            on_alert(&alert);
                            notifier.send(format!("⚠️ {}", alert.describe()));
                        }
                        None => break,
                    },
                }
            }
        })
    }
}

async fn delivery_loop(
    mut rx: mpsc::Receiver<String>,
    target: Option<TelegramTarget>,
    http: reqwest::Client,
    cancel: CancellationToken,
) {
    loop {
        let text = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(t) => t,
                None => break,
            },
        };

        let Some(target) = &target else {
            info!(message = %text, "notification");
            continue;
        };

        for part in split_message(&text, MAX_MESSAGE_CHARS) {
            if let Err(e) = post_message(&http, target, &part).await {
                warn!(error = %format!("{e:#}"), "notification delivery failed");
            }
        }
    }
    debug!("notifier stopped");
}

async fn post_message(http: &reqwest::Client, target: &TelegramTarget, text: &str) -> Result<()> {
    let url = format!("{TELEGRAM_API}/bot{}/sendMessage", target.token);
    let resp = http
        .post(url)
        .json(&json!({
            "chat_id": target.chat_id,
            "text": text,
            "disable_web_page_preview": true,
        }))
        .send()
        .await
        .context("sendMessage request failed")?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("sendMessage returned {status}: {body}");
    }
    Ok(())
}

/// Split `text` into chunks of at most `limit` characters, breaking on line
/// boundaries where possible. A single over-long line is hard-split.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > limit && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > limit {
            let chars: Vec<char> = line.chars().collect();
            for chunk in chars.chunks(limit) {
                parts.push(chunk.iter().collect());
            }
            continue;
        }
        current.push_str(line);
        current_len += line_len;
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
