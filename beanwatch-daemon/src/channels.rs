//! Concrete notification channels.
//!
//! Thin HTTP adapters behind the core `NotifyChannel` capability. They
//! share one status-code policy: 429 and 5xx are retriable, other 4xx are
//! permanent, transport errors are retriable.

use async_trait::async_trait;
use beanwatch_core::dispatch::{ChannelError, NotifyChannel};
use beanwatch_core::stream::EventKind;
use compact_str::CompactString;
use std::collections::HashSet;
use url::Url;

fn status_error(status: reqwest::StatusCode, body: &str) -> ChannelError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ChannelError::Retriable(format!("HTTP {status}: {body}"))
    } else {
        ChannelError::Permanent(format!("HTTP {status}: {body}"))
    }
}

async fn check_response(response: reqwest::Response) -> Result<(), ChannelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

/// Posts events to a Discord channel through an incoming webhook.
pub struct DiscordWebhookChannel {
    id: CompactString,
    webhook_url: Url,
    accepts: HashSet<EventKind>,
    http: reqwest::Client,
}

impl DiscordWebhookChannel {
    pub fn new(
        id: CompactString,
        webhook_url: Url,
        accepts: HashSet<EventKind>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            id,
            webhook_url,
            accepts,
            http,
        }
    }
}

#[async_trait]
impl NotifyChannel for DiscordWebhookChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn accepts(&self, kind: EventKind) -> bool {
        self.accepts.contains(&kind)
    }

    async fn send(&self, text: &str) -> Result<(), ChannelError> {
        let response = self
            .http
            .post(self.webhook_url.clone())
            .json(&serde_json::json!({ "content": text }))
            .send()
            .await
            .map_err(|e| ChannelError::Retriable(e.to_string()))?;
        check_response(response).await
    }
}

/// Posts events to a Telegram chat through the bot API.
pub struct TelegramChannel {
    id: CompactString,
    chat_id: String,
    send_url: String,
    accepts: HashSet<EventKind>,
    http: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(
        id: CompactString,
        bot_token: &str,
        chat_id: String,
        accepts: HashSet<EventKind>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            id,
            chat_id,
            send_url: format!("https://api.telegram.org/bot{bot_token}/sendMessage"),
            accepts,
            http,
        }
    }
}

#[async_trait]
impl NotifyChannel for TelegramChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn accepts(&self, kind: EventKind) -> bool {
        self.accepts.contains(&kind)
    }

    async fn send(&self, text: &str) -> Result<(), ChannelError> {
        let response = self
            .http
            .post(&self.send_url)
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": text,
            }))
            .send()
            .await
            .map_err(|e| ChannelError::Retriable(e.to_string()))?;
        check_response(response).await
    }
}
