//! Telegram Bot API delivery for expiry notices

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use resell_ledger::{ExpiryNotice, Notifier, NotifyError};
use serde::Serialize;
use time::macros::format_description;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Placeholders: `{username}`, `{days_left}`, `{expires_at}`
pub const DEFAULT_EXPIRY_TEMPLATE: &str =
    "⏳ Подписка {username} истекает через {days_left} дн. ({expires_at}). Продлите её заранее.";

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
}

/// Sends expiry notices to agents through `sendMessage`.
pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    bot_token: String,
    template: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            api_base: TELEGRAM_API_BASE.to_string(),
            bot_token: bot_token.into(),
            template: DEFAULT_EXPIRY_TEMPLATE.to_string(),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        // Templates from .env files carry literal "\n"
        self.template = template.into().replace("\\n", "\n");
        self
    }

    pub fn render(&self, notice: &ExpiryNotice) -> String {
        let expires_at = notice
            .expires_at
            .format(format_description!("[day].[month].[year]"))
            .unwrap_or_else(|_| notice.expires_at.date().to_string());
        self.template
            .replace("{username}", &notice.username)
            .replace("{days_left}", &notice.days_left.to_string())
            .replace("{expires_at}", &expires_at)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, notice: &ExpiryNotice) -> Result<(), NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let text = self.render(notice);
        let payload = SendMessage {
            chat_id: notice.agent_telegram_id,
            text: &text,
        };

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.without_url().to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error body".to_string());
        if status.is_client_error() {
            // Blocked bot, unknown chat and the like; retrying will not help this sweep
            Err(NotifyError::Rejected(format!("{status}: {body}")))
        } else {
            Err(NotifyError::Transport(format!("{status}: {body}")))
        }
    }
}
