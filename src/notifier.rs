// SPDX-License-Identifier: MIT

//! Notifier client for the operator Telegram channel
//!
//! Best-effort by contract: the orchestrator records `notified = false` on
//! any failure and the cycle continues unaffected.

use async_trait::async_trait;
use reqwest::multipart;
use std::time::Duration;
use tracing::debug;

use crate::config::NotifierConfig;
use crate::{BugwatchError, Result};

/// Capability interface the orchestrator depends on
#[async_trait]
pub trait Notify: Send + Sync {
    /// Send a message, with an optional photo attached. Ok(()) means the
    /// backend acknowledged delivery; any error is treated as not-notified.
    async fn notify(&self, text: &str, photo: Option<&[u8]>) -> Result<()>;
}

/// Telegram bot API client
pub struct TelegramNotifier {
    client: reqwest::Client,
    base_url: String,
    chat_id: String,
}

impl TelegramNotifier {
    /// Create a notifier from configuration; None when Telegram is not
    /// configured, in which case the notify stage is skipped entirely.
    pub fn from_config(config: &NotifierConfig) -> Result<Option<Self>> {
        if config.bot_token.is_empty() || config.chat_id.is_empty() {
            return Ok(None);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Some(Self {
            client,
            base_url: format!("https://api.telegram.org/bot{}", config.bot_token),
            chat_id: config.chat_id.clone(),
        }))
    }
}

#[async_trait]
impl Notify for TelegramNotifier {
    async fn notify(&self, text: &str, photo: Option<&[u8]>) -> Result<()> {
        let response = match photo {
            Some(bytes) => {
                debug!("Sending photo ({} bytes) to Telegram", bytes.len());
                let form = multipart::Form::new()
                    .text("chat_id", self.chat_id.clone())
                    .text("caption", text.to_string())
                    .part(
                        "photo",
                        multipart::Part::bytes(bytes.to_vec()).file_name("deteccion.jpg"),
                    );
                self.client
                    .post(format!("{}/sendPhoto", self.base_url))
                    .multipart(form)
                    .send()
                    .await?
            }
            None => {
                debug!("Sending text message to Telegram");
                self.client
                    .post(format!("{}/sendMessage", self.base_url))
                    .form(&[("chat_id", self.chat_id.as_str()), ("text", text)])
                    .send()
                    .await?
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BugwatchError::Notifier(format!(
                "Telegram returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_notifier_is_none() {
        let config = NotifierConfig::default();
        assert!(TelegramNotifier::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn configured_notifier_builds_base_url() {
        let config = NotifierConfig {
            bot_token: "123:abc".to_string(),
            chat_id: "42".to_string(),
            timeout_secs: 20,
        };
        let notifier = TelegramNotifier::from_config(&config).unwrap().unwrap();
        assert_eq!(notifier.base_url, "https://api.telegram.org/bot123:abc");
        assert_eq!(notifier.chat_id, "42");
    }
}
