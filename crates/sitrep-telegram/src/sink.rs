use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::Recipient;

use sitrep_sender::{OutboundSink, SinkError};

use crate::send::{parse_target, send_text};

/// Output sink publishing to the configured summary channel.
pub struct TelegramSink {
    bot: Bot,
    target: Recipient,
}

impl TelegramSink {
    pub fn new(bot: Bot, target_spec: &str) -> Self {
        Self {
            bot,
            target: parse_target(target_spec),
        }
    }
}

#[async_trait]
impl OutboundSink for TelegramSink {
    async fn deliver(&self, text: &str) -> Result<(), SinkError> {
        send_text(&self.bot, self.target.clone(), text)
            .await
            .map_err(|e| SinkError(e.to_string()))
    }
}
