//! Telegram adapter (teloxide).
//!
//! This crate implements the `mcs-core` ChannelPort over the Telegram Bot
//! API and hosts the update router that drives department selection.

use async_trait::async_trait;

use teloxide::{
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup},
};

use tokio::time::sleep;

pub mod handlers;
pub mod router;

use mcs_core::{
    channel::{ChannelPort, Keyboard},
    domain::TgChatId,
    errors::Error,
    Result,
};

#[derive(Clone)]
pub struct TelegramChannel {
    bot: Bot,
}

impl TelegramChannel {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(chat: TgChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat.0)
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::External(format!("telegram error: {e}"))
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }
}

#[async_trait]
impl ChannelPort for TelegramChannel {
    async fn send_text(&self, chat: TgChatId, text: &str) -> Result<()> {
        self.with_retry(|| self.bot.send_message(Self::tg_chat(chat), text.to_string()))
            .await?;
        Ok(())
    }

    async fn send_keyboard(&self, chat: TgChatId, text: &str, keyboard: Keyboard) -> Result<()> {
        let rows: Vec<Vec<InlineKeyboardButton>> = keyboard
            .buttons
            .into_iter()
            .map(|b| vec![InlineKeyboardButton::callback(b.label, b.data)])
            .collect();
        let markup = InlineKeyboardMarkup::new(rows);

        self.with_retry(|| {
            self.bot
                .send_message(Self::tg_chat(chat), text.to_string())
                .reply_markup(markup.clone())
        })
        .await?;
        Ok(())
    }
}
