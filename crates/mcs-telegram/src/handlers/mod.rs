//! Telegram update handlers.
//!
//! Each handler extracts the contact from the update, then delegates to the
//! bridge router: commands and callbacks drive department selection, plain
//! text relays into the mapped room.

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{CallbackQuery, Message, User},
};

use mcs_core::{
    bridge::ExternalContact,
    domain::{TgChatId, TgUserId},
};

use crate::router::AppState;

mod callback;
mod commands;
mod text;

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    callback::handle_callback(bot, q, state).await
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            return commands::handle_command(bot, msg, state).await;
        }
    }

    if msg.text().is_some() {
        return text::handle_text(bot, msg, state).await;
    }

    // Media is out of scope for the bridge; tell the user instead of
    // silently dropping it.
    let _ = bot
        .send_message(msg.chat.id, "Only text messages are supported.")
        .await;

    Ok(())
}

pub(crate) fn contact_from(chat_id: i64, user: &User) -> ExternalContact {
    let mut display_name = user.first_name.clone();
    if let Some(last) = &user.last_name {
        display_name.push(' ');
        display_name.push_str(last);
    }
    ExternalContact {
        chat_id: TgChatId(chat_id),
        user_id: TgUserId(user.id.0 as i64),
        display_name,
        username: user.username.clone(),
    }
}
