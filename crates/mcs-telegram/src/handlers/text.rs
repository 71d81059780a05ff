use std::sync::Arc;

use teloxide::prelude::*;
use tracing::warn;

use crate::handlers::contact_from;
use crate::router::AppState;

pub async fn handle_text(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text().map(|s| s.to_string()) else {
        return Ok(());
    };
    if text.trim().is_empty() {
        return Ok(());
    }

    let contact = contact_from(msg.chat.id.0, user);

    match state.bridge.relay_inbound(&contact, &text).await {
        Ok(true) => {}
        Ok(false) => {
            // No conversation yet: prompt for a department instead of
            // dropping the message silently.
            let _ = state
                .channel
                .send_keyboard(
                    contact.chat_id,
                    "Please choose a department first:",
                    state.bridge.department_keyboard(),
                )
                .await;
        }
        Err(e) => {
            warn!(chat = contact.chat_id.0, "relay failed: {e}");
            let _ = bot
                .send_message(
                    msg.chat.id,
                    "Sorry, your message could not be delivered. Please try again.",
                )
                .await;
        }
    }

    Ok(())
}
