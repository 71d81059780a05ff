use std::sync::Arc;

use teloxide::{prelude::*, types::CallbackQuery};
use tracing::warn;

use mcs_core::{
    bridge::ExternalContact,
    channel::DEPT_CALLBACK_PREFIX,
    domain::DepartmentId,
};

use crate::handlers::contact_from;
use crate::router::AppState;

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let cb_id = q.id.clone();
    let data = q.data.clone().unwrap_or_default();
    let Some(chat_id) = q.message.as_ref().map(|m| m.chat.id.0) else {
        let _ = bot.answer_callback_query(cb_id).await;
        return Ok(());
    };

    let Some(dept_id) = data.strip_prefix(DEPT_CALLBACK_PREFIX) else {
        let _ = bot.answer_callback_query(cb_id).await;
        return Ok(());
    };
    let dept_id = DepartmentId(dept_id.to_string());
    let contact = contact_from(chat_id, &q.from);

    let _ = bot.answer_callback_query(cb_id).await;
    select(bot, state, contact, dept_id).await
}

/// Shared selection path for buttons, `/start` deep links and department
/// shortcut commands.
pub(crate) async fn select(
    bot: Bot,
    state: Arc<AppState>,
    contact: ExternalContact,
    dept_id: DepartmentId,
) -> ResponseResult<()> {
    let name = state
        .bridge
        .department(&dept_id)
        .map(|d| d.name.clone())
        .unwrap_or_else(|| dept_id.0.clone());
    let chat = teloxide::types::ChatId(contact.chat_id.0);

    match state.bridge.select_department(&contact, &dept_id).await {
        Ok(out) if out.reused => {
            let _ = bot
                .send_message(
                    chat,
                    format!("Reconnected to your {name} conversation. An agent will see your messages."),
                )
                .await;
        }
        Ok(_) => {
            let _ = bot
                .send_message(
                    chat,
                    format!("Connected to {name}. Send your message and an agent will reply here."),
                )
                .await;
        }
        Err(e) => {
            warn!(chat = contact.chat_id.0, department = %dept_id, "selection failed: {e}");
            let _ = bot
                .send_message(
                    chat,
                    "Sorry, we could not connect you right now. Please try again in a moment.",
                )
                .await;
        }
    }

    Ok(())
}
