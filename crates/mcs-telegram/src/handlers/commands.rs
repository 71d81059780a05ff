use std::sync::Arc;

use teloxide::prelude::*;

use mcs_core::domain::DepartmentId;

use crate::handlers::contact_from;
use crate::router::AppState;

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

pub async fn handle_command(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let contact = contact_from(msg.chat.id.0, user);
    let (cmd, arg) = parse_command(text);

    match cmd.as_str() {
        // `/start` with a deep-link payload jumps straight into a
        // department; without one it shows the picker.
        "start" => {
            if !arg.is_empty() {
                let dept = DepartmentId(arg.to_lowercase());
                if state.bridge.department(&dept).is_some() {
                    return super::callback::select(bot, state, contact, dept).await;
                }
            }
            let greeting = format!(
                "Hello {}! Which department would you like to talk to?",
                contact.display_name
            );
            let _ = state
                .channel
                .send_keyboard(contact.chat_id, &greeting, state.bridge.department_keyboard())
                .await;
        }
        "help" => {
            let mut lines = vec![
                "/start - choose a department".to_string(),
                "/help - this message".to_string(),
            ];
            for dept in &state.cfg.departments {
                if let Some(command) = &dept.telegram_command {
                    lines.push(format!("/{command} - contact {}", dept.name));
                }
            }
            let _ = bot.send_message(msg.chat.id, lines.join("\n")).await;
        }
        _ => {
            // Per-department shortcut commands from configuration.
            if let Some(dept) = state.bridge.department_for_command(&cmd) {
                let dept_id = dept.id.clone();
                return super::callback::select(bot, state, contact, dept_id).await;
            }
            let _ = bot
                .send_message(msg.chat.id, "Unknown command. Try /start.")
                .await;
        }
    }

    Ok(())
}
