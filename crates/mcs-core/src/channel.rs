//! Port for the external channel (Telegram today).

use async_trait::async_trait;

use crate::{config::Department, domain::TgChatId, Result};

/// Inline keyboard used for the department picker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Keyboard {
    pub buttons: Vec<KeyboardButton>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyboardButton {
    pub label: String,
    pub data: String,
}

/// Callback payload prefix for department selection buttons.
pub const DEPT_CALLBACK_PREFIX: &str = "dept_";

impl Keyboard {
    /// One button per department, labelled `icon name`, with `dept_{id}`
    /// callback payloads.
    pub fn departments(departments: &[Department]) -> Self {
        let buttons = departments
            .iter()
            .map(|d| {
                let label = match &d.icon {
                    Some(icon) => format!("{icon} {}", d.name),
                    None => d.name.clone(),
                };
                KeyboardButton {
                    label,
                    data: format!("{DEPT_CALLBACK_PREFIX}{}", d.id),
                }
            })
            .collect();
        Self { buttons }
    }
}

/// Outbound side of the external channel.
#[async_trait]
pub trait ChannelPort: Send + Sync {
    async fn send_text(&self, chat: TgChatId, text: &str) -> Result<()>;
    async fn send_keyboard(&self, chat: TgChatId, text: &str, keyboard: Keyboard) -> Result<()>;
}
