use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mcs_core::{
    backend::MatrixBackend, bridge::BridgeRouter, channel::ChannelPort, config::Config,
    domain::MatrixUserId, mapping::ChatRoomStore, relay::RelayLoop,
};

use crate::handlers;
use crate::TelegramChannel;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub bridge: Arc<BridgeRouter>,
    pub channel: Arc<dyn ChannelPort>,
}

/// Run the bot: spawn the outbound relay, then long-poll Telegram updates
/// until the dispatcher stops. The relay is cancelled when dispatch returns.
pub async fn run_polling(
    cfg: Arc<Config>,
    bridge: Arc<BridgeRouter>,
    backend: Arc<dyn MatrixBackend>,
    store: Arc<Mutex<ChatRoomStore>>,
    bot_user: MatrixUserId,
) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    match bot.get_me().await {
        Ok(me) => info!(bot = me.username(), "telegram bot connected"),
        Err(e) => warn!("get_me failed, continuing anyway: {e}"),
    }

    let channel: Arc<dyn ChannelPort> = Arc::new(TelegramChannel::new(bot.clone()));

    let relay = RelayLoop::new(&cfg, backend, channel.clone(), store, bot_user);
    let cancel = CancellationToken::new();
    let relay_task = tokio::spawn(relay.run(cancel.clone()));

    let state = Arc::new(AppState {
        cfg,
        bridge,
        channel,
    });

    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    cancel.cancel();
    let _ = relay_task.await;

    Ok(())
}
