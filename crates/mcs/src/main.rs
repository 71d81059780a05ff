use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use mcs_core::{
    backend::MatrixBackend,
    bridge::BridgeRouter,
    config::Config,
    mapping::ChatRoomStore,
    spaces::SpaceManager,
};
use mcs_matrix::MatrixHttp;

#[tokio::main]
async fn main() -> Result<(), mcs_core::Error> {
    mcs_core::logging::init("mcs")?;

    let cfg = Arc::new(Config::load()?);

    let backend: Arc<dyn MatrixBackend> =
        Arc::new(MatrixHttp::new(&cfg.homeserver_url, &cfg.access_token)?);

    // Fail fast on a bad homeserver URL or token.
    let bot_user = backend.whoami().await?;
    info!(user = %bot_user, homeserver = %cfg.homeserver_url, "authenticated");

    let store = ChatRoomStore::load(&cfg.mapping_file);
    let spaces = Arc::new(SpaceManager::new(backend.clone(), cfg.spaces.clone()));
    // Reuse the spaces discovered before the last restart.
    spaces.seed(store.space_ids()).await;
    let asserted = spaces.repair_hierarchy().await;
    info!(edges = asserted, "space hierarchy checked");

    let store = Arc::new(Mutex::new(store));
    let bridge = Arc::new(BridgeRouter::new(
        cfg.clone(),
        backend.clone(),
        spaces,
        store.clone(),
        bot_user.clone(),
    ));

    mcs_telegram::router::run_polling(cfg, bridge, backend, store, bot_user)
        .await
        .map_err(|e| mcs_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}
