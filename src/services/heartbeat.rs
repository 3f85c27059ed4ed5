//! Heartbeat sweeper — evicts connections that stopped answering.
//!
//! DESIGN
//! ======
//! Websocket sessions ping their client every heartbeat interval and
//! refresh `last_seen` on every inbound frame (pongs included). This task
//! wakes on the same interval and asks the hub to drop anything quieter
//! than the presence timeout. Abrupt network loss without a close frame
//! would otherwise leave the user listed as active forever.

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::state::AppState;

/// Spawn the background sweeper. Returns a handle for shutdown.
pub fn spawn_heartbeat_task(state: AppState) -> JoinHandle<()> {
    let interval = state.chat.heartbeat_interval;
    let timeout = state.chat.presence_timeout;
    info!(interval_secs = interval.as_secs(), timeout_secs = timeout.as_secs(), "heartbeat sweeper configured");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sweep(&state).await;
        }
    })
}

async fn sweep(state: &AppState) -> usize {
    let evicted = state.hub.evict_stale(state.chat.presence_timeout).await;
    if !evicted.is_empty() {
        info!(count = evicted.len(), "heartbeat: evicted stale clients");
    }
    evicted.len()
}

#[cfg(test)]
#[path = "heartbeat_test.rs"]
mod tests;
