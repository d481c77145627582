//! Presence heartbeat for one open conversation. The beacon pings while
//! the conversation is visible and lets server-side presence lapse on its
//! own when a heartbeat is missed; the only explicit signal is the
//! best-effort leave fired on hide and on teardown.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::debug;

use shared::domain::ConversationId;

use crate::api::ConversationApi;

/// Owned handle; dropping it stops the heartbeat and fires the leave
/// signal, so an unmounted screen can never keep presence alive.
pub struct PresenceBeacon {
    conversation: ConversationId,
    api: Arc<dyn ConversationApi>,
    visible_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PresenceBeacon {
    pub fn start(
        api: Arc<dyn ConversationApi>,
        conversation: ConversationId,
        period: Duration,
    ) -> Self {
        let (visible_tx, visible_rx) = watch::channel(true);
        let task = tokio::spawn(heartbeat_loop(
            Arc::clone(&api),
            conversation,
            period,
            visible_rx,
        ));
        Self {
            conversation,
            api,
            visible_tx,
            task: Some(task),
        }
    }

    /// Mirror document visibility. Hidden pauses the heartbeat and fires a
    /// leave; visible resumes with an immediate ping.
    pub fn set_visible(&self, visible: bool) {
        let _ = self.visible_tx.send(visible);
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(task) = self.task.take() else { return };
        task.abort();
        spawn_leave(Arc::clone(&self.api), self.conversation);
    }
}

impl Drop for PresenceBeacon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn heartbeat_loop(
    api: Arc<dyn ConversationApi>,
    conversation: ConversationId,
    period: Duration,
    mut visible_rx: watch::Receiver<bool>,
) {
    loop {
        if !*visible_rx.borrow() {
            if visible_rx.changed().await.is_err() {
                return;
            }
            continue;
        }

        // No retry: a failed heartbeat just lets presence expire server-side.
        if let Err(err) = api.presence_ping(conversation).await {
            debug!(conversation = conversation.0, error = %err, "presence heartbeat failed");
        }

        tokio::select! {
            _ = sleep(period) => {}
            hidden = visible_rx.wait_for(|visible| !*visible) => {
                match hidden {
                    Ok(_) => spawn_leave(Arc::clone(&api), conversation),
                    Err(_) => return,
                }
            }
        }
    }
}

/// Fire the leave from a detached task so it survives the caller's
/// teardown, mirroring a beacon-style unload request.
fn spawn_leave(api: Arc<dyn ConversationApi>, conversation: ConversationId) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    handle.spawn(async move {
        if let Err(err) = api.presence_leave(conversation).await {
            debug!(conversation = conversation.0, error = %err, "presence leave dropped");
        }
    });
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
