//! Typing/recording signals, both directions. Outbound notifications are
//! hard-throttled per conversation; inbound signals expire on their own
//! because the transport is allowed to drop the explicit stop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use shared::domain::{ConversationId, UserId};
use shared::protocol::ActorSummary;

use crate::api::ConversationApi;

/// Outbound signaler. At most one request leaves per rolling throttle
/// window; calls inside the window are dropped, not queued, so a "stopped
/// typing" signal can trail reality by up to one window.
pub struct TypingSignaler {
    api: Arc<dyn ConversationApi>,
    conversation: ConversationId,
    throttle: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl TypingSignaler {
    pub fn new(
        api: Arc<dyn ConversationApi>,
        conversation: ConversationId,
        throttle: Duration,
    ) -> Self {
        Self {
            api,
            conversation,
            throttle,
            last_sent: Mutex::new(None),
        }
    }

    /// Fire a typing/recording notification unless the throttle window is
    /// still open. Returns whether a request was actually dispatched.
    pub fn notify(&self, is_typing: bool, is_recording: bool) -> bool {
        let now = Instant::now();
        {
            let mut guard = self.last_sent.lock().expect("lock");
            if let Some(previous) = *guard {
                if now.duration_since(previous) < self.throttle {
                    return false;
                }
            }
            *guard = Some(now);
        }

        let api = Arc::clone(&self.api);
        let conversation = self.conversation;
        tokio::spawn(async move {
            if let Err(err) = api.send_typing(conversation, is_typing, is_recording).await {
                debug!(error = %err, "typing notification dropped");
            }
        });
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSignal {
    pub user_id: UserId,
    pub display_name: String,
    pub is_typing: bool,
    pub is_recording: bool,
}

struct TrackerInner {
    signals: HashMap<UserId, (ActiveSignal, u64)>,
    next_generation: u64,
}

/// Inbound per-actor signal state. Every receipt restarts that actor's
/// expiry clock; a false/false receipt clears immediately. Simultaneous
/// typists are independent entries.
#[derive(Clone)]
pub struct TypingTracker {
    inner: Arc<Mutex<TrackerInner>>,
    expiry: Duration,
    changed: Arc<watch::Sender<Vec<ActiveSignal>>>,
}

impl TypingTracker {
    pub fn new(expiry: Duration) -> Self {
        let (changed, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(Mutex::new(TrackerInner {
                signals: HashMap::new(),
                next_generation: 0,
            })),
            expiry,
            changed: Arc::new(changed),
        }
    }

    pub fn watch(&self) -> watch::Receiver<Vec<ActiveSignal>> {
        self.changed.subscribe()
    }

    pub fn apply(&self, actor: &ActorSummary, is_typing: bool, is_recording: bool) {
        if !is_typing && !is_recording {
            let removed = {
                let mut inner = self.inner.lock().expect("lock");
                inner.signals.remove(&actor.user_id).is_some()
            };
            if removed {
                self.publish();
            }
            return;
        }

        let generation = {
            let mut inner = self.inner.lock().expect("lock");
            inner.next_generation += 1;
            let generation = inner.next_generation;
            inner.signals.insert(
                actor.user_id,
                (
                    ActiveSignal {
                        user_id: actor.user_id,
                        display_name: actor.display_name.clone(),
                        is_typing,
                        is_recording,
                    },
                    generation,
                ),
            );
            generation
        };
        self.publish();

        let tracker = self.clone();
        let user_id = actor.user_id;
        tokio::spawn(async move {
            sleep(tracker.expiry).await;
            let expired = {
                let mut inner = tracker.inner.lock().expect("lock");
                match inner.signals.get(&user_id) {
                    Some((_, current)) if *current == generation => {
                        inner.signals.remove(&user_id);
                        true
                    }
                    _ => false,
                }
            };
            if expired {
                tracker.publish();
            }
        });
    }

    /// Signals currently alive, ordered by user id for stable rendering.
    pub fn active(&self) -> Vec<ActiveSignal> {
        let inner = self.inner.lock().expect("lock");
        let mut signals: Vec<ActiveSignal> =
            inner.signals.values().map(|(s, _)| s.clone()).collect();
        signals.sort_by_key(|s| s.user_id);
        signals
    }

    /// Display names of everyone typing, for the joined "X, Y are typing…"
    /// line.
    pub fn typing_names(&self) -> Vec<String> {
        self.active()
            .into_iter()
            .filter(|s| s.is_typing)
            .map(|s| s.display_name)
            .collect()
    }

    fn publish(&self) {
        let _ = self.changed.send(self.active());
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
