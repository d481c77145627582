//! Outer conversation list: previews, unread badges, recency ordering.
//! Fed by the same push events the timelines consume, so the list stays
//! current without refetching on every message.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use shared::domain::{ConversationId, ConversationKind, UserId};
use shared::protocol::{ConversationSummary, MemberSummary, PreviewSnippet, RealtimeEvent};

use crate::api::ConversationApi;
use crate::error::ClientError;

const EVENT_BUFFER: usize = 128;
const PREVIEW_EXCERPT_CHARS: usize = 64;

#[derive(Debug, Clone)]
pub struct ConversationEntry {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    pub title: String,
    pub unread: u32,
    pub last_message: Option<PreviewSnippet>,
    pub members: Vec<MemberSummary>,
}

impl From<ConversationSummary> for ConversationEntry {
    fn from(summary: ConversationSummary) -> Self {
        Self {
            conversation_id: summary.conversation_id,
            kind: summary.kind,
            title: summary.title,
            unread: summary.unread_count,
            last_message: summary.last_message,
            members: summary.members,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEvent {
    Updated(ConversationId),
    Reordered,
    Refreshed,
    /// A sender's display name changed from what the directory last saw.
    NameChanged(UserId),
}

struct ListState {
    entries: Vec<ConversationEntry>,
    /// Conversations with an open timeline; their unread badge is frozen
    /// because the timeline's own read cursor is authoritative there.
    active: HashSet<ConversationId>,
    /// Display names learned from inbound payloads, so list rows can
    /// resolve senders without a member fetch.
    names: HashMap<UserId, String>,
}

pub struct ConversationList {
    api: Arc<dyn ConversationApi>,
    viewer: UserId,
    inner: Mutex<ListState>,
    events: broadcast::Sender<ListEvent>,
}

impl ConversationList {
    pub fn new(api: Arc<dyn ConversationApi>, viewer: UserId) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            api,
            viewer,
            inner: Mutex::new(ListState {
                entries: Vec::new(),
                active: HashSet::new(),
                names: HashMap::new(),
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> Vec<ConversationEntry> {
        self.inner.lock().await.entries.clone()
    }

    pub async fn refresh(&self) -> Result<(), ClientError> {
        let summaries = self.api.fetch_conversations().await?;
        {
            let mut inner = self.inner.lock().await;
            inner.entries = summaries.into_iter().map(ConversationEntry::from).collect();
            sort_by_recency(&mut inner.entries);
        }
        let _ = self.events.send(ListEvent::Refreshed);
        Ok(())
    }

    pub async fn set_active(&self, conversation: ConversationId) {
        self.inner.lock().await.active.insert(conversation);
    }

    pub async fn clear_active(&self, conversation: ConversationId) {
        self.inner.lock().await.active.remove(&conversation);
    }

    /// Zero the badge after the open timeline confirmed a read.
    pub async fn mark_read_local(&self, conversation: ConversationId) {
        let changed = {
            let mut inner = self.inner.lock().await;
            match inner
                .entries
                .iter_mut()
                .find(|entry| entry.conversation_id == conversation)
            {
                Some(entry) if entry.unread != 0 => {
                    entry.unread = 0;
                    true
                }
                _ => false,
            }
        };
        if changed {
            let _ = self.events.send(ListEvent::Updated(conversation));
        }
    }

    /// Last display name seen for a user on any inbound message.
    pub async fn display_name(&self, user: UserId) -> Option<String> {
        self.inner.lock().await.names.get(&user).cloned()
    }

    pub async fn apply_remote(&self, event: &RealtimeEvent) {
        match event {
            RealtimeEvent::NewMessage { message } => {
                let name_changed = {
                    let mut inner = self.inner.lock().await;
                    let sender = &message.sender;
                    match inner.names.get(&sender.user_id) {
                        Some(existing) if *existing == sender.display_name => false,
                        _ => {
                            inner
                                .names
                                .insert(sender.user_id, sender.display_name.clone());
                            true
                        }
                    }
                };
                if name_changed {
                    let _ = self
                        .events
                        .send(ListEvent::NameChanged(message.sender.user_id));
                }

                let known = {
                    let mut inner = self.inner.lock().await;
                    let position = inner
                        .entries
                        .iter()
                        .position(|entry| entry.conversation_id == message.conversation_id);
                    match position {
                        Some(index) => {
                            let suppress_unread = inner.active.contains(&message.conversation_id)
                                || message.sender.user_id == self.viewer;
                            let entry = &mut inner.entries[index];
                            entry.last_message = Some(PreviewSnippet {
                                kind: message.body.kind(),
                                excerpt: message.body.excerpt(PREVIEW_EXCERPT_CHARS),
                                at: message.sent_at,
                            });
                            if !suppress_unread {
                                entry.unread += 1;
                            }
                            sort_by_recency(&mut inner.entries);
                            true
                        }
                        None => false,
                    }
                };
                if known {
                    let _ = self.events.send(ListEvent::Updated(message.conversation_id));
                    let _ = self.events.send(ListEvent::Reordered);
                } else {
                    // A message for a conversation we have never seen; the
                    // cheap correct move is a refetch.
                    debug!(
                        conversation = message.conversation_id.0,
                        "message for unknown conversation, refetching list"
                    );
                    self.refresh_logged().await;
                }
            }
            RealtimeEvent::ConversationCreated { .. } => {
                // The event does not carry enough to synthesize an entry
                // (membership, resolved display names); refetch instead.
                self.refresh_logged().await;
            }
            RealtimeEvent::MessagesRead {
                conversation_id,
                reader_id,
                ..
            } if *reader_id == self.viewer => {
                self.mark_read_local(*conversation_id).await;
            }
            _ => {}
        }
    }

    async fn refresh_logged(&self) {
        if let Err(err) = self.refresh().await {
            warn!(error = %err, "conversation list refetch failed");
        }
    }
}

/// Stable full re-sort by last activity; fine at this list's size.
fn sort_by_recency(entries: &mut [ConversationEntry]) {
    entries.sort_by_key(|entry| {
        std::cmp::Reverse(entry.last_message.as_ref().map(|preview| preview.at))
    });
}

#[cfg(test)]
#[path = "tests/conversations_tests.rs"]
mod tests;
