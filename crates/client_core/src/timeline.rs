//! Per-conversation message timeline: optimistic sends, the idempotent
//! remote-event merge, in-place mutation, pin reordering, and read-cursor
//! bookkeeping.
//!
//! [`TimelineState`] is a plain data structure so the merge algorithm can
//! be exercised without IO; [`Timeline`] wraps it with the persistence
//! calls, the reload-on-failure recovery policy, and change events.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use shared::domain::{
    ConversationId, ConversationKind, MessageId, MessageKind, MessageStatus, SenderRole, UserId,
};
use shared::protocol::{
    ActorSummary, MessageBody, MessagePayload, RealtimeEvent, ReplyPreview,
};

use crate::api::{ConversationApi, OutgoingMessage, PostMessageResponse, TimelinePage};
use crate::error::ClientError;

const EVENT_BUFFER: usize = 256;
const REPLY_EXCERPT_CHARS: usize = 80;

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

fn next_local_id() -> u64 {
    NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Timeline identity. Optimistic entries live in their own id space, so a
/// temporary id can never collide with a server-assigned one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Local(u64),
    Server(MessageId),
}

#[derive(Debug, Clone)]
pub struct TimelineMessage {
    pub key: MessageKey,
    pub sender: ActorSummary,
    pub sender_role: SenderRole,
    pub body: MessageBody,
    pub status: MessageStatus,
    pub edited: bool,
    pub pinned: bool,
    pub reply_to: Option<ReplyPreview>,
    /// Server-assigned; `None` while the entry is optimistic.
    pub sent_at: Option<DateTime<Utc>>,
    pub reactions: BTreeMap<String, u32>,
}

impl TimelineMessage {
    pub fn server_id(&self) -> Option<MessageId> {
        match self.key {
            MessageKey::Server(id) => Some(id),
            MessageKey::Local(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Draft {
    pub body: MessageBody,
    pub reply_to: Option<ReplyPreview>,
}

/// Who the timeline belongs to, for resolving sender roles relative to the
/// viewer. Staff viewers see fellow staff as teammates; everyone else is
/// the counterpart.
#[derive(Debug, Clone, Copy)]
pub struct Viewer {
    pub user_id: UserId,
    pub is_staff: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SendFingerprint {
    kind: MessageKind,
    content: String,
    reply_target: Option<MessageId>,
}

impl SendFingerprint {
    fn of(body: &MessageBody, reply_to: Option<&ReplyPreview>) -> Self {
        let content = match body {
            MessageBody::Text { text } => text.clone(),
            MessageBody::Image { media }
            | MessageBody::Video { media }
            | MessageBody::Audio { media } => media.url.clone(),
        };
        Self {
            kind: body.kind(),
            content,
            reply_target: reply_to.map(|r| r.target_id),
        }
    }
}

#[derive(Debug)]
struct PendingSend {
    local: u64,
    fingerprint: SendFingerprint,
}

/// What a merge call did, so callers can emit the right change event and
/// tests can assert idempotence directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Appended(MessageKey),
    /// An optimistic entry was matched and took the server identity.
    Reconciled(MessageKey),
    Mutated(MessageKey),
    Removed(MessageKey),
    Reordered,
    ReadAdvanced,
    Duplicate,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    MarkedFailed,
    RemovedEntry,
    /// The transport echo reconciled the message before the HTTP error
    /// arrived; the send actually succeeded.
    AlreadyResolved(MessageId),
}

pub struct TimelineState {
    conversation: ConversationId,
    kind: ConversationKind,
    viewer: Viewer,
    entries: Vec<TimelineMessage>,
    pending: VecDeque<PendingSend>,
    /// Local ids that already took a server identity, kept so a late HTTP
    /// resolution (or failure) after an echo reconcile stays a no-op.
    resolved: HashMap<u64, MessageId>,
    read_cursor: Option<MessageId>,
    unread: u32,
}

impl TimelineState {
    pub fn new(conversation: ConversationId, kind: ConversationKind, viewer: Viewer) -> Self {
        Self {
            conversation,
            kind,
            viewer,
            entries: Vec::new(),
            pending: VecDeque::new(),
            resolved: HashMap::new(),
            read_cursor: None,
            unread: 0,
        }
    }

    pub fn hydrate(&mut self, history: Vec<MessagePayload>, read_cursor: Option<MessageId>) {
        let entries = history
            .into_iter()
            .map(|payload| self.entry_from_payload(payload))
            .collect();
        self.entries = entries;
        self.read_cursor = read_cursor;
        self.recount_unread();
    }

    /// Replace server-backed entries with fresh history, keeping optimistic
    /// entries that have not resolved yet (they are not on the server).
    pub fn rehydrate(&mut self, history: Vec<MessagePayload>, read_cursor: Option<MessageId>) {
        let kept: Vec<TimelineMessage> = self
            .entries
            .drain(..)
            .filter(|entry| matches!(entry.key, MessageKey::Local(_)))
            .collect();
        let cursor = read_cursor.or(self.read_cursor);
        self.hydrate(history, cursor);
        let still_pending: Vec<u64> = kept
            .iter()
            .filter_map(|entry| match entry.key {
                MessageKey::Local(local) => Some(local),
                MessageKey::Server(_) => None,
            })
            .collect();
        self.entries.extend(kept);
        self.pending
            .retain(|pending| still_pending.contains(&pending.local));
        self.recount_unread();
    }

    /// Prepend an older history page, skipping anything already present.
    /// Returns how many entries were actually added.
    pub fn prepend_history(&mut self, page: Vec<MessagePayload>) -> usize {
        let fresh: Vec<TimelineMessage> = page
            .into_iter()
            .filter(|payload| self.index_of_server(payload.message_id).is_none())
            .map(|payload| self.entry_from_payload(payload))
            .collect();
        let added = fresh.len();
        self.entries.splice(0..0, fresh);
        self.recount_unread();
        added
    }

    pub fn conversation(&self) -> ConversationId {
        self.conversation
    }

    pub fn kind(&self) -> ConversationKind {
        self.kind
    }

    pub fn messages(&self) -> &[TimelineMessage] {
        &self.entries
    }

    pub fn unread(&self) -> u32 {
        self.unread
    }

    pub fn read_cursor(&self) -> Option<MessageId> {
        self.read_cursor
    }

    pub fn get(&self, key: MessageKey) -> Option<&TimelineMessage> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    /// Oldest server-backed id, the `before` cursor for pagination.
    pub fn oldest_server_id(&self) -> Option<MessageId> {
        self.entries
            .iter()
            .filter_map(TimelineMessage::server_id)
            .min()
    }

    pub fn begin_send(&mut self, draft: Draft) -> u64 {
        let local = next_local_id();
        self.pending.push_back(PendingSend {
            local,
            fingerprint: SendFingerprint::of(&draft.body, draft.reply_to.as_ref()),
        });
        self.entries.push(TimelineMessage {
            key: MessageKey::Local(local),
            sender: ActorSummary {
                user_id: self.viewer.user_id,
                display_name: String::new(),
                role: None,
            },
            sender_role: SenderRole::Own,
            body: draft.body,
            status: MessageStatus::Sending,
            edited: false,
            pinned: false,
            reply_to: draft.reply_to,
            sent_at: None,
            reactions: BTreeMap::new(),
        });
        local
    }

    /// The HTTP send resolved: swap the temporary identity for the server
    /// one, in place. Safe when the transport echo already did the swap.
    pub fn resolve_send(
        &mut self,
        local: u64,
        server_id: MessageId,
        sent_at: DateTime<Utc>,
    ) -> MessageKey {
        self.pending.retain(|pending| pending.local != local);

        let Some(index) = self.index_of_local(local) else {
            // Echo path won the race; nothing left to swap.
            return MessageKey::Server(self.resolved.get(&local).copied().unwrap_or(server_id));
        };

        if let Some(existing) = self.index_of_server(server_id) {
            // The echo appended this id separately; collapse the optimistic
            // duplicate so the id stays unique.
            self.entries.remove(index);
            let key = self.entries[if existing > index { existing - 1 } else { existing }].key;
            self.resolved.insert(local, server_id);
            return key;
        }

        let entry = &mut self.entries[index];
        entry.key = MessageKey::Server(server_id);
        if entry.status == MessageStatus::Sending {
            entry.status = MessageStatus::Sent;
        }
        entry.sent_at.get_or_insert(sent_at);
        self.resolved.insert(local, server_id);
        MessageKey::Server(server_id)
    }

    pub fn fail_send(&mut self, local: u64, remove_entry: bool) -> SendFailure {
        self.pending.retain(|pending| pending.local != local);

        let Some(index) = self.index_of_local(local) else {
            return match self.resolved.get(&local) {
                Some(server_id) => SendFailure::AlreadyResolved(*server_id),
                // Entry was deleted locally before the failure landed.
                None => SendFailure::RemovedEntry,
            };
        };

        if self.entries[index].status == MessageStatus::Failed {
            return SendFailure::MarkedFailed;
        }

        if remove_entry {
            self.entries.remove(index);
            SendFailure::RemovedEntry
        } else {
            self.entries[index].status = MessageStatus::Failed;
            SendFailure::MarkedFailed
        }
    }

    /// Re-arm a failed text message for another attempt, in place.
    pub fn retry(&mut self, local: u64) -> Option<Draft> {
        let index = self.index_of_local(local)?;
        if self.entries[index].status != MessageStatus::Failed {
            return None;
        }
        let entry = &mut self.entries[index];
        entry.status = MessageStatus::Sending;
        let draft = Draft {
            body: entry.body.clone(),
            reply_to: entry.reply_to.clone(),
        };
        self.pending.push_back(PendingSend {
            local,
            fingerprint: SendFingerprint::of(&draft.body, draft.reply_to.as_ref()),
        });
        Some(draft)
    }

    /// The merge function: absorbs at-least-once, unordered delivery.
    /// Calling it twice with the same event leaves the timeline unchanged
    /// the second time.
    pub fn apply_remote(&mut self, event: &RealtimeEvent) -> MergeOutcome {
        if event.conversation_id() != Some(self.conversation) {
            return MergeOutcome::Ignored;
        }

        match event {
            RealtimeEvent::NewMessage { message } => self.merge_new_message(message),

            RealtimeEvent::MessageEdited {
                message_id, body, ..
            } => match self.index_of_server(*message_id) {
                Some(index) => {
                    let entry = &mut self.entries[index];
                    entry.body = body.clone();
                    entry.edited = true;
                    MergeOutcome::Mutated(entry.key)
                }
                None => MergeOutcome::Ignored,
            },

            RealtimeEvent::MessageDeleted { message_id, .. } => {
                match self.index_of_server(*message_id) {
                    Some(index) => {
                        let removed = self.entries.remove(index);
                        self.recount_unread();
                        MergeOutcome::Removed(removed.key)
                    }
                    None => MergeOutcome::Duplicate,
                }
            }

            RealtimeEvent::PostPinned {
                message_id, pinned, ..
            } => {
                if !self.kind.supports_pinning() {
                    return MergeOutcome::Ignored;
                }
                match self.index_of_server(*message_id) {
                    Some(index) => {
                        if self.entries[index].pinned == *pinned {
                            return MergeOutcome::Duplicate;
                        }
                        self.entries[index].pinned = *pinned;
                        self.sort_pinned_first();
                        MergeOutcome::Reordered
                    }
                    None => MergeOutcome::Ignored,
                }
            }

            RealtimeEvent::ReactionUpdated {
                message_id,
                reactions,
                ..
            } => match self.index_of_server(*message_id) {
                Some(index) => {
                    // Server tallies replace local ones wholesale.
                    self.entries[index].reactions = reactions.clone();
                    MergeOutcome::Mutated(self.entries[index].key)
                }
                None => MergeOutcome::Ignored,
            },

            RealtimeEvent::MessagesRead {
                reader_id,
                up_to_message_id,
                ..
            } => {
                if *reader_id == self.viewer.user_id {
                    // Another device of ours read; advance the local cursor.
                    match self.mark_read(*up_to_message_id) {
                        Some(_) => MergeOutcome::ReadAdvanced,
                        None => MergeOutcome::Duplicate,
                    }
                } else {
                    let mut touched = false;
                    for entry in &mut self.entries {
                        if entry.sender_role == SenderRole::Own
                            && entry.server_id().is_some_and(|id| id <= *up_to_message_id)
                            && entry.status.can_advance_to(MessageStatus::Read)
                        {
                            entry.status = MessageStatus::Read;
                            touched = true;
                        }
                    }
                    if touched {
                        MergeOutcome::ReadAdvanced
                    } else {
                        MergeOutcome::Duplicate
                    }
                }
            }

            // Ephemeral or list-level concerns; nothing for the timeline.
            RealtimeEvent::Typing { .. }
            | RealtimeEvent::PresenceChanged { .. }
            | RealtimeEvent::ConversationCreated { .. }
            | RealtimeEvent::NewNotification { .. }
            | RealtimeEvent::ViewerCount { .. }
            | RealtimeEvent::LiveEnded { .. } => MergeOutcome::Ignored,
        }
    }

    fn merge_new_message(&mut self, message: &MessagePayload) -> MergeOutcome {
        if self.index_of_server(message.message_id).is_some() {
            return MergeOutcome::Duplicate;
        }

        if message.sender.user_id == self.viewer.user_id {
            let fingerprint = SendFingerprint::of(&message.body, message.reply_to.as_ref());
            // Oldest pending send with matching content wins: sends echo in
            // submission order, so FIFO pairs rapid multi-sends correctly.
            let matched = self
                .pending
                .iter()
                .position(|pending| pending.fingerprint == fingerprint);
            if let Some(queue_index) = matched {
                let pending = self.pending.remove(queue_index).expect("index in range");
                if let Some(index) = self.index_of_local(pending.local) {
                    let entry = &mut self.entries[index];
                    entry.key = MessageKey::Server(message.message_id);
                    if entry.status == MessageStatus::Sending {
                        entry.status = MessageStatus::Sent;
                    }
                    entry.sent_at.get_or_insert(message.sent_at);
                    entry.pinned = message.pinned;
                    entry.edited = message.edited;
                    self.resolved.insert(pending.local, message.message_id);
                    return MergeOutcome::Reconciled(MessageKey::Server(message.message_id));
                }
            }
        }

        let entry = self.entry_from_payload(message.clone());
        let key = entry.key;
        self.entries.push(entry);
        self.recount_unread();
        MergeOutcome::Appended(key)
    }

    /// Text messages only; media content is immutable once sent.
    pub fn edit_local(&mut self, key: MessageKey, text: &str) -> Option<MessageId> {
        let index = self.entries.iter().position(|entry| entry.key == key)?;
        let id = self.entries[index].server_id()?;
        let entry = &mut self.entries[index];
        if !matches!(entry.body, MessageBody::Text { .. }) {
            return None;
        }
        entry.body = MessageBody::Text {
            text: text.to_string(),
        };
        entry.edited = true;
        Some(id)
    }

    /// Remove an entry. Returns the server id to delete remotely, or
    /// `Some(None)` for a purely local (unsent/failed) entry.
    #[allow(clippy::option_option)]
    pub fn delete_local(&mut self, key: MessageKey) -> Option<Option<MessageId>> {
        let index = self.entries.iter().position(|entry| entry.key == key)?;
        let removed = self.entries.remove(index);
        if let MessageKey::Local(local) = removed.key {
            self.pending.retain(|pending| pending.local != local);
        }
        self.recount_unread();
        Some(removed.server_id())
    }

    pub fn toggle_pin(&mut self, key: MessageKey) -> Option<(MessageId, bool)> {
        let index = self.entries.iter().position(|entry| entry.key == key)?;
        let id = self.entries[index].server_id()?;
        let pinned = !self.entries[index].pinned;
        self.entries[index].pinned = pinned;
        self.sort_pinned_first();
        Some((id, pinned))
    }

    /// Optimistic local tally bump; the next reaction-updated event
    /// replaces it with server truth.
    pub fn bump_reaction(&mut self, key: MessageKey, emoji: &str) -> Option<MessageId> {
        let index = self.entries.iter().position(|entry| entry.key == key)?;
        let id = self.entries[index].server_id()?;
        *self.entries[index]
            .reactions
            .entry(emoji.to_string())
            .or_insert(0) += 1;
        Some(id)
    }

    /// Capture the denormalized snapshot a reply carries. Taken once, at
    /// compose time; deleting the target later must not blank it.
    pub fn reply_snapshot(&self, key: MessageKey) -> Option<ReplyPreview> {
        let entry = self.get(key)?;
        let target_id = entry.server_id()?;
        Some(ReplyPreview {
            target_id,
            kind: entry.body.kind(),
            excerpt: entry.body.excerpt(REPLY_EXCERPT_CHARS),
            sender_name: entry.sender.display_name.clone(),
        })
    }

    /// Monotonic cursor advance; redundant and backward calls are no-ops.
    pub fn mark_read(&mut self, up_to: MessageId) -> Option<MessageId> {
        if self.read_cursor.is_some_and(|cursor| up_to <= cursor) {
            return None;
        }
        self.read_cursor = Some(up_to);
        self.recount_unread();
        Some(up_to)
    }

    fn entry_from_payload(&self, payload: MessagePayload) -> TimelineMessage {
        let sender_role = self.resolve_role(&payload.sender);
        let status = if sender_role == SenderRole::Own {
            MessageStatus::Sent
        } else {
            MessageStatus::Delivered
        };
        TimelineMessage {
            key: MessageKey::Server(payload.message_id),
            sender_role,
            status,
            sender: payload.sender,
            body: payload.body,
            edited: payload.edited,
            pinned: payload.pinned,
            reply_to: payload.reply_to,
            sent_at: Some(payload.sent_at),
            reactions: BTreeMap::new(),
        }
    }

    fn resolve_role(&self, sender: &ActorSummary) -> SenderRole {
        if sender.user_id == self.viewer.user_id {
            return SenderRole::Own;
        }
        let sender_is_staff = matches!(
            sender.role,
            Some(shared::domain::MemberRole::Owner) | Some(shared::domain::MemberRole::Agent)
        );
        if self.viewer.is_staff && sender_is_staff {
            SenderRole::Teammate
        } else {
            SenderRole::Counterpart
        }
    }

    fn index_of_local(&self, local: u64) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.key == MessageKey::Local(local))
    }

    fn index_of_server(&self, id: MessageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.key == MessageKey::Server(id))
    }

    /// Pinned before unpinned, newest first inside each group. Optimistic
    /// entries have no timestamp yet and rank newest. Stable, so equal
    /// timestamps keep their arrival order.
    fn sort_pinned_first(&mut self) {
        fn rank(entry: &TimelineMessage) -> i64 {
            entry
                .sent_at
                .map(|at| at.timestamp_millis())
                .unwrap_or(i64::MAX)
        }
        self.entries.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then_with(|| rank(b).cmp(&rank(a)))
        });
    }

    fn recount_unread(&mut self) {
        self.unread = self
            .entries
            .iter()
            .filter(|entry| {
                entry.sender_role != SenderRole::Own
                    && entry
                        .server_id()
                        .is_some_and(|id| self.read_cursor.map_or(true, |cursor| id > cursor))
            })
            .count() as u32;
    }
}

/// Change notifications for whatever renders this timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineEvent {
    Appended(MessageKey),
    Updated(MessageKey),
    Removed(MessageKey),
    Reordered,
    Prepended(usize),
    UnreadChanged(u32),
    Reloaded,
}

pub struct Timeline {
    conversation: ConversationId,
    api: Arc<dyn ConversationApi>,
    state: Mutex<TimelineState>,
    events: broadcast::Sender<TimelineEvent>,
    read_sync: StdMutex<Option<JoinHandle<()>>>,
    read_sync_debounce: Duration,
    page_size: u32,
}

impl Timeline {
    pub fn new(
        api: Arc<dyn ConversationApi>,
        viewer: Viewer,
        conversation: ConversationId,
        page: TimelinePage,
        read_sync_debounce: Duration,
        page_size: u32,
    ) -> Self {
        let mut state = TimelineState::new(conversation, page.kind, viewer);
        state.hydrate(page.messages, page.read_cursor);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            conversation,
            api,
            state: Mutex::new(state),
            events,
            read_sync: StdMutex::new(None),
            read_sync_debounce,
            page_size,
        }
    }

    pub fn conversation(&self) -> ConversationId {
        self.conversation
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimelineEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> Vec<TimelineMessage> {
        self.state.lock().await.messages().to_vec()
    }

    pub async fn unread(&self) -> u32 {
        self.state.lock().await.unread()
    }

    pub async fn send_text(
        &self,
        text: impl Into<String>,
        reply_to: Option<ReplyPreview>,
    ) -> Result<MessageKey, ClientError> {
        let body = MessageBody::Text { text: text.into() };
        self.send_body(body, reply_to, false).await
    }

    /// Send a media message whose upload already resolved. A failed media
    /// send has no retry affordance, so the entry is removed outright.
    pub async fn send_media(
        &self,
        body: MessageBody,
        reply_to: Option<ReplyPreview>,
    ) -> Result<MessageKey, ClientError> {
        if body.kind() == MessageKind::Text {
            return Err(ClientError::Unsupported("send_media with a text body"));
        }
        self.send_body(body, reply_to, true).await
    }

    async fn send_body(
        &self,
        body: MessageBody,
        reply_to: Option<ReplyPreview>,
        remove_on_failure: bool,
    ) -> Result<MessageKey, ClientError> {
        let (local, outgoing) = {
            let mut state = self.state.lock().await;
            let outgoing = OutgoingMessage {
                body: body.clone(),
                reply_to: reply_to.clone(),
            };
            let local = state.begin_send(Draft { body, reply_to });
            (local, outgoing)
        };
        let _ = self.events.send(TimelineEvent::Appended(MessageKey::Local(local)));

        let result = self.api.post_message(self.conversation, &outgoing).await;
        self.complete_send(local, result, remove_on_failure).await
    }

    async fn complete_send(
        &self,
        local: u64,
        result: Result<PostMessageResponse, ClientError>,
        remove_on_failure: bool,
    ) -> Result<MessageKey, ClientError> {
        match result {
            Ok(response) => {
                let key = {
                    let mut state = self.state.lock().await;
                    state.resolve_send(local, response.message_id, response.sent_at)
                };
                let _ = self.events.send(TimelineEvent::Updated(key));
                Ok(key)
            }
            Err(err) => {
                let failure = {
                    let mut state = self.state.lock().await;
                    state.fail_send(local, remove_on_failure)
                };
                match failure {
                    SendFailure::MarkedFailed => {
                        let _ = self
                            .events
                            .send(TimelineEvent::Updated(MessageKey::Local(local)));
                        Err(err)
                    }
                    SendFailure::RemovedEntry => {
                        let _ = self
                            .events
                            .send(TimelineEvent::Removed(MessageKey::Local(local)));
                        Err(err)
                    }
                    SendFailure::AlreadyResolved(id) => {
                        debug!(
                            conversation = self.conversation.0,
                            message = id.0,
                            "send confirmed by echo despite http error"
                        );
                        Ok(MessageKey::Server(id))
                    }
                }
            }
        }
    }

    /// Retry one failed message without touching its neighbours.
    pub async fn retry(&self, key: MessageKey) -> Result<MessageKey, ClientError> {
        let MessageKey::Local(local) = key else {
            return Err(ClientError::NotRetryable);
        };
        let draft = {
            let mut state = self.state.lock().await;
            state.retry(local).ok_or(ClientError::NotRetryable)?
        };
        let _ = self.events.send(TimelineEvent::Updated(key));

        let outgoing = OutgoingMessage {
            body: draft.body,
            reply_to: draft.reply_to,
        };
        let result = self.api.post_message(self.conversation, &outgoing).await;
        self.complete_send(local, result, false).await
    }

    pub async fn edit(&self, key: MessageKey, text: String) -> Result<(), ClientError> {
        let message_id = {
            let mut state = self.state.lock().await;
            state
                .edit_local(key, &text)
                .ok_or(ClientError::UnknownMessage)?
        };
        let _ = self.events.send(TimelineEvent::Updated(key));

        let body = MessageBody::Text { text };
        if let Err(err) = self
            .api
            .edit_message(self.conversation, message_id, &body)
            .await
        {
            self.recover("edit").await;
            return Err(err);
        }
        Ok(())
    }

    pub async fn delete(&self, key: MessageKey) -> Result<(), ClientError> {
        let server_id = {
            let mut state = self.state.lock().await;
            state.delete_local(key).ok_or(ClientError::UnknownMessage)?
        };
        let _ = self.events.send(TimelineEvent::Removed(key));

        if let Some(id) = server_id {
            if let Err(err) = self.api.delete_message(self.conversation, id).await {
                self.recover("delete").await;
                return Err(err);
            }
        }
        Ok(())
    }

    pub async fn toggle_pin(&self, key: MessageKey) -> Result<bool, ClientError> {
        let (message_id, pinned) = {
            let mut state = self.state.lock().await;
            if !state.kind().supports_pinning() {
                return Err(ClientError::Unsupported("pinning"));
            }
            state.toggle_pin(key).ok_or(ClientError::UnknownMessage)?
        };
        let _ = self.events.send(TimelineEvent::Reordered);

        if let Err(err) = self
            .api
            .set_pinned(self.conversation, message_id, pinned)
            .await
        {
            self.recover("pin").await;
            return Err(err);
        }
        Ok(pinned)
    }

    pub async fn toggle_reaction(&self, key: MessageKey, emoji: &str) -> Result<(), ClientError> {
        let message_id = {
            let mut state = self.state.lock().await;
            state
                .bump_reaction(key, emoji)
                .ok_or(ClientError::UnknownMessage)?
        };
        let _ = self.events.send(TimelineEvent::Updated(key));

        if let Err(err) = self
            .api
            .toggle_reaction(self.conversation, message_id, emoji)
            .await
        {
            self.recover("reaction").await;
            return Err(err);
        }
        Ok(())
    }

    pub async fn reply_snapshot(&self, key: MessageKey) -> Option<ReplyPreview> {
        self.state.lock().await.reply_snapshot(key)
    }

    /// Advance the read cursor locally and schedule the debounced push of
    /// the new cursor to the server. Redundant calls are free.
    pub async fn mark_read(&self, up_to: MessageId) {
        let advanced = {
            let mut state = self.state.lock().await;
            let advanced = state.mark_read(up_to);
            advanced.map(|cursor| (cursor, state.unread()))
        };
        let Some((cursor, unread)) = advanced else {
            return;
        };
        let _ = self.events.send(TimelineEvent::UnreadChanged(unread));
        self.schedule_read_sync(cursor);
    }

    fn schedule_read_sync(&self, cursor: MessageId) {
        let api = Arc::clone(&self.api);
        let conversation = self.conversation;
        let debounce = self.read_sync_debounce;
        let task = tokio::spawn(async move {
            sleep(debounce).await;
            if let Err(err) = api.mark_read(conversation, cursor).await {
                // Eventually consistent: the next advance retries.
                debug!(conversation = conversation.0, error = %err, "read-cursor sync failed");
            }
        });
        let mut guard = self.read_sync.lock().expect("lock");
        if let Some(previous) = guard.replace(task) {
            previous.abort();
        }
    }

    /// Feed one transport event through the merge. Called by the pump for
    /// every event on this conversation's topic, duplicates included.
    pub async fn apply_remote(&self, event: &RealtimeEvent) -> MergeOutcome {
        let (outcome, unread) = {
            let mut state = self.state.lock().await;
            let outcome = state.apply_remote(event);
            (outcome, state.unread())
        };
        match outcome {
            MergeOutcome::Appended(key) => {
                let _ = self.events.send(TimelineEvent::Appended(key));
                let _ = self.events.send(TimelineEvent::UnreadChanged(unread));
            }
            MergeOutcome::Reconciled(key) | MergeOutcome::Mutated(key) => {
                let _ = self.events.send(TimelineEvent::Updated(key));
            }
            MergeOutcome::Removed(key) => {
                let _ = self.events.send(TimelineEvent::Removed(key));
            }
            MergeOutcome::Reordered => {
                let _ = self.events.send(TimelineEvent::Reordered);
            }
            MergeOutcome::ReadAdvanced => {
                let _ = self.events.send(TimelineEvent::UnreadChanged(unread));
            }
            MergeOutcome::Duplicate | MergeOutcome::Ignored => {}
        }
        outcome
    }

    /// Fetch the page preceding the oldest loaded message.
    pub async fn load_older(&self) -> Result<usize, ClientError> {
        let before = { self.state.lock().await.oldest_server_id() };
        let Some(before) = before else { return Ok(0) };

        let page = self
            .api
            .fetch_timeline(self.conversation, self.page_size, Some(before))
            .await?;
        let added = {
            let mut state = self.state.lock().await;
            state.prepend_history(page.messages)
        };
        if added > 0 {
            let _ = self.events.send(TimelineEvent::Prepended(added));
        }
        Ok(added)
    }

    /// Replace local state with server truth. The recovery path for every
    /// failed mutation that has no per-entity failure affordance.
    pub async fn reload(&self) -> Result<(), ClientError> {
        let page = self
            .api
            .fetch_timeline(self.conversation, self.page_size, None)
            .await?;
        {
            let mut state = self.state.lock().await;
            state.rehydrate(page.messages, page.read_cursor);
        }
        let _ = self.events.send(TimelineEvent::Reloaded);
        Ok(())
    }

    async fn recover(&self, operation: &'static str) {
        warn!(
            conversation = self.conversation.0,
            operation, "mutation failed, reloading timeline"
        );
        if let Err(err) = self.reload().await {
            warn!(conversation = self.conversation.0, error = %err, "timeline reload failed");
        }
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
