//! Real-time conversation synchronization core.
//!
//! [`SyncClient`] owns the HTTP persistence client, observes the shared
//! push [`Transport`], and keeps the conversation list current. Opening a
//! conversation yields a [`ConversationHandle`]: a timeline store, typing
//! signals, and a presence beacon, all torn down together when the handle
//! drops.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};
use url::Url;

use shared::domain::{ConversationId, MessageId, MessageKind};
use shared::protocol::{MediaRef, MessageBody, RealtimeEvent, ReplyPreview};
use transport::{ConnectionStatus, Transport};

pub mod api;
pub mod config;
pub mod conversations;
pub mod error;
pub mod presence;
pub mod timeline;
pub mod typing;
pub mod upload;

pub use api::{ConversationApi, HttpApi, OutgoingMessage, TimelinePage};
pub use config::ClientConfig;
pub use conversations::{ConversationEntry, ConversationList, ListEvent};
pub use error::ClientError;
pub use presence::PresenceBeacon;
pub use timeline::{
    MergeOutcome, MessageKey, Timeline, TimelineEvent, TimelineMessage, Viewer,
};
pub use typing::{ActiveSignal, TypingSignaler, TypingTracker};
pub use upload::{MediaUpload, MediaUploader, UploadError, UploadHandle};

const CLIENT_EVENT_BUFFER: usize = 256;

/// App-shell level events: things that matter outside any one open screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ConnectionChanged(ConnectionStatus),
    Notification {
        title: String,
        body: String,
        conversation_id: Option<ConversationId>,
    },
    ViewerCount {
        conversation_id: ConversationId,
        count: u32,
    },
    LiveEnded {
        conversation_id: ConversationId,
    },
}

pub struct SyncClient {
    config: ClientConfig,
    viewer: Viewer,
    api: Arc<HttpApi>,
    transport: Transport,
    conversations: Arc<ConversationList>,
    uploader: MediaUploader,
    events: broadcast::Sender<ClientEvent>,
    background: StdMutex<Vec<JoinHandle<()>>>,
}

impl SyncClient {
    pub fn new(
        config: ClientConfig,
        viewer: Viewer,
        transport: Transport,
    ) -> Result<Arc<Self>, ClientError> {
        let base = Url::parse(&config.api_url)
            .map_err(|err| ClientError::Config(format!("api_url: {err}")))?;
        let api = Arc::new(HttpApi::new(base, viewer.user_id));
        let conversations = Arc::new(ConversationList::new(
            api.clone() as Arc<dyn ConversationApi>,
            viewer.user_id,
        ));
        let uploader = MediaUploader::new(api.clone() as Arc<dyn upload::MediaStore>);
        let (events, _) = broadcast::channel(CLIENT_EVENT_BUFFER);
        Ok(Arc::new(Self {
            config,
            viewer,
            api,
            transport,
            conversations,
            uploader,
            events,
            background: StdMutex::new(Vec::new()),
        }))
    }

    /// Fetch the conversation list and start the background machinery: the
    /// user-scoped event pump, the connection-status relay, and the
    /// timer-driven list resync. Idempotent: a second call just re-fetches.
    pub async fn start(&self) -> Result<(), ClientError> {
        self.conversations.refresh().await?;

        if !self.background.lock().expect("lock").is_empty() {
            return Ok(());
        }

        let mut subscription = self
            .transport
            .subscribe(self.config.user_topic(self.viewer.user_id))
            .await?;
        let conversations = Arc::clone(&self.conversations);
        let events = self.events.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                conversations.apply_remote(&event).await;
                emit_shell_event(&events, &event);
            }
        });

        let mut status = self.transport.status();
        let events = self.events.clone();
        let status_relay = tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let current = *status.borrow();
                let _ = events.send(ClientEvent::ConnectionChanged(current));
            }
        });

        // Eventually-consistent pull, independent of the push path: local
        // unread arithmetic is only trusted until the next resync.
        let conversations = Arc::clone(&self.conversations);
        let period = self.config.list_resync_period;
        let resync = tokio::spawn(async move {
            loop {
                sleep(period).await;
                if let Err(err) = conversations.refresh().await {
                    warn!(error = %err, "scheduled conversation resync failed");
                }
            }
        });

        *self.background.lock().expect("lock") = vec![pump, status_relay, resync];
        info!(user = self.viewer.user_id.0, "sync client started");
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn conversations(&self) -> &Arc<ConversationList> {
        &self.conversations
    }

    pub fn uploader(&self) -> &MediaUploader {
        &self.uploader
    }

    pub fn is_degraded(&self) -> bool {
        self.transport.is_degraded()
    }

    /// Fetch history, subscribe the conversation topic, and wire the event
    /// pump. Everything the returned handle owns is released on drop.
    pub async fn open_conversation(
        &self,
        conversation: ConversationId,
    ) -> Result<ConversationHandle, ClientError> {
        let page = self
            .api
            .fetch_timeline(conversation, self.config.history_page_size, None)
            .await?;
        let topic = page.topic.clone();

        let api = self.api.clone() as Arc<dyn ConversationApi>;
        let timeline = Arc::new(Timeline::new(
            Arc::clone(&api),
            self.viewer,
            conversation,
            page,
            self.config.read_sync_debounce,
            self.config.history_page_size,
        ));
        let tracker = TypingTracker::new(self.config.typing_expiry);
        let signaler =
            TypingSignaler::new(Arc::clone(&api), conversation, self.config.typing_throttle);
        let presence =
            PresenceBeacon::start(Arc::clone(&api), conversation, self.config.heartbeat_period);

        let mut subscription = self.transport.subscribe(topic).await?;
        self.conversations.set_active(conversation).await;

        let pump = {
            let timeline = Arc::clone(&timeline);
            let tracker = tracker.clone();
            let conversations = Arc::clone(&self.conversations);
            tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    if let RealtimeEvent::Typing {
                        actor,
                        is_typing,
                        is_recording,
                        ..
                    } = &event
                    {
                        tracker.apply(actor, *is_typing, *is_recording);
                        continue;
                    }
                    timeline.apply_remote(&event).await;
                    conversations.apply_remote(&event).await;
                }
            })
        };

        Ok(ConversationHandle {
            conversation,
            timeline,
            tracker,
            signaler,
            presence,
            pump,
            conversations: Arc::clone(&self.conversations),
            uploader: self.uploader.clone(),
        })
    }

}

impl Drop for SyncClient {
    fn drop(&mut self) {
        for task in self.background.lock().expect("lock").drain(..) {
            task.abort();
        }
    }
}

fn emit_shell_event(events: &broadcast::Sender<ClientEvent>, event: &RealtimeEvent) {
    match event {
        RealtimeEvent::NewNotification {
            title,
            body,
            conversation_id,
        } => {
            let _ = events.send(ClientEvent::Notification {
                title: title.clone(),
                body: body.clone(),
                conversation_id: *conversation_id,
            });
        }
        RealtimeEvent::ViewerCount {
            conversation_id,
            count,
        } => {
            let _ = events.send(ClientEvent::ViewerCount {
                conversation_id: *conversation_id,
                count: *count,
            });
        }
        RealtimeEvent::LiveEnded { conversation_id } => {
            let _ = events.send(ClientEvent::LiveEnded {
                conversation_id: *conversation_id,
            });
        }
        _ => {}
    }
}

/// One open conversation screen: timeline, typing signals, presence.
pub struct ConversationHandle {
    conversation: ConversationId,
    timeline: Arc<Timeline>,
    tracker: TypingTracker,
    signaler: TypingSignaler,
    presence: PresenceBeacon,
    pump: JoinHandle<()>,
    conversations: Arc<ConversationList>,
    uploader: MediaUploader,
}

impl ConversationHandle {
    pub fn conversation(&self) -> ConversationId {
        self.conversation
    }

    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    pub fn typing(&self) -> &TypingTracker {
        &self.tracker
    }

    pub fn signaler(&self) -> &TypingSignaler {
        &self.signaler
    }

    /// Mirror document visibility into the presence beacon.
    pub fn set_visible(&self, visible: bool) {
        self.presence.set_visible(visible);
    }

    /// Advance the read cursor and clear the list badge together.
    pub async fn mark_read(&self, up_to: MessageId) {
        self.timeline.mark_read(up_to).await;
        self.conversations.mark_read_local(self.conversation).await;
    }

    /// Validate and start an attachment upload. Progress and cancellation
    /// live on the returned handle; feed its result to [`send_uploaded`].
    ///
    /// [`send_uploaded`]: ConversationHandle::send_uploaded
    pub fn begin_upload(&self, upload: MediaUpload) -> Result<UploadHandle, UploadError> {
        self.uploader.begin(upload)
    }

    /// Send a completed upload on this timeline as an optimistic media
    /// message.
    pub async fn send_uploaded(
        &self,
        kind: MessageKind,
        media: MediaRef,
        reply_to: Option<ReplyPreview>,
    ) -> Result<MessageKey, ClientError> {
        let body = MessageBody::media(kind, media)
            .ok_or(ClientError::Unsupported("text as an attachment"))?;
        self.timeline.send_media(body, reply_to).await
    }
}

impl Drop for ConversationHandle {
    fn drop(&mut self) {
        // Aborting the pump drops the topic subscription, releasing its
        // reference count; the presence beacon fires its own leave.
        self.pump.abort();
        let conversations = Arc::clone(&self.conversations);
        let conversation = self.conversation;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                conversations.clear_active(conversation).await;
            });
        }
    }
}
