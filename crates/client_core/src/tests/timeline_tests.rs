use super::*;

use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::Mutex as SyncMutex;

use async_trait::async_trait;
use chrono::TimeZone;

use shared::domain::{ConversationKind, MemberRole, UserId};
use shared::error::{ApiException, ErrorCode};
use shared::protocol::{ConversationSummary, MediaRef};

use crate::api::{ConversationApi, TimelinePage};

const VIEWER: Viewer = Viewer {
    user_id: UserId(1),
    is_staff: false,
};
const COUNTERPART: UserId = UserId(2);
const CONV: ConversationId = ConversationId(7);

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("timestamp")
}

fn actor(user: UserId, name: &str) -> ActorSummary {
    ActorSummary {
        user_id: user,
        display_name: name.into(),
        role: None,
    }
}

fn text_payload(id: i64, sender: UserId, text: &str, sent: i64) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        conversation_id: CONV,
        sender: actor(sender, if sender == VIEWER.user_id { "me" } else { "ana" }),
        body: MessageBody::Text { text: text.into() },
        reply_to: None,
        pinned: false,
        edited: false,
        sent_at: at(sent),
    }
}

fn new_message(payload: MessagePayload) -> RealtimeEvent {
    RealtimeEvent::NewMessage { message: payload }
}

fn state_with_kind(kind: ConversationKind) -> TimelineState {
    TimelineState::new(CONV, kind, VIEWER)
}

fn state() -> TimelineState {
    state_with_kind(ConversationKind::Support)
}

fn server_ids(state: &TimelineState) -> Vec<i64> {
    state
        .messages()
        .iter()
        .filter_map(|m| m.server_id())
        .map(|id| id.0)
        .collect()
}

#[test]
fn applying_the_same_event_twice_is_a_no_op() {
    let mut state = state();
    let event = new_message(text_payload(42, COUNTERPART, "x", 10));

    assert!(matches!(
        state.apply_remote(&event),
        MergeOutcome::Appended(_)
    ));
    assert_eq!(state.apply_remote(&event), MergeOutcome::Duplicate);

    assert_eq!(state.messages().len(), 1);
    assert_eq!(server_ids(&state), vec![42]);
    assert_eq!(state.unread(), 1);
}

#[test]
fn echo_before_http_reconciles_the_optimistic_entry() {
    let mut state = state();
    let local = state.begin_send(Draft {
        body: MessageBody::Text { text: "hi".into() },
        reply_to: None,
    });
    assert_eq!(state.messages().len(), 1);
    assert_eq!(state.messages()[0].status, MessageStatus::Sending);

    let echo = new_message(text_payload(50, VIEWER.user_id, "hi", 20));
    assert_eq!(
        state.apply_remote(&echo),
        MergeOutcome::Reconciled(MessageKey::Server(MessageId(50)))
    );
    assert_eq!(state.messages().len(), 1);
    assert_eq!(state.messages()[0].status, MessageStatus::Sent);

    // The late HTTP resolution must not duplicate or move anything.
    let key = state.resolve_send(local, MessageId(50), at(20));
    assert_eq!(key, MessageKey::Server(MessageId(50)));
    assert_eq!(state.messages().len(), 1);

    // And a redelivered echo is a plain duplicate now.
    assert_eq!(state.apply_remote(&echo), MergeOutcome::Duplicate);
    assert_eq!(state.messages().len(), 1);
}

#[test]
fn http_before_echo_reconciles_then_dedupes() {
    let mut state = state();
    let local = state.begin_send(Draft {
        body: MessageBody::Text { text: "hi".into() },
        reply_to: None,
    });
    let key = state.resolve_send(local, MessageId(50), at(20));
    assert_eq!(key, MessageKey::Server(MessageId(50)));
    assert_eq!(state.messages()[0].status, MessageStatus::Sent);

    let echo = new_message(text_payload(50, VIEWER.user_id, "hi", 20));
    assert_eq!(state.apply_remote(&echo), MergeOutcome::Duplicate);
    assert_eq!(state.messages().len(), 1);
}

#[test]
fn rapid_sends_reconcile_fifo_per_fingerprint() {
    let mut state = state();
    let first = state.begin_send(Draft {
        body: MessageBody::Text { text: "one".into() },
        reply_to: None,
    });
    let second = state.begin_send(Draft {
        body: MessageBody::Text { text: "two".into() },
        reply_to: None,
    });

    // Echoes can land out of submission order; content pairs them up.
    let echo_two = new_message(text_payload(61, VIEWER.user_id, "two", 21));
    assert!(matches!(
        state.apply_remote(&echo_two),
        MergeOutcome::Reconciled(_)
    ));
    let echo_one = new_message(text_payload(60, VIEWER.user_id, "one", 20));
    assert!(matches!(
        state.apply_remote(&echo_one),
        MergeOutcome::Reconciled(_)
    ));

    assert_eq!(state.messages().len(), 2);
    assert_eq!(server_ids(&state), vec![60, 61]);
    // HTTP resolutions afterwards stay no-ops.
    state.resolve_send(first, MessageId(60), at(20));
    state.resolve_send(second, MessageId(61), at(21));
    assert_eq!(state.messages().len(), 2);
}

#[test]
fn identical_drafts_consume_the_oldest_pending_first() {
    let mut state = state();
    let first = state.begin_send(Draft {
        body: MessageBody::Text { text: "x".into() },
        reply_to: None,
    });
    let _second = state.begin_send(Draft {
        body: MessageBody::Text { text: "x".into() },
        reply_to: None,
    });

    let echo = new_message(text_payload(70, VIEWER.user_id, "x", 30));
    assert!(matches!(
        state.apply_remote(&echo),
        MergeOutcome::Reconciled(_)
    ));
    // The first submission took the first echo.
    assert_eq!(state.messages()[0].key, MessageKey::Server(MessageId(70)));
    assert!(matches!(state.messages()[1].key, MessageKey::Local(_)));

    let key = state.resolve_send(first, MessageId(70), at(30));
    assert_eq!(key, MessageKey::Server(MessageId(70)));
    assert_eq!(state.messages().len(), 2);
}

#[test]
fn unrelated_events_merge_in_either_order_without_loss() {
    let e1 = new_message(text_payload(101, COUNTERPART, "a", 10));
    let e2 = new_message(text_payload(102, COUNTERPART, "b", 11));

    let mut forward = state();
    forward.apply_remote(&e1);
    forward.apply_remote(&e2);

    let mut backward = state();
    backward.apply_remote(&e2);
    backward.apply_remote(&e1);

    let mut forward_ids = server_ids(&forward);
    let mut backward_ids = server_ids(&backward);
    forward_ids.sort_unstable();
    backward_ids.sort_unstable();
    assert_eq!(forward_ids, vec![101, 102]);
    assert_eq!(backward_ids, vec![101, 102]);
    assert_eq!(forward.unread(), 2);
    assert_eq!(backward.unread(), 2);
}

#[test]
fn unread_counts_counterpart_messages_past_the_cursor_only() {
    let mut state = state();
    state.hydrate(
        vec![
            text_payload(1, COUNTERPART, "a", 1),
            text_payload(2, VIEWER.user_id, "b", 2),
            text_payload(3, COUNTERPART, "c", 3),
        ],
        Some(MessageId(1)),
    );
    assert_eq!(state.unread(), 1);

    // Own sends never count.
    state.begin_send(Draft {
        body: MessageBody::Text { text: "d".into() },
        reply_to: None,
    });
    assert_eq!(state.unread(), 1);

    state.apply_remote(&new_message(text_payload(4, COUNTERPART, "e", 4)));
    assert_eq!(state.unread(), 2);

    // Backward marks are no-ops; forward marks clamp to zero, never below.
    assert_eq!(state.mark_read(MessageId(1)), None);
    assert_eq!(state.mark_read(MessageId(4)), Some(MessageId(4)));
    assert_eq!(state.unread(), 0);
    assert_eq!(state.mark_read(MessageId(4)), None);
    assert_eq!(state.unread(), 0);
}

#[test]
fn pin_moves_pinned_first_then_newest_first() {
    let mut state = state_with_kind(ConversationKind::Channel);
    state.hydrate(
        vec![
            text_payload(11, COUNTERPART, "A", 1),
            text_payload(12, COUNTERPART, "B", 2),
            text_payload(13, COUNTERPART, "C", 0),
        ],
        None,
    );

    let (id, pinned) = state
        .toggle_pin(MessageKey::Server(MessageId(13)))
        .expect("pin C");
    assert!(pinned);
    assert_eq!(id, MessageId(13));
    assert_eq!(server_ids(&state), vec![13, 12, 11]);

    let (_, pinned) = state
        .toggle_pin(MessageKey::Server(MessageId(13)))
        .expect("unpin C");
    assert!(!pinned);
    assert_eq!(server_ids(&state), vec![12, 11, 13]);
}

#[test]
fn remote_pin_event_reorders_and_is_idempotent() {
    let mut state = state_with_kind(ConversationKind::Channel);
    state.hydrate(
        vec![
            text_payload(11, COUNTERPART, "A", 1),
            text_payload(12, COUNTERPART, "B", 2),
        ],
        None,
    );
    let event = RealtimeEvent::PostPinned {
        conversation_id: CONV,
        message_id: MessageId(11),
        pinned: true,
    };
    assert_eq!(state.apply_remote(&event), MergeOutcome::Reordered);
    assert_eq!(server_ids(&state), vec![11, 12]);
    assert_eq!(state.apply_remote(&event), MergeOutcome::Duplicate);
    assert_eq!(server_ids(&state), vec![11, 12]);
}

#[test]
fn pin_events_are_ignored_outside_channels() {
    let mut state = state();
    state.hydrate(vec![text_payload(11, COUNTERPART, "A", 1)], None);
    let event = RealtimeEvent::PostPinned {
        conversation_id: CONV,
        message_id: MessageId(11),
        pinned: true,
    };
    assert_eq!(state.apply_remote(&event), MergeOutcome::Ignored);
}

#[test]
fn reply_snapshot_survives_target_deletion() {
    let mut state = state();
    state.apply_remote(&new_message(text_payload(20, COUNTERPART, "hello", 5)));

    let snapshot = state
        .reply_snapshot(MessageKey::Server(MessageId(20)))
        .expect("snapshot");
    assert_eq!(snapshot.excerpt, "hello");
    assert_eq!(snapshot.sender_name, "ana");

    let local = state.begin_send(Draft {
        body: MessageBody::Text { text: "hi!".into() },
        reply_to: Some(snapshot),
    });

    state.apply_remote(&RealtimeEvent::MessageDeleted {
        conversation_id: CONV,
        message_id: MessageId(20),
    });
    assert!(state.get(MessageKey::Server(MessageId(20))).is_none());

    let reply = state
        .get(MessageKey::Local(local))
        .and_then(|m| m.reply_to.as_ref())
        .expect("reply preview");
    assert_eq!(reply.excerpt, "hello");
}

#[test]
fn remote_edit_mutates_in_place_and_sets_the_flag() {
    let mut state = state();
    state.hydrate(
        vec![
            text_payload(30, COUNTERPART, "before", 1),
            text_payload(31, COUNTERPART, "next", 2),
        ],
        None,
    );
    let event = RealtimeEvent::MessageEdited {
        conversation_id: CONV,
        message_id: MessageId(30),
        body: MessageBody::Text {
            text: "after".into(),
        },
        edited_at: at(3),
    };
    state.apply_remote(&event);

    assert_eq!(server_ids(&state), vec![30, 31], "position unchanged");
    let edited = state.get(MessageKey::Server(MessageId(30))).expect("entry");
    assert!(edited.edited);
    assert_eq!(
        edited.body,
        MessageBody::Text {
            text: "after".into()
        }
    );
}

#[test]
fn reaction_events_replace_the_tally_wholesale() {
    let mut state = state();
    state.hydrate(vec![text_payload(40, COUNTERPART, "m", 1)], None);
    let key = MessageKey::Server(MessageId(40));

    state.bump_reaction(key, "👍").expect("local bump");
    assert_eq!(state.get(key).expect("entry").reactions.get("👍"), Some(&1));

    let mut tally = std::collections::BTreeMap::new();
    tally.insert("🔥".to_string(), 3);
    state.apply_remote(&RealtimeEvent::ReactionUpdated {
        conversation_id: CONV,
        message_id: MessageId(40),
        reactions: tally.clone(),
    });
    assert_eq!(state.get(key).expect("entry").reactions, tally);
}

#[test]
fn counterpart_read_receipt_advances_own_statuses() {
    let mut state = state();
    state.hydrate(
        vec![
            text_payload(50, VIEWER.user_id, "a", 1),
            text_payload(51, VIEWER.user_id, "b", 2),
        ],
        None,
    );
    let event = RealtimeEvent::MessagesRead {
        conversation_id: CONV,
        reader_id: COUNTERPART,
        up_to_message_id: MessageId(50),
    };
    assert_eq!(state.apply_remote(&event), MergeOutcome::ReadAdvanced);
    assert_eq!(
        state
            .get(MessageKey::Server(MessageId(50)))
            .expect("entry")
            .status,
        MessageStatus::Read
    );
    assert_eq!(
        state
            .get(MessageKey::Server(MessageId(51)))
            .expect("entry")
            .status,
        MessageStatus::Sent
    );
    assert_eq!(state.apply_remote(&event), MergeOutcome::Duplicate);
}

#[test]
fn own_device_read_receipt_advances_the_cursor() {
    let mut state = state();
    state.hydrate(
        vec![
            text_payload(60, COUNTERPART, "a", 1),
            text_payload(61, COUNTERPART, "b", 2),
        ],
        None,
    );
    assert_eq!(state.unread(), 2);
    let event = RealtimeEvent::MessagesRead {
        conversation_id: CONV,
        reader_id: VIEWER.user_id,
        up_to_message_id: MessageId(61),
    };
    assert_eq!(state.apply_remote(&event), MergeOutcome::ReadAdvanced);
    assert_eq!(state.unread(), 0);
    assert_eq!(state.apply_remote(&event), MergeOutcome::Duplicate);
}

#[test]
fn teammate_roles_resolve_for_staff_viewers() {
    let staff_viewer = Viewer {
        user_id: UserId(1),
        is_staff: true,
    };
    let mut state = TimelineState::new(CONV, ConversationKind::TeamGroup, staff_viewer);
    let mut teammate = text_payload(70, UserId(3), "hey", 1);
    teammate.sender.role = Some(MemberRole::Agent);
    let customer = text_payload(71, UserId(4), "hi", 2);
    state.hydrate(vec![teammate, customer], None);

    assert_eq!(
        state
            .get(MessageKey::Server(MessageId(70)))
            .expect("entry")
            .sender_role,
        SenderRole::Teammate
    );
    assert_eq!(
        state
            .get(MessageKey::Server(MessageId(71)))
            .expect("entry")
            .sender_role,
        SenderRole::Counterpart
    );
}

#[test]
fn prepending_history_skips_overlap() {
    let mut state = state();
    state.hydrate(
        vec![
            text_payload(80, COUNTERPART, "c", 3),
            text_payload(81, COUNTERPART, "d", 4),
        ],
        None,
    );
    let added = state.prepend_history(vec![
        text_payload(78, COUNTERPART, "a", 1),
        text_payload(79, COUNTERPART, "b", 2),
        text_payload(80, COUNTERPART, "c", 3),
    ]);
    assert_eq!(added, 2);
    assert_eq!(server_ids(&state), vec![78, 79, 80, 81]);
    assert_eq!(state.oldest_server_id(), Some(MessageId(78)));
}

#[test]
fn rehydrate_keeps_unresolved_optimistic_entries() {
    let mut state = state();
    state.hydrate(vec![text_payload(90, COUNTERPART, "a", 1)], None);
    let local = state.begin_send(Draft {
        body: MessageBody::Text {
            text: "draft".into(),
        },
        reply_to: None,
    });

    state.rehydrate(
        vec![
            text_payload(90, COUNTERPART, "a", 1),
            text_payload(91, COUNTERPART, "b", 2),
        ],
        None,
    );
    assert_eq!(state.messages().len(), 3);
    assert!(state.get(MessageKey::Local(local)).is_some());

    // The kept entry still reconciles against its echo.
    let echo = new_message(text_payload(92, VIEWER.user_id, "draft", 3));
    assert!(matches!(
        state.apply_remote(&echo),
        MergeOutcome::Reconciled(_)
    ));
}

#[test]
fn deleting_a_local_entry_needs_no_server_call() {
    let mut state = state();
    let local = state.begin_send(Draft {
        body: MessageBody::Text { text: "oops".into() },
        reply_to: None,
    });
    assert_eq!(state.delete_local(MessageKey::Local(local)), Some(None));
    assert!(state.messages().is_empty());

    // Its echo no longer matches anything pending and appends as a
    // separate self message.
    let echo = new_message(text_payload(95, VIEWER.user_id, "oops", 1));
    assert!(matches!(
        state.apply_remote(&echo),
        MergeOutcome::Appended(_)
    ));
}

// ---------------------------------------------------------------------------
// Async shell: optimistic send lifecycle against a scripted collaborator.
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeApi {
    post_results: SyncMutex<VecDeque<Result<PostMessageResponse, ()>>>,
    /// When set, `post_message` parks until the test releases it, so a
    /// transport echo can be injected mid-flight.
    post_gate: SyncMutex<Option<tokio::sync::oneshot::Receiver<()>>>,
    pages: SyncMutex<VecDeque<TimelinePage>>,
    read_marks: SyncMutex<Vec<(ConversationId, MessageId)>>,
    fetches: AtomicUsize,
}

impl FakeApi {
    fn scripted(posts: Vec<Result<PostMessageResponse, ()>>) -> Arc<Self> {
        let api = Self::default();
        *api.post_results.lock().expect("lock") = posts.into_iter().collect();
        Arc::new(api)
    }

    fn queue_page(&self, page: TimelinePage) {
        self.pages.lock().expect("lock").push_back(page);
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

fn empty_page() -> TimelinePage {
    TimelinePage {
        kind: ConversationKind::Support,
        messages: Vec::new(),
        topic: "conversation.7".into(),
        read_cursor: None,
    }
}

fn scripted_failure() -> ClientError {
    ClientError::Api(ApiException::new(ErrorCode::Internal, "scripted failure"))
}

#[async_trait]
impl ConversationApi for FakeApi {
    async fn fetch_timeline(
        &self,
        _conversation: ConversationId,
        _limit: u32,
        _before: Option<MessageId>,
    ) -> Result<TimelinePage, ClientError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .pages
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(empty_page))
    }

    async fn post_message(
        &self,
        _conversation: ConversationId,
        _message: &OutgoingMessage,
    ) -> Result<PostMessageResponse, ClientError> {
        let gate = self.post_gate.lock().expect("lock").take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        match self.post_results.lock().expect("lock").pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(())) | None => Err(scripted_failure()),
        }
    }

    async fn edit_message(
        &self,
        _conversation: ConversationId,
        _message: MessageId,
        _body: &MessageBody,
    ) -> Result<(), ClientError> {
        Err(scripted_failure())
    }

    async fn delete_message(
        &self,
        _conversation: ConversationId,
        _message: MessageId,
    ) -> Result<(), ClientError> {
        Ok(())
    }

    async fn set_pinned(
        &self,
        _conversation: ConversationId,
        _message: MessageId,
        _pinned: bool,
    ) -> Result<(), ClientError> {
        Ok(())
    }

    async fn toggle_reaction(
        &self,
        _conversation: ConversationId,
        _message: MessageId,
        _emoji: &str,
    ) -> Result<(), ClientError> {
        Ok(())
    }

    async fn mark_read(
        &self,
        conversation: ConversationId,
        up_to: MessageId,
    ) -> Result<(), ClientError> {
        self.read_marks
            .lock()
            .expect("lock")
            .push((conversation, up_to));
        Ok(())
    }

    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>, ClientError> {
        Ok(Vec::new())
    }

    async fn send_typing(
        &self,
        _conversation: ConversationId,
        _is_typing: bool,
        _is_recording: bool,
    ) -> Result<(), ClientError> {
        Ok(())
    }

    async fn presence_ping(&self, _conversation: ConversationId) -> Result<(), ClientError> {
        Ok(())
    }

    async fn presence_leave(&self, _conversation: ConversationId) -> Result<(), ClientError> {
        Ok(())
    }
}

fn timeline_with(api: Arc<FakeApi>) -> Timeline {
    Timeline::new(
        api,
        VIEWER,
        CONV,
        empty_page(),
        Duration::from_millis(200),
        50,
    )
}

#[tokio::test]
async fn send_fail_retry_roundtrip() {
    let api = FakeApi::scripted(vec![
        Err(()),
        Ok(PostMessageResponse {
            message_id: MessageId(99),
            sent_at: at(10),
        }),
    ]);
    let timeline = timeline_with(Arc::clone(&api));

    let err = timeline
        .send_text("hi", None)
        .await
        .expect_err("first attempt fails");
    assert!(matches!(err, ClientError::Api(_)));

    let snapshot = timeline.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].status, MessageStatus::Failed);
    let failed_key = snapshot[0].key;

    let key = timeline.retry(failed_key).await.expect("retry succeeds");
    assert_eq!(key, MessageKey::Server(MessageId(99)));

    let snapshot = timeline.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].status, MessageStatus::Sent);
    assert_eq!(
        snapshot[0].body,
        MessageBody::Text { text: "hi".into() },
        "retry re-sends the same content"
    );
}

#[tokio::test]
async fn failed_media_send_removes_the_entry() {
    let api = FakeApi::scripted(vec![Err(())]);
    let timeline = timeline_with(api);

    let body = MessageBody::Image {
        media: MediaRef {
            url: "https://cdn.example/a.jpg".into(),
            mime_type: "image/jpeg".into(),
            size_bytes: 10,
        },
    };
    timeline
        .send_media(body, None)
        .await
        .expect_err("media send fails");
    assert!(timeline.snapshot().await.is_empty());
}

#[tokio::test]
async fn failed_edit_reloads_from_the_server() {
    let api = FakeApi::scripted(Vec::new());
    api.queue_page(TimelinePage {
        kind: ConversationKind::Support,
        messages: vec![text_payload(5, COUNTERPART, "server truth", 1)],
        topic: "conversation.7".into(),
        read_cursor: None,
    });
    let timeline = Timeline::new(
        Arc::clone(&api) as Arc<dyn ConversationApi>,
        VIEWER,
        CONV,
        TimelinePage {
            kind: ConversationKind::Support,
            messages: vec![text_payload(5, COUNTERPART, "original", 1)],
            topic: "conversation.7".into(),
            read_cursor: None,
        },
        Duration::from_millis(200),
        50,
    );

    // FakeApi always rejects edits; the local optimistic edit must be
    // rolled back by the reload rather than patched in place.
    timeline
        .edit(MessageKey::Server(MessageId(5)), "changed".into())
        .await
        .expect_err("edit fails");

    assert_eq!(api.fetch_count(), 1, "timeline refetched once");
    let snapshot = timeline.snapshot().await;
    assert_eq!(
        snapshot[0].body,
        MessageBody::Text {
            text: "server truth".into()
        }
    );
    assert!(!snapshot[0].edited);
}

#[tokio::test(start_paused = true)]
async fn read_cursor_sync_is_debounced_to_the_latest_value() {
    let api = FakeApi::scripted(Vec::new());
    let timeline = timeline_with(Arc::clone(&api));

    timeline.mark_read(MessageId(5)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    timeline.mark_read(MessageId(9)).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    let marks = api.read_marks.lock().expect("lock").clone();
    assert_eq!(marks, vec![(CONV, MessageId(9))], "only the latest cursor syncs");

    // Redundant marks schedule nothing new.
    timeline.mark_read(MessageId(9)).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(api.read_marks.lock().expect("lock").len(), 1);
}

#[tokio::test]
async fn echo_winning_the_race_turns_an_http_error_into_success() {
    // Empty script: the HTTP send will fail once the gate opens. The echo
    // lands first, so the failure must not mark the message failed.
    let api = FakeApi::scripted(Vec::new());
    let (release, gate) = tokio::sync::oneshot::channel();
    *api.post_gate.lock().expect("lock") = Some(gate);
    let timeline = Arc::new(timeline_with(Arc::clone(&api)));

    let send_task = tokio::spawn({
        let timeline = Arc::clone(&timeline);
        async move { timeline.send_text("raced", None).await }
    });
    while timeline.snapshot().await.is_empty() {
        tokio::task::yield_now().await;
    }

    let merge = timeline
        .apply_remote(&new_message(text_payload(77, VIEWER.user_id, "raced", 9)))
        .await;
    assert!(matches!(merge, MergeOutcome::Reconciled(_)));

    release.send(()).expect("open the gate");
    let send_result = send_task.await.expect("join send task");
    assert_eq!(
        send_result.expect("send succeeds via echo"),
        MessageKey::Server(MessageId(77))
    );
    let snapshot = timeline.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].status, MessageStatus::Sent);
}
