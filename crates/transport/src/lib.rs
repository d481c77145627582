//! Push-transport connection shared by every conversation surface.
//!
//! One [`Transport`] is constructed at application start and handed by
//! reference to each screen. Topic subscriptions are reference-counted
//! inside a single supervisor task: two screens watching the same topic
//! share one wire subscription, and the wire unsubscribe goes out only when
//! the last [`Subscription`] handle is dropped. After a connection loss the
//! supervisor re-dials on a fixed cadence and replays the subscribe frame
//! for every topic that still has live handles.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use shared::protocol::{RealtimeEvent, TransportCommand, TransportFrame};

/// Delay between re-dial attempts. Deliberately flat: backoff policy belongs
/// to the connection layer below us, this loop only restores subscriptions.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const EVENT_BUFFER: usize = 1024;
const OUTBOUND_BUFFER: usize = 64;
const INBOUND_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to establish push connection: {0}")]
    Connect(String),
    #[error("transport supervisor is no longer running")]
    Closed,
}

/// Live connection state, observable by any screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No live connection; local state keeps serving, no push updates.
    Degraded,
    Connected,
}

impl ConnectionStatus {
    pub fn is_degraded(self) -> bool {
        matches!(self, ConnectionStatus::Degraded)
    }
}

/// An established push session: frames out, frames in. The inbound receiver
/// closing signals the session died.
pub struct ConnectorSession {
    pub outbound: mpsc::Sender<TransportCommand>,
    pub inbound: mpsc::Receiver<TransportFrame>,
}

/// Seam over the concrete push provider so the supervisor can be exercised
/// with scripted sessions in tests.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<ConnectorSession, TransportError>;
}

/// Websocket-backed connector speaking JSON frames.
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<ConnectorSession, TransportError> {
        let mut url = self.url.clone();
        // Fresh socket identity per dial so the provider can distinguish
        // reconnects from duplicate connections.
        url.query_pairs_mut()
            .append_pair("socket_id", &Uuid::new_v4().to_string());

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (mut sink, mut stream) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<TransportCommand>(OUTBOUND_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<TransportFrame>(INBOUND_BUFFER);

        tokio::spawn(async move {
            while let Some(command) = out_rx.recv().await {
                let text = match serde_json::to_string(&command) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode transport command");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<TransportFrame>(&text)
                    {
                        Ok(frame) => {
                            if in_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "discarding undecodable push frame");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "websocket receive failed");
                        break;
                    }
                }
            }
        });

        Ok(ConnectorSession {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

enum Command {
    Subscribe {
        topic: String,
        reply: oneshot::Sender<broadcast::Receiver<RealtimeEvent>>,
    },
    Release {
        topic: String,
    },
}

/// Frames and lifecycle notices from the active session's forwarder task,
/// tagged with the session epoch so a stale session cannot confuse the
/// supervisor after a reconnect.
enum SessionMsg {
    Frame(u64, TransportFrame),
    Closed(u64),
}

struct TopicEntry {
    refcount: usize,
    events: broadcast::Sender<RealtimeEvent>,
}

/// Handle to the shared push connection. Cheap to clone; all clones talk to
/// the same supervisor task, so the process holds exactly one connection no
/// matter how many screens are open.
#[derive(Clone)]
pub struct Transport {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl Transport {
    pub fn spawn(connector: impl Connector) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Degraded);
        tokio::spawn(supervisor(Arc::new(connector), cmd_rx, status_tx));
        Self { cmd_tx, status_rx }
    }

    /// Subscribe to a topic, sharing any existing wire subscription for it.
    pub async fn subscribe(&self, topic: impl Into<String>) -> Result<Subscription, TransportError> {
        let topic = topic.into();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe {
                topic: topic.clone(),
                reply: reply_tx,
            })
            .map_err(|_| TransportError::Closed)?;
        let events = reply_rx.await.map_err(|_| TransportError::Closed)?;
        Ok(Subscription {
            topic,
            events,
            release: self.cmd_tx.clone(),
        })
    }

    /// Watch connection state transitions (degraded ↔ connected).
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.status_rx.borrow().is_degraded()
    }
}

/// Owned subscription to one topic. Dropping the handle releases its
/// reference; the wire unsubscribe happens when the last handle goes.
pub struct Subscription {
    topic: String,
    events: broadcast::Receiver<RealtimeEvent>,
    release: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next event on this topic, or `None` once the transport shuts down.
    /// A lagged receiver skips ahead rather than erroring: the transport is
    /// at-least-once anyway and the timeline merge absorbs gaps on reload.
    pub async fn recv(&mut self) -> Option<RealtimeEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "subscription lagged, skipping");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.release.send(Command::Release {
            topic: self.topic.clone(),
        });
    }
}

async fn supervisor(
    connector: Arc<dyn Connector>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<ConnectionStatus>,
) {
    let mut topics: HashMap<String, TopicEntry> = HashMap::new();
    let mut outbound: Option<mpsc::Sender<TransportCommand>> = None;
    let mut epoch: u64 = 0;
    let mut connecting = false;

    let (session_tx, mut session_rx) = mpsc::channel::<ConnectorSession>(1);
    let (msg_tx, mut msg_rx) = mpsc::channel::<SessionMsg>(INBOUND_BUFFER);

    spawn_dial(Arc::clone(&connector), session_tx.clone(), &mut connecting);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    // Every handle and subscription dropped.
                    break;
                };
                match cmd {
                    Command::Subscribe { topic, reply } => {
                        let entry = topics.entry(topic.clone()).or_insert_with(|| TopicEntry {
                            refcount: 0,
                            events: broadcast::channel(EVENT_BUFFER).0,
                        });
                        entry.refcount += 1;
                        let _ = reply.send(entry.events.subscribe());
                        if entry.refcount == 1 {
                            if let Some(wire) = outbound.as_ref() {
                                send_subscribe(wire, &topic).await;
                            }
                        } else {
                            debug!(topic = %topic, refcount = entry.refcount, "sharing existing subscription");
                        }
                    }
                    Command::Release { topic } => {
                        let remove = match topics.get_mut(&topic) {
                            Some(entry) => {
                                entry.refcount = entry.refcount.saturating_sub(1);
                                entry.refcount == 0
                            }
                            None => false,
                        };
                        if remove {
                            topics.remove(&topic);
                            if let Some(wire) = outbound.as_ref() {
                                let _ = wire
                                    .send(TransportCommand::Unsubscribe { topic: topic.clone() })
                                    .await;
                            }
                            debug!(topic = %topic, "released last subscription");
                        }
                    }
                }
            }
            session = session_rx.recv() => {
                let Some(session) = session else { break };
                connecting = false;
                epoch += 1;
                info!(topics = topics.len(), "push connection established");
                for topic in topics.keys() {
                    send_subscribe(&session.outbound, topic).await;
                }
                outbound = Some(session.outbound);
                tokio::spawn(forward_session(session.inbound, epoch, msg_tx.clone()));
                let _ = status_tx.send(ConnectionStatus::Connected);
            }
            msg = msg_rx.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    SessionMsg::Frame(frame_epoch, frame) => {
                        if frame_epoch != epoch {
                            continue;
                        }
                        if let Some(entry) = topics.get(&frame.topic) {
                            let _ = entry.events.send(frame.event);
                        } else {
                            debug!(topic = %frame.topic, "dropping frame for unsubscribed topic");
                        }
                    }
                    SessionMsg::Closed(closed_epoch) => {
                        if closed_epoch != epoch {
                            continue;
                        }
                        warn!("push connection lost, serving local state only");
                        outbound = None;
                        let _ = status_tx.send(ConnectionStatus::Degraded);
                        spawn_dial(Arc::clone(&connector), session_tx.clone(), &mut connecting);
                    }
                }
            }
        }
    }
}

async fn forward_session(
    mut inbound: mpsc::Receiver<TransportFrame>,
    epoch: u64,
    msg_tx: mpsc::Sender<SessionMsg>,
) {
    while let Some(frame) = inbound.recv().await {
        if msg_tx.send(SessionMsg::Frame(epoch, frame)).await.is_err() {
            return;
        }
    }
    let _ = msg_tx.send(SessionMsg::Closed(epoch)).await;
}

/// Kick off a dial task unless one is already running. The task retries on
/// a flat cadence until it lands a session, then hands it to the supervisor.
fn spawn_dial(
    connector: Arc<dyn Connector>,
    session_tx: mpsc::Sender<ConnectorSession>,
    connecting: &mut bool,
) {
    if *connecting {
        return;
    }
    *connecting = true;
    tokio::spawn(async move {
        loop {
            match connector.connect().await {
                Ok(session) => {
                    let _ = session_tx.send(session).await;
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "push dial failed, retrying");
                    sleep(RECONNECT_DELAY).await;
                }
            }
        }
    });
}

async fn send_subscribe(wire: &mpsc::Sender<TransportCommand>, topic: &str) {
    if wire
        .send(TransportCommand::Subscribe {
            topic: topic.to_string(),
        })
        .await
        .is_err()
    {
        warn!(topic = %topic, "failed to queue subscribe frame");
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
