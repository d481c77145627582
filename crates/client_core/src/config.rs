use std::time::Duration;

/// Client tunables. Defaults are the production values; individual fields
/// can be overridden from the environment for staging builds.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the persistence API.
    pub api_url: String,
    /// Websocket URL of the push provider.
    pub push_url: String,
    /// Presence heartbeat period while a conversation is visible.
    pub heartbeat_period: Duration,
    /// Minimum spacing between outbound typing notifications.
    pub typing_throttle: Duration,
    /// How long an inbound typing signal stays alive without renewal.
    pub typing_expiry: Duration,
    /// Quiet period after the last local read-cursor advance before the
    /// cursor is pushed to the server.
    pub read_sync_debounce: Duration,
    /// Cadence of the pull that reconciles list previews and unread counts
    /// with server truth, independent of the push path.
    pub list_resync_period: Duration,
    /// Page size for timeline history fetches.
    pub history_page_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.chat.example".into(),
            push_url: "wss://push.chat.example/ws".into(),
            heartbeat_period: Duration::from_secs(25),
            typing_throttle: Duration::from_secs(1),
            typing_expiry: Duration::from_secs(3),
            read_sync_debounce: Duration::from_millis(1500),
            list_resync_period: Duration::from_secs(60),
            history_page_size: 50,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("CHAT_API_URL") {
            config.api_url = v;
        }
        if let Ok(v) = std::env::var("CHAT_PUSH_URL") {
            config.push_url = v;
        }
        if let Ok(v) = std::env::var("CHAT_HISTORY_PAGE_SIZE") {
            if let Ok(n) = v.parse() {
                config.history_page_size = n;
            }
        }
        config
    }

    /// Broadcast topic carrying cross-conversation events for one user
    /// (new-message previews, conversation-created, notifications).
    pub fn user_topic(&self, user_id: shared::domain::UserId) -> String {
        format!("user.{}", user_id.0)
    }
}
