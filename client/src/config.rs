use std::time::Duration;

/// Tunables for a [`crate::ChatClient`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base WebSocket URL of the hub, e.g. `ws://127.0.0.1:8787`.
    pub url: String,
    /// Upper bound on handshake plus house join.
    pub connect_timeout: Duration,
    /// Upper bound on waiting for the completion of one invocation.
    pub request_timeout: Duration,
    /// Wait before each reconnect attempt; exhausted means give up.
    pub reconnect_delays: Vec<Duration>,
    pub keep_alive_interval: Duration,
    /// Silence on the socket for this long counts as a dropped transport.
    pub server_timeout: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub(crate) fn hub_url(&self, house_id: chat_api::HouseId) -> String {
        format!("{}/chathub?house_id={}", self.url.trim_end_matches('/'), house_id)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8787".into(),
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(10),
            reconnect_delays: vec![
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
            keep_alive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
        }
    }
}
