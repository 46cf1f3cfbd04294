use crate::config::ClientConfig;
use crate::credentials::CredentialProvider;
use crate::error::ClientError;
use crate::events::{ChatMessage, ClientEvent, ConnectionStatus, EventBus, Subscription};
use chat_api::{ClientFrame, HouseId, InvocationId, MessageId, ServerFrame};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest, http::HeaderValue, Message as WsMessage,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Completion = oneshot::Sender<Result<(), ClientError>>;

/// Lifecycle of the client's single logical connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Default)]
struct Session {
    state: ConnectionState,
    house_id: Option<HouseId>,
    outgoing: Option<mpsc::UnboundedSender<ClientFrame>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    config: ClientConfig,
    credentials: Arc<dyn CredentialProvider>,
    events: Arc<EventBus>,
    // held by the one connection attempt in flight
    connect_gate: AsyncMutex<()>,
    session: Mutex<Session>,
    pending: Mutex<HashMap<InvocationId, Completion>>,
    next_invocation: AtomicU64,
}

impl Inner {
    /// State change and its notification happen under the session lock so
    /// subscribers observe them in the same order.
    fn transition(&self, state: ConnectionState, status: ConnectionStatus) {
        let mut session = self.session.lock();
        session.state = state;
        self.events.publish(ClientEvent::StatusChanged(status));
    }

    /// Enter `Reconnecting`, discarding queued frames and failing their
    /// callers. Runs under the session lock so no invocation slips in between.
    fn connection_lost(
        &self,
        outgoing: &mut mpsc::UnboundedReceiver<ClientFrame>,
        reason: String,
    ) {
        let mut session = self.session.lock();
        session.state = ConnectionState::Reconnecting;
        while outgoing.try_recv().is_ok() {}
        self.fail_pending(ClientError::Transport(reason));
        self.events
            .publish(ClientEvent::StatusChanged(ConnectionStatus::Reconnecting));
    }

    fn next_invocation_id(&self) -> InvocationId {
        self.next_invocation.fetch_add(1, Ordering::Relaxed)
    }

    fn complete(&self, invocation_id: InvocationId, result: Result<(), ClientError>) {
        match self.pending.lock().remove(&invocation_id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(invocation_id, "completion for unknown invocation"),
        }
    }

    fn fail_pending(&self, err: ClientError) {
        let drained: Vec<Completion> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        for tx in drained {
            let _ = tx.send(Err(err.clone()));
        }
    }

    fn handle_server_frame(&self, text: &str) {
        match serde_json::from_str::<ServerFrame>(text) {
            Ok(ServerFrame::Completion {
                invocation_id,
                error,
            }) => self.complete(invocation_id, error.map_or(Ok(()), |e| Err(e.into()))),
            Ok(ServerFrame::ReceiveMessage { message }) => {
                let is_current_user = self.credentials.user_id() == Some(message.sender_id);
                debug!(message_id = message.id, house_id = message.house_id, "message received");
                self.events.publish(ClientEvent::MessageReceived(ChatMessage {
                    message,
                    is_current_user,
                }));
            }
            Err(e) => warn!(error = %e, "unreadable frame from hub"),
        }
    }
}

/// Device side connection manager for one house chat.
///
/// At most one connection attempt is in flight and at most one supervisor
/// task owns the socket, so a session never has two reconnect loops.
/// Clones share the same session.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<Inner>,
}

impl ChatClient {
    pub fn new(config: ClientConfig, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                credentials,
                events: EventBus::new(),
                connect_gate: AsyncMutex::new(()),
                session: Mutex::new(Session::default()),
                pending: Mutex::new(HashMap::new()),
                next_invocation: AtomicU64::new(1),
            }),
        }
    }

    /// Register for status changes and received messages.
    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.session.lock().state
    }

    pub fn house_id(&self) -> Option<HouseId> {
        self.inner.session.lock().house_id
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect to the hub and join `house_id`.
    ///
    /// Does nothing while another attempt is in flight or a session is
    /// already up. On failure the client is back in `Disconnected`, an
    /// `Error: <reason>` status is published and the error is returned.
    pub async fn initialize(&self, house_id: HouseId) -> Result<(), ClientError> {
        let inner = &self.inner;
        let Ok(_attempt) = inner.connect_gate.try_lock() else {
            debug!(house_id, "connection attempt already in flight");
            return Ok(());
        };

        let cancel = CancellationToken::new();
        {
            let mut session = inner.session.lock();
            if session.state != ConnectionState::Disconnected {
                debug!(house_id, state = ?session.state, "already connected");
                return Ok(());
            }
            session.state = ConnectionState::Connecting;
            session.house_id = Some(house_id);
            session.cancel = Some(cancel.clone());
            inner
                .events
                .publish(ClientEvent::StatusChanged(ConnectionStatus::Connecting));
        }
        info!(house_id, url = %inner.config.url, "connecting");

        let attempt = async {
            let token = inner
                .credentials
                .token()
                .ok_or(ClientError::Unauthenticated)?;
            tokio::time::timeout(
                inner.config.connect_timeout,
                open_session(inner, &token, house_id),
            )
            .await
            .unwrap_or(Err(ClientError::Timeout))
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            r = attempt => r,
        };

        let mut session = inner.session.lock();
        if cancel.is_cancelled() {
            // disconnect() resets the session once the gate is released
            return Err(ClientError::Cancelled);
        }
        match result {
            Ok(socket) => {
                let (tx, rx) = mpsc::unbounded_channel();
                session.state = ConnectionState::Connected;
                session.outgoing = Some(tx);
                inner
                    .events
                    .publish(ClientEvent::StatusChanged(ConnectionStatus::Connected));
                session.task = Some(tokio::spawn(supervise(
                    inner.clone(),
                    socket,
                    rx,
                    cancel,
                    house_id,
                )));
                info!(house_id, "connected");
                Ok(())
            }
            Err(e) => {
                session.state = ConnectionState::Disconnected;
                session.house_id = None;
                session.cancel = None;
                inner
                    .events
                    .publish(ClientEvent::StatusChanged(ConnectionStatus::Error(e.to_string())));
                warn!(house_id, error = %e, "connection failed");
                Err(e)
            }
        }
    }

    /// Submit a message. Resolves once the hub has persisted and fanned it
    /// out; the message itself arrives through the subscription.
    pub async fn send(&self, house_id: HouseId, text: &str) -> Result<(), ClientError> {
        if text.trim().is_empty() {
            return Err(ClientError::InvalidArgument("empty_message".into()));
        }
        self.invoke(|invocation_id| ClientFrame::SendMessage {
            invocation_id,
            house_id,
            text: text.to_string(),
        })
        .await
    }

    /// Acknowledge a message as read. Unknown ids are not an error.
    pub async fn mark_read(&self, message_id: MessageId) -> Result<(), ClientError> {
        match self
            .invoke(|invocation_id| ClientFrame::MarkRead {
                invocation_id,
                message_id,
            })
            .await
        {
            Err(ClientError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn invoke(
        &self,
        build: impl FnOnce(InvocationId) -> ClientFrame,
    ) -> Result<(), ClientError> {
        let inner = &self.inner;
        let invocation_id = inner.next_invocation_id();
        let (tx, rx) = oneshot::channel();
        {
            // queued under the session lock so a connection loss either
            // drains this frame or rejects it, never replays it
            let session = inner.session.lock();
            let (ConnectionState::Connected, Some(outgoing)) = (session.state, &session.outgoing)
            else {
                return Err(ClientError::NotConnected);
            };
            inner.pending.lock().insert(invocation_id, tx);
            if outgoing.send(build(invocation_id)).is_err() {
                inner.pending.lock().remove(&invocation_id);
                return Err(ClientError::NotConnected);
            }
        }
        match tokio::time::timeout(inner.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Transport("connection lost".into())),
            Err(_) => {
                inner.pending.lock().remove(&invocation_id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Tear the session down from any state. The socket is released before
    /// this returns; calling it again is a no-op.
    pub async fn disconnect(&self) {
        let in_flight = self.inner.session.lock().cancel.clone();
        if let Some(cancel) = in_flight {
            cancel.cancel();
        }
        // a cancelled attempt drops its socket before releasing the gate
        let _attempt = self.inner.connect_gate.lock().await;
        let (cancel, task) = {
            let mut session = self.inner.session.lock();
            (session.cancel.take(), session.task.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "supervisor task failed");
            }
        }
        self.inner.fail_pending(ClientError::NotConnected);

        let mut session = self.inner.session.lock();
        session.outgoing = None;
        let house_id = session.house_id.take();
        if session.state != ConnectionState::Disconnected {
            session.state = ConnectionState::Disconnected;
            self.inner
                .events
                .publish(ClientEvent::StatusChanged(ConnectionStatus::Disconnected));
            info!(?house_id, "disconnected");
        }
    }
}

/// Handshake with the hub and join the house group.
async fn open_session(
    inner: &Inner,
    token: &str,
    house_id: HouseId,
) -> Result<Socket, ClientError> {
    let mut request = inner
        .config
        .hub_url(house_id)
        .into_client_request()
        .map_err(|e| ClientError::InvalidArgument(e.to_string()))?;
    let auth = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| ClientError::Unauthenticated)?;
    request.headers_mut().insert("Authorization", auth);
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await?;

    let invocation_id = inner.next_invocation_id();
    let join = serde_json::to_string(&ClientFrame::JoinHouse {
        invocation_id,
        house_id,
    })
    .map_err(|e| ClientError::Protocol(e.to_string()))?;
    socket.send(WsMessage::Text(join)).await?;

    while let Some(incoming) = socket.next().await {
        let WsMessage::Text(text) = incoming? else {
            continue;
        };
        match serde_json::from_str::<ServerFrame>(&text) {
            Ok(ServerFrame::Completion {
                invocation_id: id,
                error,
            }) if id == invocation_id => {
                return match error {
                    None => Ok(socket),
                    Some(err) => Err(err.into()),
                };
            }
            Ok(other) => debug!(?other, "frame before join completed"),
            Err(e) => return Err(ClientError::Protocol(e.to_string())),
        }
    }
    Err(ClientError::Transport("closed during join".into()))
}

enum PumpExit {
    Cancelled,
    Dropped(String),
}

/// Owns the socket for the lifetime of the session, reconnecting on loss.
async fn supervise(
    inner: Arc<Inner>,
    socket: Socket,
    mut outgoing: mpsc::UnboundedReceiver<ClientFrame>,
    cancel: CancellationToken,
    house_id: HouseId,
) {
    let mut socket = socket;
    loop {
        let reason = match pump(&inner, socket, &mut outgoing, &cancel).await {
            PumpExit::Cancelled => {
                debug!(house_id, "session closed");
                return;
            }
            PumpExit::Dropped(reason) => reason,
        };
        warn!(house_id, %reason, "connection lost");
        inner.connection_lost(&mut outgoing, reason);

        match reconnect(&inner, house_id, &cancel).await {
            Some(fresh) => {
                socket = fresh;
                inner.transition(ConnectionState::Connected, ConnectionStatus::Connected);
                info!(house_id, "reconnected");
            }
            None => {
                if cancel.is_cancelled() {
                    return;
                }
                let mut session = inner.session.lock();
                session.state = ConnectionState::Disconnected;
                session.house_id = None;
                session.outgoing = None;
                session.cancel = None;
                session.task = None;
                inner
                    .events
                    .publish(ClientEvent::StatusChanged(ConnectionStatus::Disconnected));
                warn!(house_id, "reconnect attempts exhausted");
                return;
            }
        }
    }
}

async fn pump(
    inner: &Inner,
    socket: Socket,
    outgoing: &mut mpsc::UnboundedReceiver<ClientFrame>,
    cancel: &CancellationToken,
) -> PumpExit {
    let (mut write, mut read) = socket.split();
    let period = inner.config.keep_alive_interval;
    let mut keep_alive = tokio::time::interval_at(Instant::now() + period, period);
    let mut last_seen = Instant::now();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.close().await;
                return PumpExit::Cancelled;
            }
            frame = outgoing.recv() => {
                let Some(frame) = frame else {
                    let _ = write.close().await;
                    return PumpExit::Cancelled;
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        let err = ClientError::Protocol(e.to_string());
                        inner.complete(frame.invocation_id(), Err(err));
                        continue;
                    }
                };
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    return PumpExit::Dropped(e.to_string());
                }
            }
            _ = keep_alive.tick() => {
                if let Err(e) = write.send(WsMessage::Ping(Vec::new())).await {
                    return PumpExit::Dropped(e.to_string());
                }
            }
            _ = tokio::time::sleep_until(last_seen + inner.config.server_timeout) => {
                return PumpExit::Dropped("hub stopped responding".into());
            }
            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    last_seen = Instant::now();
                    inner.handle_server_frame(&text);
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    return PumpExit::Dropped("closed by hub".into());
                }
                Some(Ok(_)) => last_seen = Instant::now(),
                Some(Err(e)) => return PumpExit::Dropped(e.to_string()),
            },
        }
    }
}

async fn reconnect(inner: &Inner, house_id: HouseId, cancel: &CancellationToken) -> Option<Socket> {
    for (attempt, delay) in inner.config.reconnect_delays.iter().enumerate() {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(*delay) => {}
        }
        let Some(token) = inner.credentials.token() else {
            warn!(house_id, "no credential available for reconnect");
            return None;
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => return None,
            r = tokio::time::timeout(
                inner.config.connect_timeout,
                open_session(inner, &token, house_id),
            ) => r.unwrap_or(Err(ClientError::Timeout)),
        };
        match result {
            Ok(socket) => return Some(socket),
            Err(ClientError::Unauthenticated) => {
                warn!(house_id, "credential rejected during reconnect");
                return None;
            }
            Err(e) => {
                warn!(house_id, attempt = attempt + 1, error = %e, "reconnect attempt failed")
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn client(url: &str, credentials: StaticCredentials) -> ChatClient {
        let config = ClientConfig {
            connect_timeout: Duration::from_secs(2),
            ..ClientConfig::new(url)
        };
        ChatClient::new(config, Arc::new(credentials))
    }

    fn status(s: ConnectionStatus) -> Option<ClientEvent> {
        Some(ClientEvent::StatusChanged(s))
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Accepts TCP connections but never answers the WebSocket handshake.
    async fn silent_listener() -> (String, Arc<AtomicUsize>, JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });
        (url, accepted, task)
    }

    /// Put the client in `Connected` with a queue the test reads directly.
    fn fake_session(c: &ChatClient) -> mpsc::UnboundedReceiver<ClientFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = c.inner.session.lock();
        session.state = ConnectionState::Connected;
        session.house_id = Some(7);
        session.outgoing = Some(tx);
        rx
    }

    #[tokio::test]
    async fn send_validates_text_before_connection() {
        let c = client("ws://127.0.0.1:1", StaticCredentials::new("t", 1));
        assert_eq!(
            c.send(7, "  \n").await,
            Err(ClientError::InvalidArgument("empty_message".into()))
        );
        assert_eq!(c.send(7, "hello").await, Err(ClientError::NotConnected));
        assert_eq!(c.mark_read(3).await, Err(ClientError::NotConnected));
        assert_eq!(c.state(), ConnectionState::Disconnected);
        assert!(!c.is_connected());
    }

    #[tokio::test]
    async fn missing_credential_fails_initialize() {
        let c = client("ws://127.0.0.1:1", StaticCredentials::default());
        let mut events = c.subscribe();
        assert_eq!(c.initialize(7).await, Err(ClientError::Unauthenticated));
        assert_eq!(events.recv().await, status(ConnectionStatus::Connecting));
        assert_eq!(
            events.recv().await,
            status(ConnectionStatus::Error("unauthenticated".into()))
        );
        assert_eq!(c.state(), ConnectionState::Disconnected);
        assert_eq!(c.house_id(), None);
    }

    #[tokio::test]
    async fn unreachable_hub_reports_transport_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let c = client(&format!("ws://127.0.0.1:{port}"), StaticCredentials::new("t", 1));
        let mut events = c.subscribe();
        let err = c.initialize(7).await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)), "{err:?}");
        assert_eq!(events.recv().await, status(ConnectionStatus::Connecting));
        match events.recv().await {
            Some(ClientEvent::StatusChanged(ConnectionStatus::Error(reason))) => {
                assert!(reason.starts_with("transport failure"))
            }
            other => panic!("unexpected event {other:?}"),
        }
        // a failed attempt releases the in-flight flag
        assert!(c.initialize(7).await.is_err());
    }

    #[tokio::test]
    async fn disconnect_when_idle_is_silent() {
        let c = client("ws://127.0.0.1:1", StaticCredentials::new("t", 1));
        let mut events = c.subscribe();
        c.disconnect().await;
        c.disconnect().await;
        assert!(events.try_recv().is_none());
        assert_eq!(c.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_mid_handshake_allows_a_fresh_attempt() {
        let (url, accepted, server) = silent_listener().await;
        let c = client(&url, StaticCredentials::new("t", 1));
        let mut events = c.subscribe();

        let first = tokio::spawn({
            let c = c.clone();
            async move { c.initialize(7).await }
        });
        assert_eq!(events.recv().await, status(ConnectionStatus::Connecting));
        assert!(eventually(|| accepted.load(Ordering::SeqCst) == 1).await);

        c.disconnect().await;
        assert_eq!(c.state(), ConnectionState::Disconnected);
        assert_eq!(events.recv().await, status(ConnectionStatus::Disconnected));
        // the attempt has finished before disconnect returned
        assert!(first.is_finished());
        assert_eq!(first.await.unwrap(), Err(ClientError::Cancelled));

        let second = tokio::spawn({
            let c = c.clone();
            async move { c.initialize(7).await }
        });
        assert_eq!(events.recv().await, status(ConnectionStatus::Connecting));
        assert_eq!(c.state(), ConnectionState::Connecting);
        assert!(eventually(|| accepted.load(Ordering::SeqCst) == 2).await);

        c.disconnect().await;
        assert_eq!(second.await.unwrap(), Err(ClientError::Cancelled));
        assert_eq!(events.recv().await, status(ConnectionStatus::Disconnected));
        server.abort();
    }

    #[tokio::test]
    async fn invocations_queued_at_a_drop_fail_and_are_not_replayed() {
        let c = client("ws://127.0.0.1:1", StaticCredentials::new("t", 1));
        let mut outgoing = fake_session(&c);

        let in_flight = tokio::spawn({
            let c = c.clone();
            async move { c.send(7, "hello").await }
        });
        assert!(eventually(|| c.inner.pending.lock().len() == 1).await);

        c.inner.connection_lost(&mut outgoing, "reset by peer".into());
        assert_eq!(c.state(), ConnectionState::Reconnecting);
        assert!(outgoing.try_recv().is_err());
        assert!(c.inner.pending.lock().is_empty());
        assert_eq!(
            in_flight.await.unwrap(),
            Err(ClientError::Transport("reset by peer".into()))
        );

        // nothing reaches the queue until the session is back
        assert_eq!(c.send(7, "again").await, Err(ClientError::NotConnected));
        assert!(outgoing.try_recv().is_err());
    }
}
