use crate::auth::Identity;
use crate::config::ChatSettings;
use crate::error::ChatError;
use crate::registry::{Connection, ConnectionId, GroupRegistry};
use crate::store::MessageStore;
use chat_api::{ClientFrame, HouseId, Message, MessageId, RpcError, ServerFrame};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

/// Server-side session entry point: bridges group membership to message
/// persistence and fan-out.
pub struct ChatHub {
    registry: GroupRegistry,
    store: Arc<dyn MessageStore>,
    settings: ChatSettings,
    // held across persist + broadcast so fan-out order equals id order
    sequencers: Mutex<HashMap<HouseId, Arc<AsyncMutex<()>>>>,
    sessions: Mutex<HashMap<ConnectionId, Connection>>,
}

impl ChatHub {
    pub fn new(store: Arc<dyn MessageStore>, settings: ChatSettings) -> Self {
        Self {
            registry: GroupRegistry::new(settings.send_timeout),
            store,
            settings,
            sequencers: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &GroupRegistry {
        &self.registry
    }

    /// Register a freshly authenticated transport connection.
    pub fn connection_opened(
        &self,
        identity: Identity,
    ) -> (Connection, mpsc::Receiver<ServerFrame>) {
        let (conn, outbox) = Connection::new(identity, self.settings.outbox_capacity);
        self.sessions.lock().insert(conn.id, conn.clone());
        (conn, outbox)
    }

    /// Must run once the transport connection is gone, whatever the reason.
    pub fn connection_closed(&self, conn: &Connection) {
        let houses = self.registry.remove_connection(conn.id);
        self.sessions.lock().remove(&conn.id);
        conn.close();
        debug!(connection_id = %conn.id, ?houses, "connection cleaned up");
    }

    /// Signal every live connection to close.
    pub fn close_all(&self) {
        let sessions: Vec<Connection> = self.sessions.lock().values().cloned().collect();
        info!(count = sessions.len(), "closing all connections");
        for conn in sessions {
            conn.close();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.lock().len()
    }

    fn authorize(&self, identity: &Identity, house_id: HouseId) -> Result<(), ChatError> {
        if identity.is_expired() {
            return Err(ChatError::Unauthenticated);
        }
        if self.settings.require_tenancy && !identity.is_tenant_of(house_id) {
            return Err(ChatError::Forbidden(house_id));
        }
        Ok(())
    }

    pub fn join_house(&self, conn: &Connection, house_id: HouseId) -> Result<(), ChatError> {
        self.authorize(&conn.identity, house_id)?;
        if self.registry.join(conn, house_id) {
            info!(
                connection_id = %conn.id,
                user_id = conn.identity.user_id,
                house_id,
                "joined house"
            );
        }
        Ok(())
    }

    pub fn leave_house(&self, conn: &Connection, house_id: HouseId) {
        if self.registry.leave(conn.id, house_id) {
            info!(connection_id = %conn.id, house_id, "left house");
        }
    }

    fn sequencer(&self, house_id: HouseId) -> Arc<AsyncMutex<()>> {
        self.sequencers.lock().entry(house_id).or_default().clone()
    }

    /// Forget a house's sequencer once no other sender holds or waits on it.
    fn release_sequencer(&self, house_id: HouseId, sequencer: Arc<AsyncMutex<()>>) {
        let mut sequencers = self.sequencers.lock();
        // clones are only handed out under this lock: ours plus the map's
        if Arc::strong_count(&sequencer) == 2 {
            sequencers.remove(&house_id);
        }
    }

    /// Persist a message from the connection's user and fan it out to the
    /// house group, sender included. Nothing is broadcast if persisting fails.
    pub async fn send_message(
        &self,
        conn: &Connection,
        house_id: HouseId,
        text: &str,
    ) -> Result<(), ChatError> {
        let identity = &conn.identity;
        self.authorize(identity, house_id)?;
        if text.trim().is_empty() {
            return Err(ChatError::InvalidArgument("empty_message"));
        }

        let sequencer = self.sequencer(house_id);
        let result = {
            let _turn = sequencer.lock().await;
            self.persist_and_broadcast(identity, house_id, text).await
        };
        self.release_sequencer(house_id, sequencer);
        result
    }

    async fn persist_and_broadcast(
        &self,
        identity: &Identity,
        house_id: HouseId,
        text: &str,
    ) -> Result<(), ChatError> {
        let store = self.store.clone();
        let (sender_id, sender_name, body) =
            (identity.user_id, identity.display_name.clone(), text.to_string());
        let message = tokio::task::spawn_blocking(move || {
            store.append(house_id, sender_id, &sender_name, &body)
        })
        .await
        .map_err(anyhow::Error::from)??;

        let id = message.id;
        let delivered = self
            .registry
            .broadcast(house_id, ServerFrame::ReceiveMessage { message })
            .await;
        debug!(house_id, message_id = id, delivered, "message fanned out");
        Ok(())
    }

    /// Best effort read acknowledgement; unknown ids are ignored.
    pub async fn mark_read(&self, message_id: MessageId) -> Result<(), ChatError> {
        let store = self.store.clone();
        let found = tokio::task::spawn_blocking(move || store.mark_read(message_id))
            .await
            .map_err(anyhow::Error::from)??;
        if !found {
            debug!(message_id, "mark_read on unknown message ignored");
        }
        Ok(())
    }

    /// Persisted log of a house, oldest first.
    pub async fn history(
        &self,
        identity: &Identity,
        house_id: HouseId,
    ) -> Result<Vec<Message>, ChatError> {
        self.authorize(identity, house_id)?;
        let store = self.store.clone();
        let messages = tokio::task::spawn_blocking(move || store.list(house_id))
            .await
            .map_err(anyhow::Error::from)??;
        Ok(messages)
    }

    /// Execute one client invocation and build its completion frame.
    pub async fn dispatch(&self, conn: &Connection, frame: ClientFrame) -> ServerFrame {
        let invocation_id = frame.invocation_id();
        let result = match frame {
            ClientFrame::JoinHouse { house_id, .. } => self.join_house(conn, house_id),
            ClientFrame::LeaveHouse { house_id, .. } => {
                self.leave_house(conn, house_id);
                Ok(())
            }
            ClientFrame::SendMessage { house_id, text, .. } => {
                self.send_message(conn, house_id, &text).await
            }
            ClientFrame::MarkRead { message_id, .. } => self.mark_read(message_id).await,
        };
        let error = result.err().map(|e| {
            warn!(connection_id = %conn.id, invocation_id, error = %e, "invocation failed");
            RpcError::from(&e)
        });
        ServerFrame::Completion {
            invocation_id,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::store::SqliteStore;
    use chat_api::{ErrorCode, UserId};
    use std::time::Duration;

    struct FailingStore;

    impl MessageStore for FailingStore {
        fn append(&self, _: HouseId, _: UserId, _: &str, _: &str) -> anyhow::Result<Message> {
            anyhow::bail!("disk full")
        }
        fn mark_read(&self, _: MessageId) -> anyhow::Result<bool> {
            anyhow::bail!("disk full")
        }
        fn list(&self, _: HouseId) -> anyhow::Result<Vec<Message>> {
            anyhow::bail!("disk full")
        }
    }

    fn settings() -> ChatSettings {
        ChatSettings {
            require_tenancy: true,
            send_timeout: Duration::from_millis(100),
            outbox_capacity: 16,
        }
    }

    fn sqlite_hub() -> (ChatHub, Arc<SqliteStore>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(
            db::open_pool(tmp.path().join("chat.db")).unwrap(),
        ));
        (ChatHub::new(store.clone(), settings()), store, tmp)
    }

    fn tenant(user_id: UserId, name: &str, houses: &[HouseId]) -> Identity {
        Identity {
            user_id,
            display_name: name.into(),
            houses: houses.to_vec(),
            expires_at: i64::MAX,
        }
    }

    fn received(rx: &mut mpsc::Receiver<ServerFrame>) -> Message {
        match rx.try_recv().expect("frame queued") {
            ServerFrame::ReceiveMessage { message } => message,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn both_tenants_receive_hello_once() {
        let (hub, _store, _tmp) = sqlite_hub();
        let (a, mut a_rx) = hub.connection_opened(tenant(1, "Alice", &[7]));
        let (b, mut b_rx) = hub.connection_opened(tenant(2, "Bob", &[7]));
        hub.join_house(&a, 7).unwrap();
        hub.join_house(&b, 7).unwrap();

        hub.send_message(&a, 7, "hello").await.unwrap();
        let for_a = received(&mut a_rx);
        let for_b = received(&mut b_rx);
        assert_eq!(for_a, for_b);
        assert_eq!(for_a.text, "hello");
        assert_eq!(for_a.sender_id, 1);
        assert_eq!(for_a.sender_name, "Alice");
        assert!(a_rx.try_recv().is_err());
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ids_strictly_increase_per_house() {
        let (hub, store, _tmp) = sqlite_hub();
        let (a, _rx) = hub.connection_opened(tenant(1, "Alice", &[3, 4]));
        let mut last = 0;
        for (house, text) in [(3, "a"), (4, "b"), (3, "c"), (3, "d")] {
            hub.send_message(&a, house, text).await.unwrap();
            let newest = store.list(house).unwrap().last().unwrap().id;
            assert!(newest > last);
            last = newest;
        }
    }

    #[tokio::test]
    async fn whitespace_is_rejected_without_side_effects() {
        let (hub, store, _tmp) = sqlite_hub();
        let (a, mut a_rx) = hub.connection_opened(tenant(1, "Alice", &[3]));
        hub.join_house(&a, 3).unwrap();
        let err = hub.send_message(&a, 3, "   ").await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidArgument(_)));
        assert!(store.list(3).unwrap().is_empty());
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn persistence_failure_means_no_broadcast() {
        let hub = ChatHub::new(Arc::new(FailingStore), settings());
        let (a, mut a_rx) = hub.connection_opened(tenant(1, "Alice", &[3]));
        hub.join_house(&a, 3).unwrap();
        let reply = hub
            .dispatch(
                &a,
                ClientFrame::SendMessage {
                    invocation_id: 5,
                    house_id: 3,
                    text: "lost?".into(),
                },
            )
            .await;
        match reply {
            ServerFrame::Completion {
                invocation_id: 5,
                error: Some(e),
            } => {
                assert_eq!(e.code, ErrorCode::PersistenceFailure);
                assert!(!e.message.contains("disk full"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn tenancy_is_enforced() {
        let (hub, store, _tmp) = sqlite_hub();
        let (c, _rx) = hub.connection_opened(tenant(3, "Carol", &[1]));
        assert!(matches!(hub.join_house(&c, 7), Err(ChatError::Forbidden(7))));
        assert!(matches!(
            hub.send_message(&c, 7, "hi").await,
            Err(ChatError::Forbidden(7))
        ));
        assert!(store.list(7).unwrap().is_empty());
        assert!(hub.registry().members(7).is_empty());
    }

    #[tokio::test]
    async fn permissive_mode_allows_any_house() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(
            db::open_pool(tmp.path().join("chat.db")).unwrap(),
        ));
        let hub = ChatHub::new(
            store,
            ChatSettings {
                require_tenancy: false,
                ..settings()
            },
        );
        let (c, mut rx) = hub.connection_opened(tenant(3, "Carol", &[]));
        hub.join_house(&c, 7).unwrap();
        hub.send_message(&c, 7, "hi").await.unwrap();
        assert_eq!(received(&mut rx).text, "hi");
    }

    #[tokio::test]
    async fn expired_identity_cannot_send() {
        let (hub, _store, _tmp) = sqlite_hub();
        let mut identity = tenant(1, "Alice", &[3]);
        identity.expires_at = 0;
        let (a, _rx) = hub.connection_opened(identity);
        assert!(matches!(
            hub.send_message(&a, 3, "late").await,
            Err(ChatError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn mark_read_ignores_unknown_ids() {
        let (hub, store, _tmp) = sqlite_hub();
        let (a, _rx) = hub.connection_opened(tenant(1, "Alice", &[3]));
        hub.send_message(&a, 3, "read me").await.unwrap();
        let id = store.list(3).unwrap()[0].id;
        hub.mark_read(id).await.unwrap();
        hub.mark_read(id + 1000).await.unwrap();
        assert!(store.list(3).unwrap()[0].is_read);
    }

    #[tokio::test]
    async fn closed_connection_leaves_all_groups() {
        let (hub, _store, _tmp) = sqlite_hub();
        let (a, _a_rx) = hub.connection_opened(tenant(1, "Alice", &[1, 2]));
        let (b, mut b_rx) = hub.connection_opened(tenant(2, "Bob", &[1]));
        hub.join_house(&a, 1).unwrap();
        hub.join_house(&a, 2).unwrap();
        hub.join_house(&b, 1).unwrap();
        assert_eq!(hub.connection_count(), 2);

        hub.connection_closed(&a);
        assert!(a.is_closed());
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(hub.registry().members(1), vec![b.id]);
        assert!(hub.registry().members(2).is_empty());

        hub.send_message(&b, 1, "still here").await.unwrap();
        assert_eq!(received(&mut b_rx).text, "still here");
    }

    #[tokio::test]
    async fn close_all_signals_every_session() {
        let (hub, _store, _tmp) = sqlite_hub();
        let (a, _a_rx) = hub.connection_opened(tenant(1, "Alice", &[]));
        let (b, _b_rx) = hub.connection_opened(tenant(2, "Bob", &[]));
        hub.close_all();
        assert!(a.is_closed() && b.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_senders_are_seen_in_one_order() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(
            db::open_pool(tmp.path().join("chat.db")).unwrap(),
        ));
        let hub = Arc::new(ChatHub::new(
            store.clone(),
            ChatSettings {
                outbox_capacity: 64,
                ..settings()
            },
        ));
        let mut members = Vec::new();
        for user_id in 1..=3 {
            let (conn, rx) = hub.connection_opened(tenant(user_id, "tenant", &[7]));
            hub.join_house(&conn, 7).unwrap();
            members.push((conn, rx));
        }

        let senders: Vec<_> = members
            .iter()
            .map(|(conn, _)| {
                let hub = hub.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    for i in 0..8 {
                        hub.send_message(&conn, 7, &format!("{} #{i}", conn.identity.user_id))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for sender in futures::future::join_all(senders).await {
            sender.unwrap();
        }

        let persisted: Vec<MessageId> = store.list(7).unwrap().iter().map(|m| m.id).collect();
        assert_eq!(persisted.len(), 24);
        for (_, rx) in &mut members {
            let mut seen = Vec::new();
            while let Ok(ServerFrame::ReceiveMessage { message }) = rx.try_recv() {
                seen.push(message.id);
            }
            assert_eq!(seen, persisted);
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
        }
        assert!(hub.sequencers.lock().is_empty());
    }

    #[tokio::test]
    async fn sequencers_are_dropped_after_each_turn() {
        let (hub, _store, _tmp) = sqlite_hub();
        let (a, _rx) = hub.connection_opened(tenant(1, "Alice", &[1, 2, 3]));
        for house in 1..=3 {
            hub.send_message(&a, house, "hi").await.unwrap();
        }
        let failing = ChatHub::new(Arc::new(FailingStore), settings());
        assert!(failing.send_message(&a, 1, "lost").await.is_err());
        assert!(hub.sequencers.lock().is_empty());
        assert!(failing.sequencers.lock().is_empty());
    }
}
