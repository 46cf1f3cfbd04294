use crate::auth::Identity;
use chat_api::{HouseId, ServerFrame};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Handle to one live client connection. Clones share the same outbox and
/// close signal.
#[derive(Clone, Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Identity,
    outbox: mpsc::Sender<ServerFrame>,
    closed: CancellationToken,
}

impl Connection {
    /// Create a connection handle together with the receiving end of its outbox.
    pub fn new(identity: Identity, capacity: usize) -> (Self, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            id: Uuid::new_v4(),
            identity,
            outbox: tx,
            closed: CancellationToken::new(),
        };
        (conn, rx)
    }

    /// Queue a frame for the socket writer, waiting at most `timeout`.
    pub async fn deliver(
        &self,
        frame: ServerFrame,
        timeout: Duration,
    ) -> Result<(), SendTimeoutError<ServerFrame>> {
        self.outbox.send_timeout(frame, timeout).await
    }

    /// Ask the transport to terminate this connection.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`Connection::close`] has been called on any clone.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

type Members = Mutex<HashMap<ConnectionId, Connection>>;

/// Maps each house to the set of connections subscribed to its broadcasts.
///
/// Every house has its own member lock; the outer map is only write-locked to
/// create or drop a house group.
pub struct GroupRegistry {
    houses: RwLock<HashMap<HouseId, Members>>,
    memberships: Mutex<HashMap<ConnectionId, HashSet<HouseId>>>,
    send_timeout: Duration,
}

impl GroupRegistry {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            houses: RwLock::new(HashMap::new()),
            memberships: Mutex::new(HashMap::new()),
            send_timeout,
        }
    }

    fn with_group<R>(
        &self,
        house_id: HouseId,
        f: impl FnOnce(&mut HashMap<ConnectionId, Connection>) -> R,
    ) -> R {
        {
            let houses = self.houses.read();
            if let Some(group) = houses.get(&house_id) {
                return f(&mut group.lock());
            }
        }
        let mut houses = self.houses.write();
        let group = houses.entry(house_id).or_default();
        let r = f(&mut group.lock());
        r
    }

    fn drop_group_if_empty(&self, house_id: HouseId) {
        let mut houses = self.houses.write();
        if houses.get(&house_id).is_some_and(|g| g.lock().is_empty()) {
            houses.remove(&house_id);
        }
    }

    /// Subscribe a connection to a house. Returns false if it already was a member.
    pub fn join(&self, conn: &Connection, house_id: HouseId) -> bool {
        let added = self.with_group(house_id, |members| {
            members.insert(conn.id, conn.clone()).is_none()
        });
        self.memberships
            .lock()
            .entry(conn.id)
            .or_default()
            .insert(house_id);
        added
    }

    /// Unsubscribe a connection from a house. Returns false if it was not a member.
    pub fn leave(&self, conn_id: ConnectionId, house_id: HouseId) -> bool {
        let (removed, now_empty) = {
            let houses = self.houses.read();
            match houses.get(&house_id) {
                Some(group) => {
                    let mut members = group.lock();
                    (members.remove(&conn_id).is_some(), members.is_empty())
                }
                None => (false, false),
            }
        };
        if now_empty {
            self.drop_group_if_empty(house_id);
        }
        let mut memberships = self.memberships.lock();
        if let Some(set) = memberships.get_mut(&conn_id) {
            set.remove(&house_id);
            if set.is_empty() {
                memberships.remove(&conn_id);
            }
        }
        removed
    }

    /// Remove a connection from every house it belonged to. Returns those houses.
    pub fn remove_connection(&self, conn_id: ConnectionId) -> Vec<HouseId> {
        let houses: Vec<HouseId> = self
            .memberships
            .lock()
            .remove(&conn_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for &house_id in &houses {
            self.leave(conn_id, house_id);
        }
        houses
    }

    /// Deliver a frame to every current member of a house. Members that cannot
    /// accept it within the send timeout are evicted and closed. Returns the
    /// number of members that accepted the frame.
    pub async fn broadcast(&self, house_id: HouseId, frame: ServerFrame) -> usize {
        let targets: Vec<Connection> = {
            let houses = self.houses.read();
            houses
                .get(&house_id)
                .map(|g| g.lock().values().cloned().collect())
                .unwrap_or_default()
        };
        let frame = &frame;
        let timeout = self.send_timeout;
        let results = futures::future::join_all(targets.iter().map(|conn| async move {
            (conn, conn.deliver(frame.clone(), timeout).await)
        }))
        .await;

        let mut delivered = 0;
        for (conn, res) in results {
            match res {
                Ok(()) => delivered += 1,
                Err(e) => {
                    let reason = match e {
                        SendTimeoutError::Timeout(_) => "send timeout",
                        SendTimeoutError::Closed(_) => "outbox closed",
                    };
                    warn!(connection_id = %conn.id, house_id, reason, "evicting connection");
                    self.remove_connection(conn.id);
                    conn.close();
                }
            }
        }
        debug!(house_id, delivered, "broadcast");
        delivered
    }

    /// Snapshot of the connections subscribed to a house.
    pub fn members(&self, house_id: HouseId) -> Vec<ConnectionId> {
        let houses = self.houses.read();
        houses
            .get(&house_id)
            .map(|g| g.lock().keys().copied().collect())
            .unwrap_or_default()
    }

    /// Houses a connection is currently subscribed to, sorted.
    pub fn houses_of(&self, conn_id: ConnectionId) -> Vec<HouseId> {
        let mut houses: Vec<HouseId> = self
            .memberships
            .lock()
            .get(&conn_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        houses.sort_unstable();
        houses
    }

    pub fn house_count(&self) -> usize {
        self.houses.read().len()
    }
}
