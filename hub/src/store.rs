use crate::db::DbPool;
use anyhow::{anyhow, Result};
use chat_api::{HouseId, Message, MessageId, UserId};
use rusqlite::params;
use time::OffsetDateTime;

/// Append-only persistence of chat messages keyed by house.
pub trait MessageStore: Send + Sync {
    /// Persist a message, assigning its id and timestamp.
    fn append(
        &self,
        house_id: HouseId,
        sender_id: UserId,
        sender_name: &str,
        text: &str,
    ) -> Result<Message>;

    /// Flag a message as read. Returns false when the id is unknown.
    fn mark_read(&self, message_id: MessageId) -> Result<bool>;

    /// Full log of a house in persistence order.
    fn list(&self, house_id: HouseId) -> Result<Vec<Message>>;
}

/// [`MessageStore`] backed by a pooled SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn timestamp_from_ms(ms: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Integer, Box::new(e))
    })
}

fn row_to_msg(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        house_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row.get(3)?,
        text: row.get(4)?,
        timestamp: timestamp_from_ms(row.get(5)?)?,
        is_read: row.get::<_, i64>(6)? != 0,
    })
}

impl MessageStore for SqliteStore {
    fn append(
        &self,
        house_id: HouseId,
        sender_id: UserId,
        sender_name: &str,
        text: &str,
    ) -> Result<Message> {
        if text.trim().is_empty() {
            return Err(anyhow!("empty_message"));
        }
        let conn = self.pool.get()?;
        let created = now_ms();
        conn.execute(
            "INSERT INTO messages (house_id, sender_id, sender_name, text, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![house_id, sender_id, sender_name, text, created],
        )?;
        Ok(Message {
            id: conn.last_insert_rowid(),
            house_id,
            sender_id,
            sender_name: sender_name.into(),
            text: text.into(),
            timestamp: timestamp_from_ms(created)?,
            is_read: false,
        })
    }

    fn mark_read(&self, message_id: MessageId) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE messages SET is_read = 1 WHERE id = ?1",
            [message_id],
        )?;
        Ok(changed > 0)
    }

    fn list(&self, house_id: HouseId) -> Result<Vec<Message>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, house_id, sender_id, sender_name, text, created_at_ms, is_read \
             FROM messages WHERE house_id = ?1 ORDER BY id",
        )?;
        let msgs = stmt
            .query_map([house_id], row_to_msg)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(msgs)
    }
}

#[cfg(test)]
use rusqlite::OptionalExtension;

#[cfg(test)]
impl SqliteStore {
    /// Fetch a single message by id.
    pub fn get(&self, message_id: MessageId) -> Result<Option<Message>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, house_id, sender_id, sender_name, text, created_at_ms, is_read \
             FROM messages WHERE id = ?1",
        )?;
        Ok(stmt.query_row([message_id], row_to_msg).optional()?)
    }
}
