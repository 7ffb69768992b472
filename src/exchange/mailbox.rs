//! SQLite-backed mailbox storage.
//!
//! One row per message. Directed messages and the broadcast log live in the
//! same table; an inbox read merges both by timestamp (insertion order for
//! ties). Delivery is pull-based: nothing here blocks, and once `send`
//! returns the row is committed and visible to every later poll.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::debug;

use super::message::{Message, MessageKind, Recipient, BROADCAST};
use crate::error::{store_err_with, Result};

pub struct MessageExchange {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl MessageExchange {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| store_err_with("Failed to create exchange dir", e))?;
        }

        let conn = Connection::open(&db_path)
            .map_err(|e| store_err_with("Failed to open message exchange", e))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                read INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_messages_recipient
                ON messages(recipient, read);
            ",
        )
        .map_err(|e| store_err_with("Failed to init exchange schema", e))?;

        Ok(())
    }

    /// Durably appends a message. Mailboxes are created lazily: sending to
    /// a recipient nobody has registered never fails.
    pub fn send(
        &self,
        sender: &str,
        recipient: Recipient,
        kind: MessageKind,
        content: &str,
        metadata: HashMap<String, String>,
    ) -> Result<String> {
        let message = Message::new(sender, recipient, kind, content).with_metadata(metadata);
        let metadata_json = serde_json::to_string(&message.metadata)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (id, sender, recipient, kind, content, metadata, created_at, read)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                &message.id,
                &message.sender,
                message.recipient.as_str(),
                message.kind.as_str(),
                &message.content,
                &metadata_json,
                message.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| store_err_with("Failed to append message", e))?;

        debug!(
            message_id = %message.id,
            recipient = message.recipient.as_str(),
            kind = message.kind.as_str(),
            "Message appended"
        );

        Ok(message.id)
    }

    /// Full ordered history for a worker: directed messages merged with the
    /// broadcast log by timestamp.
    pub fn read_inbox(&self, worker_id: &str) -> Result<Vec<Message>> {
        self.query_inbox(worker_id, false)
    }

    /// Unread subset of the inbox, same ordering.
    pub fn get_unread(&self, worker_id: &str) -> Result<Vec<Message>> {
        self.query_inbox(worker_id, true)
    }

    fn query_inbox(&self, worker_id: &str, unread_only: bool) -> Result<Vec<Message>> {
        let conn = self.conn.lock();

        let sql = if unread_only {
            "SELECT id, sender, recipient, kind, content, metadata, created_at, read
             FROM messages
             WHERE (recipient = ?1 OR recipient = ?2) AND read = 0
             ORDER BY created_at ASC, seq ASC"
        } else {
            "SELECT id, sender, recipient, kind, content, metadata, created_at, read
             FROM messages
             WHERE recipient = ?1 OR recipient = ?2
             ORDER BY created_at ASC, seq ASC"
        };

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| store_err_with("Failed to prepare inbox query", e))?;

        let rows = stmt
            .query_map(params![worker_id, BROADCAST], row_to_message)
            .map_err(|e| store_err_with("Failed to query inbox", e))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| store_err_with("Failed to read inbox rows", e))
    }

    /// Idempotent: marking an already-read message is a no-op.
    pub fn mark_read(&self, message_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE messages SET read = 1 WHERE id = ?1",
            params![message_id],
        )
        .map_err(|e| store_err_with("Failed to mark message read", e))?;

        Ok(())
    }

    /// Destroys the worker's directed messages. Broadcasts survive; they
    /// belong to every other recipient too.
    pub fn clear_inbox(&self, worker_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute(
                "DELETE FROM messages WHERE recipient = ?1",
                params![worker_id],
            )
            .map_err(|e| store_err_with("Failed to clear inbox", e))?;

        if deleted > 0 {
            debug!(worker = worker_id, deleted, "Inbox cleared");
        }

        Ok(deleted)
    }

    pub fn unread_count(&self, worker_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE (recipient = ?1 OR recipient = ?2) AND read = 0",
                params![worker_id, BROADCAST],
                |row| row.get(0),
            )
            .map_err(|e| store_err_with("Failed to count unread", e))?;

        Ok(count as usize)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let metadata: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let read: i64 = row.get(7)?;

    Ok(Message {
        id: row.get(0)?,
        sender: row.get(1)?,
        recipient: Recipient::parse(&row.get::<_, String>(2)?),
        kind: MessageKind::parse(&row.get::<_, String>(3)?),
        content: row.get(4)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        read: read != 0,
    })
}

impl Clone for MessageExchange {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            db_path: self.db_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_exchange() -> (TempDir, MessageExchange) {
        let dir = TempDir::new().unwrap();
        let exchange = MessageExchange::new(dir.path().join("messages.db")).unwrap();
        (dir, exchange)
    }

    #[test]
    fn test_send_then_read_exactly_once_unread() {
        let (_dir, exchange) = temp_exchange();

        let id = exchange
            .send(
                "w1",
                Recipient::worker("w2"),
                MessageKind::Request,
                "need the schema",
                HashMap::new(),
            )
            .unwrap();

        let unread = exchange.get_unread("w2").unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, id);

        exchange.mark_read(&id).unwrap();
        assert!(exchange.get_unread("w2").unwrap().is_empty());

        // Idempotent: a second mark has the same effect as the first.
        exchange.mark_read(&id).unwrap();
        assert!(exchange.get_unread("w2").unwrap().is_empty());
        assert_eq!(exchange.read_inbox("w2").unwrap().len(), 1);
    }

    #[test]
    fn test_broadcast_merged_into_every_inbox() {
        let (_dir, exchange) = temp_exchange();

        exchange
            .send(
                "coordinator",
                Recipient::All,
                MessageKind::Broadcast,
                "phase 2 open",
                HashMap::new(),
            )
            .unwrap();
        exchange
            .send(
                "coordinator",
                Recipient::worker("w1"),
                MessageKind::Status,
                "directed",
                HashMap::new(),
            )
            .unwrap();

        assert_eq!(exchange.read_inbox("w1").unwrap().len(), 2);
        assert_eq!(exchange.read_inbox("w2").unwrap().len(), 1);
    }

    #[test]
    fn test_inbox_order_is_insertion_order() {
        let (_dir, exchange) = temp_exchange();

        for n in 0..5 {
            exchange
                .send(
                    "coordinator",
                    Recipient::worker("w1"),
                    MessageKind::Status,
                    &format!("msg-{}", n),
                    HashMap::new(),
                )
                .unwrap();
        }

        let inbox = exchange.read_inbox("w1").unwrap();
        let contents: Vec<_> = inbox.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["msg-0", "msg-1", "msg-2", "msg-3", "msg-4"]);
    }

    #[test]
    fn test_clear_inbox_keeps_broadcasts() {
        let (_dir, exchange) = temp_exchange();

        exchange
            .send(
                "coordinator",
                Recipient::worker("w1"),
                MessageKind::Status,
                "directed",
                HashMap::new(),
            )
            .unwrap();
        exchange
            .send(
                "coordinator",
                Recipient::All,
                MessageKind::Broadcast,
                "shared",
                HashMap::new(),
            )
            .unwrap();

        let deleted = exchange.clear_inbox("w1").unwrap();
        assert_eq!(deleted, 1);

        let inbox = exchange.read_inbox("w1").unwrap();
        assert_eq!(inbox.len(), 1);
        assert!(inbox[0].is_broadcast());
        assert_eq!(exchange.read_inbox("w2").unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_recipient_never_fails() {
        let (_dir, exchange) = temp_exchange();

        exchange
            .send(
                "w1",
                Recipient::worker("nobody-yet"),
                MessageKind::Request,
                "hello",
                HashMap::new(),
            )
            .unwrap();

        assert_eq!(exchange.unread_count("nobody-yet").unwrap(), 1);
    }
}
