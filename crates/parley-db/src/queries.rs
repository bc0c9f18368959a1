use std::collections::HashMap;

use anyhow::{Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, TransactionBehavior, params, params_from_iter};
use uuid::Uuid;

use parley_types::models::{ConversationView, MessageView, ParticipantView, UserSummary};

use crate::Database;
use crate::models::{ConversationRow, NewMessage, SendOutcome, UsernameOutcome};

const MESSAGE_COLUMNS: &str =
    "m.id, m.conversation_id, m.sender_id, u.username, m.body, m.created_at";

/// Ids bound per `IN (...)` query; well under SQLite's variable limit.
const LOAD_BATCH: usize = 256;

impl Database {
    // -- Users --

    pub fn create_user(&self, id: Uuid, username: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, created_at) VALUES (?1, ?2, ?3)",
                params![id.to_string(), username, timestamp(Utc::now())],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<UserSummary>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username FROM users WHERE id = ?1",
                [id.to_string()],
                |row| {
                    Ok(UserSummary {
                        id: uuid_at(row, 0)?,
                        username: row.get(1)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Returns the first id in `ids` that has no user row.
    pub fn find_missing_user(&self, ids: &[Uuid]) -> Result<Option<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT 1 FROM users WHERE id = ?1")?;
            for id in ids {
                if !stmt.exists([id.to_string()])? {
                    return Ok(Some(*id));
                }
            }
            Ok(None)
        })
    }

    /// Case-insensitive substring match on username, excluding `exclude`.
    pub fn search_users(&self, term: &str, exclude: Uuid) -> Result<Vec<UserSummary>> {
        let pattern = format!("%{}%", escape_like(term));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username FROM users
                 WHERE username LIKE ?1 ESCAPE '\\' AND id != ?2
                 ORDER BY username",
            )?;
            let rows = stmt
                .query_map(params![pattern, exclude.to_string()], |row| {
                    Ok(UserSummary {
                        id: uuid_at(row, 0)?,
                        username: row.get(1)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Claims `username` for `id`, creating the user row if the session
    /// layer has not registered it yet.
    pub fn set_username(&self, id: Uuid, username: &str) -> Result<UsernameOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let uid = id.to_string();

            // The column collates NOCASE, so this finds any casing of the name
            let owner: Option<String> = tx
                .query_row(
                    "SELECT id FROM users WHERE username = ?1",
                    [username],
                    |row| row.get(0),
                )
                .optional()?;
            if owner.is_some_and(|owner| owner != uid) {
                return Ok(UsernameOutcome::Taken);
            }

            tx.execute(
                "INSERT INTO users (id, username, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET username = excluded.username",
                params![uid, username, timestamp(Utc::now())],
            )?;
            tx.commit()?;
            Ok(UsernameOutcome::Updated)
        })
    }

    // -- Conversations --

    /// Inserts the conversation and one participant row per user as a single
    /// unit. Only `seen_by` starts with the latest message marked as seen.
    ///
    /// `on_commit` runs once the unit has committed, before the connection
    /// lock is released, so callbacks observe commits in commit order.
    pub fn create_conversation(
        &self,
        id: Uuid,
        participant_ids: &[Uuid],
        seen_by: Uuid,
        on_commit: impl FnOnce(&ConversationView),
    ) -> Result<ConversationView> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = timestamp(Utc::now());

            tx.execute(
                "INSERT INTO conversations (id, created_at, updated_at) VALUES (?1, ?2, ?2)",
                params![id.to_string(), now],
            )?;

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO participants (id, conversation_id, user_id, has_seen_latest_message)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for user_id in participant_ids {
                    stmt.execute(params![
                        Uuid::new_v4().to_string(),
                        id.to_string(),
                        user_id.to_string(),
                        *user_id == seen_by,
                    ])?;
                }
            }

            let conversation = load_conversation(&tx, id)?
                .ok_or_else(|| anyhow!("Conversation {} missing after insert", id))?;
            tx.commit()?;
            on_commit(&conversation);
            Ok(conversation)
        })
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Option<ConversationView>> {
        self.with_conn(|conn| load_conversation(conn, id))
    }

    /// Conversations `user_id` participates in, most recently updated first.
    pub fn list_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationView>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id FROM conversations c
                 JOIN participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY c.updated_at DESC, c.rowid ASC",
            )?;
            let ids = stmt
                .query_map([user_id.to_string()], |row| uuid_at(row, 0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            load_conversations(conn, &ids)
        })
    }

    pub fn conversation_exists(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            Ok(conn.prepare("SELECT 1 FROM conversations WHERE id = ?1")?
                .exists([id.to_string()])?)
        })
    }

    pub fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            Ok(conn
                .prepare("SELECT 1 FROM participants WHERE conversation_id = ?1 AND user_id = ?2")?
                .exists([conversation_id.to_string(), user_id.to_string()])?)
        })
    }

    /// Returns false when `user_id` has no participant row in the conversation.
    pub fn mark_conversation_read(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE participants SET has_seen_latest_message = 1
                 WHERE conversation_id = ?1 AND user_id = ?2",
                [conversation_id.to_string(), user_id.to_string()],
            )?;
            Ok(updated > 0)
        })
    }

    /// Deletes messages, participants and the conversation row as one unit and
    /// returns the conversation as it was before deletion. `on_commit` gets
    /// that snapshot under the connection lock.
    pub fn delete_conversation(
        &self,
        id: Uuid,
        on_commit: impl FnOnce(&ConversationView),
    ) -> Result<Option<ConversationView>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(snapshot) = load_conversation(&tx, id)? else {
                return Ok(None);
            };

            let cid = id.to_string();
            // Release the latest-message reference before its row goes
            tx.execute(
                "UPDATE conversations SET latest_message_id = NULL WHERE id = ?1",
                [&cid],
            )?;
            tx.execute("DELETE FROM messages WHERE conversation_id = ?1", [&cid])?;
            tx.execute("DELETE FROM participants WHERE conversation_id = ?1", [&cid])?;
            tx.execute("DELETE FROM conversations WHERE id = ?1", [&cid])?;
            tx.commit()?;
            on_commit(&snapshot);

            Ok(Some(snapshot))
        })
    }

    // -- Messages --

    /// Inserts the message and moves the conversation's projection onto it in
    /// one IMMEDIATE transaction: `latest_message_id` points at the new
    /// message and only the sender's participant row is marked as seen.
    /// `on_commit` runs after the commit, still under the connection lock.
    pub fn send_message(
        &self,
        msg: &NewMessage<'_>,
        on_commit: impl FnOnce(&MessageView, &ConversationView),
    ) -> Result<SendOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let cid = msg.conversation_id.to_string();
            let mid = msg.id.to_string();

            let exists = tx
                .prepare("SELECT 1 FROM conversations WHERE id = ?1")?
                .exists([&cid])?;
            if !exists {
                return Ok(SendOutcome::ConversationNotFound);
            }

            let participant_id: Option<String> = tx
                .query_row(
                    "SELECT id FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
                    [&cid, &msg.sender_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(participant_id) = participant_id else {
                return Ok(SendOutcome::NotParticipant);
            };

            let taken = tx.prepare("SELECT 1 FROM messages WHERE id = ?1")?.exists([&mid])?;
            if taken {
                return Ok(SendOutcome::DuplicateId);
            }

            let now = timestamp(Utc::now());
            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![mid, cid, msg.sender_id.to_string(), msg.body, now],
            )?;
            tx.execute(
                "UPDATE conversations SET latest_message_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![mid, now, cid],
            )?;
            tx.execute(
                "UPDATE participants SET has_seen_latest_message = (id = ?1)
                 WHERE conversation_id = ?2",
                params![participant_id, cid],
            )?;

            let message = query_message(&tx, &mid)?
                .ok_or_else(|| anyhow!("Message {} missing after insert", mid))?;
            let conversation = load_conversation(&tx, msg.conversation_id)?
                .ok_or_else(|| anyhow!("Conversation {} missing after update", cid))?;
            tx.commit()?;
            on_commit(&message, &conversation);

            Ok(SendOutcome::Sent {
                message,
                conversation,
            })
        })
    }

    /// Messages of a conversation, newest first.
    pub fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<MessageView>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM messages m
                 JOIN users u ON u.id = m.sender_id
                 WHERE m.conversation_id = ?1
                 ORDER BY m.created_at DESC, m.rowid DESC"
            ))?;
            let rows = stmt
                .query_map([conversation_id.to_string()], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn load_conversation(conn: &Connection, id: Uuid) -> Result<Option<ConversationView>> {
    Ok(load_conversations(conn, &[id])?.pop())
}

/// Batch-load conversations with participants and latest messages, keeping
/// the order of `ids`. Ids without a row are skipped.
fn load_conversations(conn: &Connection, ids: &[Uuid]) -> Result<Vec<ConversationView>> {
    let mut conversations = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(LOAD_BATCH) {
        conversations.extend(load_batch(conn, chunk)?);
    }
    Ok(conversations)
}

fn load_batch(conn: &Connection, ids: &[Uuid]) -> Result<Vec<ConversationView>> {
    if ids.is_empty() {
        return Ok(vec![]);
    }

    let keys: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    let placeholders = placeholders(keys.len());

    let mut stmt = conn.prepare(&format!(
        "SELECT id, latest_message_id, created_at, updated_at
         FROM conversations WHERE id IN ({placeholders})"
    ))?;
    let mut rows: HashMap<Uuid, ConversationRow> = stmt
        .query_map(params_from_iter(keys.iter()), |row| {
            Ok(ConversationRow {
                id: uuid_at(row, 0)?,
                latest_message_id: opt_uuid_at(row, 1)?,
                created_at: time_at(row, 2)?,
                updated_at: time_at(row, 3)?,
            })
        })?
        .map(|r| r.map(|row| (row.id, row)))
        .collect::<std::result::Result<_, _>>()?;

    let mut stmt = conn.prepare(&format!(
        "SELECT p.id, p.conversation_id, p.user_id, u.username, p.has_seen_latest_message
         FROM participants p
         JOIN users u ON u.id = p.user_id
         WHERE p.conversation_id IN ({placeholders})
         ORDER BY p.rowid"
    ))?;
    let mut participants: HashMap<Uuid, Vec<ParticipantView>> = HashMap::new();
    let participant_rows = stmt.query_map(params_from_iter(keys.iter()), |row| {
        Ok((
            uuid_at(row, 1)?,
            ParticipantView {
                id: uuid_at(row, 0)?,
                user: UserSummary {
                    id: uuid_at(row, 2)?,
                    username: row.get(3)?,
                },
                has_seen_latest_message: row.get(4)?,
            },
        ))
    })?;
    for row in participant_rows {
        let (conversation_id, participant) = row?;
        participants.entry(conversation_id).or_default().push(participant);
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS}
         FROM conversations c
         JOIN messages m ON m.id = c.latest_message_id
         JOIN users u ON u.id = m.sender_id
         WHERE c.id IN ({placeholders})"
    ))?;
    let mut latest: HashMap<Uuid, MessageView> = stmt
        .query_map(params_from_iter(keys.iter()), message_from_row)?
        .map(|r| r.map(|m| (m.conversation_id, m)))
        .collect::<std::result::Result<_, _>>()?;

    Ok(ids
        .iter()
        .filter_map(|id| rows.remove(id))
        .map(|row| ConversationView {
            id: row.id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            latest_message_id: row.latest_message_id,
            latest_message: latest.remove(&row.id),
            participants: participants.remove(&row.id).unwrap_or_default(),
        })
        .collect())
}

fn query_message(conn: &Connection, id: &str) -> Result<Option<MessageView>> {
    conn.query_row(
        &format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             JOIN users u ON u.id = m.sender_id
             WHERE m.id = ?1"
        ),
        [id],
        message_from_row,
    )
    .optional()
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageView> {
    Ok(MessageView {
        id: uuid_at(row, 0)?,
        conversation_id: uuid_at(row, 1)?,
        sender: UserSummary {
            id: uuid_at(row, 2)?,
            username: row.get(3)?,
        },
        body: row.get(4)?,
        created_at: time_at(row, 5)?,
    })
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        s.parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
