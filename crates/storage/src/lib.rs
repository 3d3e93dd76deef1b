use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use uuid::Uuid;

use shared::domain::{
    ChatId, InvitationId, InvitationStatus, MessageId, Participant, UserId, UserProfile,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredChat {
    pub chat_id: ChatId,
    pub is_private: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub text: String,
    pub iv: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredInvitation {
    pub id: InvitationId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub kind: String,
    pub status: InvitationStatus,
    pub sent_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn upsert_profile(&self, profile: &UserProfile) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (user_id, email, display_name) VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET email=excluded.email, display_name=excluded.display_name",
        )
        .bind(&profile.user_id.0)
        .bind(&profile.email)
        .bind(&profile.display_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_profile_by_email(&self, email: &str) -> Result<Option<UserProfile>> {
        let row = sqlx::query("SELECT user_id, email, display_name FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserProfile {
            user_id: UserId(r.get::<String, _>(0)),
            email: r.get::<String, _>(1),
            display_name: r.get::<String, _>(2),
        }))
    }

    pub async fn find_profiles_by_ids(&self, ids: &[UserId]) -> Result<Vec<UserProfile>> {
        let mut profiles = Vec::with_capacity(ids.len());
        for id in ids {
            let row =
                sqlx::query("SELECT user_id, email, display_name FROM users WHERE user_id = ?")
                    .bind(&id.0)
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some(r) = row {
                profiles.push(UserProfile {
                    user_id: UserId(r.get::<String, _>(0)),
                    email: r.get::<String, _>(1),
                    display_name: r.get::<String, _>(2),
                });
            }
        }
        Ok(profiles)
    }

    /// Creates the chat row and its initial participant rows in one transaction.
    /// The creator is always the first participant; `member_ids` keep the order
    /// supplied by the caller and duplicates collapse onto a single row.
    pub async fn create_chat(
        &self,
        creator: &UserId,
        member_ids: &[UserId],
        is_private: bool,
        creator_pub_key: Option<&str>,
    ) -> Result<ChatId> {
        let chat_id = ChatId::generate();
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO chats (chat_id, is_private, created_at) VALUES (?, ?, ?)")
            .bind(chat_id.0)
            .bind(is_private)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO chat_participants (chat_id, user_id, public_key, joined_at) VALUES (?, ?, ?, ?)",
        )
        .bind(chat_id.0)
        .bind(&creator.0)
        .bind(creator_pub_key)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        for member in member_ids {
            sqlx::query(
                "INSERT INTO chat_participants (chat_id, user_id, joined_at) VALUES (?, ?, ?)
                 ON CONFLICT(chat_id, user_id) DO NOTHING",
            )
            .bind(chat_id.0)
            .bind(&member.0)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(chat_id)
    }

    pub async fn chat_exists(&self, chat_id: ChatId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM chats WHERE chat_id = ?")
            .bind(chat_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Idempotent: returns false when the user was already a participant.
    pub async fn add_participant(
        &self,
        chat_id: ChatId,
        user_id: &UserId,
        public_key: Option<&str>,
    ) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO chat_participants (chat_id, user_id, public_key, joined_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(chat_id, user_id) DO NOTHING",
        )
        .bind(chat_id.0)
        .bind(&user_id.0)
        .bind(public_key)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted > 0)
    }

    pub async fn is_participant(&self, chat_id: ChatId, user_id: &UserId) -> Result<bool> {
        let row =
            sqlx::query("SELECT 1 FROM chat_participants WHERE chat_id = ? AND user_id = ?")
                .bind(chat_id.0)
                .bind(&user_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    pub async fn participants(&self, chat_id: ChatId) -> Result<Vec<Participant>> {
        let rows = sqlx::query(
            "SELECT user_id, joined_at, public_key
             FROM chat_participants
             WHERE chat_id = ?
             ORDER BY rowid ASC",
        )
        .bind(chat_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| Participant {
                user_id: UserId(r.get::<String, _>(0)),
                joined_at: r.get::<DateTime<Utc>, _>(1),
                public_key: r.get::<Option<String>, _>(2),
            })
            .collect())
    }

    pub async fn list_chats_for_user(&self, user_id: &UserId) -> Result<Vec<StoredChat>> {
        let rows = sqlx::query(
            "SELECT c.chat_id, c.is_private, c.created_at
             FROM chats c
             INNER JOIN chat_participants p ON p.chat_id = c.chat_id
             WHERE p.user_id = ?
             ORDER BY c.created_at DESC",
        )
        .bind(&user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredChat {
                chat_id: ChatId(r.get::<Uuid, _>(0)),
                is_private: r.get::<bool, _>(1),
                created_at: r.get::<DateTime<Utc>, _>(2),
            })
            .collect())
    }

    pub async fn append_message(
        &self,
        chat_id: ChatId,
        sender_id: &UserId,
        text: &str,
        iv: Option<&str>,
    ) -> Result<StoredMessage> {
        self.append_message_at(chat_id, sender_id, text, iv, MessageId::generate(), Utc::now())
            .await
    }

    /// Persists a message whose id and timestamp were minted by the caller.
    /// The relay stamps both before fan-out, so the stored row matches what
    /// subscribers already saw even when persistence lands out of order.
    pub async fn append_message_at(
        &self,
        chat_id: ChatId,
        sender_id: &UserId,
        text: &str,
        iv: Option<&str>,
        message_id: MessageId,
        created_at: DateTime<Utc>,
    ) -> Result<StoredMessage> {
        sqlx::query(
            "INSERT INTO messages (message_id, chat_id, sender_id, body, iv, status, created_at)
             VALUES (?, ?, ?, ?, ?, 'sent', ?)",
        )
        .bind(message_id.0)
        .bind(chat_id.0)
        .bind(&sender_id.0)
        .bind(text)
        .bind(iv)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(StoredMessage {
            message_id,
            chat_id,
            sender_id: sender_id.clone(),
            text: text.to_string(),
            iv: iv.map(str::to_string),
            created_at,
        })
    }

    /// Newest first; ties on `created_at` break on `message_id` so pagination is
    /// deterministic. Plain offset pagination, not cursor-stable under
    /// concurrent inserts.
    pub async fn list_messages(
        &self,
        chat_id: ChatId,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT message_id, chat_id, sender_id, body, iv, created_at
             FROM messages
             WHERE chat_id = ?
             ORDER BY created_at DESC, message_id DESC
             LIMIT ? OFFSET ?",
        )
        .bind(chat_id.0)
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredMessage {
                message_id: MessageId(r.get::<Uuid, _>(0)),
                chat_id: ChatId(r.get::<Uuid, _>(1)),
                sender_id: UserId(r.get::<String, _>(2)),
                text: r.get::<String, _>(3),
                iv: r.get::<Option<String>, _>(4),
                created_at: r.get::<DateTime<Utc>, _>(5),
            })
            .collect())
    }

    pub async fn create_invitation(
        &self,
        chat_id: ChatId,
        sender_id: &UserId,
        receiver_id: &UserId,
    ) -> Result<StoredInvitation> {
        let row = sqlx::query(
            "INSERT INTO invitations (chat_id, sender_id, receiver_id, sent_at) VALUES (?, ?, ?, ?)
             RETURNING id, chat_id, sender_id, receiver_id, kind, status, sent_at, responded_at",
        )
        .bind(chat_id.0)
        .bind(&sender_id.0)
        .bind(&receiver_id.0)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        invitation_from_row(&row)
    }

    pub async fn invitation(&self, id: InvitationId) -> Result<Option<StoredInvitation>> {
        let row = sqlx::query(
            "SELECT id, chat_id, sender_id, receiver_id, kind, status, sent_at, responded_at
             FROM invitations WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(invitation_from_row).transpose()
    }

    /// Moves a pending invitation to a terminal state. The conditional update
    /// makes concurrent responses race-safe: exactly one caller observes the
    /// transition, everyone else gets `None`.
    pub async fn settle_invitation(
        &self,
        id: InvitationId,
        status: InvitationStatus,
    ) -> Result<Option<StoredInvitation>> {
        let row = sqlx::query(
            "UPDATE invitations
             SET status = ?, responded_at = ?
             WHERE id = ? AND status = 'pending'
             RETURNING id, chat_id, sender_id, receiver_id, kind, status, sent_at, responded_at",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(invitation_from_row).transpose()
    }

    pub async fn list_pending_invitations(
        &self,
        receiver_id: &UserId,
    ) -> Result<Vec<StoredInvitation>> {
        let rows = sqlx::query(
            "SELECT id, chat_id, sender_id, receiver_id, kind, status, sent_at, responded_at
             FROM invitations
             WHERE receiver_id = ? AND status = 'pending'
             ORDER BY sent_at DESC",
        )
        .bind(&receiver_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(invitation_from_row).collect()
    }
}

fn invitation_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredInvitation> {
    let status = match row.get::<String, _>(5).as_str() {
        "accepted" => InvitationStatus::Accepted,
        "rejected" => InvitationStatus::Rejected,
        _ => InvitationStatus::Pending,
    };
    Ok(StoredInvitation {
        id: InvitationId(row.get::<i64, _>(0)),
        chat_id: ChatId(row.get::<Uuid, _>(1)),
        sender_id: UserId(row.get::<String, _>(2)),
        receiver_id: UserId(row.get::<String, _>(3)),
        kind: row.get::<String, _>(4),
        status,
        sent_at: row.get::<DateTime<Utc>, _>(6),
        responded_at: row.get::<Option<DateTime<Utc>>, _>(7),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
