use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{Pool, Postgres, Row};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::*;

/// `NOTIFY` channel fed by the `messages_notify` trigger (payload: message id).
const MESSAGE_CHANNEL: &str = "convo_messages";

const THREAD_COLUMNS: &str =
    "id, intervention_id, team_id, thread_type, title, created_by, created_at, last_message_at, message_count";
const MESSAGE_COLUMNS: &str =
    "id, thread_id, author_id, content, attachments, metadata, created_at, deleted_at, deleted_by";
const MARKER_COLUMNS: &str = "thread_id, user_id, message_id, message_created_at, updated_at";

impl From<sqlx::Error> for RepoError {
    fn from(e: sqlx::Error) -> Self {
        RepoError::Internal(e.to_string())
    }
}

#[derive(Clone)]
pub struct PgRepo {
    pool: Pool<Postgres>,
    feed: broadcast::Sender<Message>,
}

impl PgRepo {
    pub fn new(pool: Pool<Postgres>) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self { pool, feed }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    /// Relays `NOTIFY` events into the change feed, reconnecting with backoff on failure.
    pub fn spawn_change_listener(&self) -> tokio::task::JoinHandle<()> {
        let repo = self.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_millis(200);
            loop {
                if let Err(e) = repo.relay_notifications().await {
                    warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "message listener dropped");
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(10));
            }
        })
    }

    async fn relay_notifications(&self) -> Result<(), sqlx::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(MESSAGE_CHANNEL).await?;
        info!(channel = MESSAGE_CHANNEL, "listening for new messages");
        loop {
            let notification = listener.recv().await?;
            let Ok(id) = notification.payload().parse::<Id>() else {
                warn!(payload = notification.payload(), "ignoring malformed notification");
                continue;
            };
            match self.get_message(id).await {
                Ok(msg) => { let _ = self.feed.send(msg); }
                Err(e) => warn!(message_id = id, error = %e, "could not load notified message"),
            }
        }
    }
}

fn row_to_thread(row: &PgRow) -> RepoResult<Thread> {
    let thread_type: String = row.try_get("thread_type")?;
    Ok(Thread {
        id: row.try_get("id")?,
        intervention_id: row.try_get("intervention_id")?,
        team_id: row.try_get("team_id")?,
        thread_type: thread_type.parse().map_err(RepoError::Internal)?,
        title: row.try_get("title")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        last_message_at: row.try_get("last_message_at")?,
        message_count: row.try_get("message_count")?,
    })
}

fn row_to_participant(row: &PgRow) -> RepoResult<Participant> {
    Ok(Participant {
        thread_id: row.try_get("thread_id")?,
        user_id: row.try_get("user_id")?,
        joined_at: row.try_get("joined_at")?,
        last_read_message_id: row.try_get("last_read_message_id")?,
    })
}

fn row_to_message(row: &PgRow) -> RepoResult<Message> {
    let msg = Message {
        id: row.try_get("id")?,
        thread_id: row.try_get("thread_id")?,
        author_id: row.try_get("author_id")?,
        content: Some(row.try_get("content")?),
        attachments: row.try_get("attachments")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        deleted_at: row.try_get("deleted_at")?,
        deleted_by: row.try_get("deleted_by")?,
    };
    Ok(msg.redacted())
}

fn row_to_marker(row: &PgRow) -> RepoResult<ReadMarker> {
    Ok(ReadMarker {
        thread_id: row.try_get("thread_id")?,
        user_id: row.try_get("user_id")?,
        message_id: row.try_get("message_id")?,
        message_created_at: row.try_get("message_created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl PgRepo {
    async fn ensure_thread(&self, thread_id: Id) -> RepoResult<()> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM threads WHERE id = $1)")
            .bind(thread_id)
            .fetch_one(&self.pool)
            .await?;
        if exists { Ok(()) } else { Err(RepoError::not_found(Resource::Thread, thread_id)) }
    }
}

#[async_trait]
impl ThreadRepo for PgRepo {
    async fn create_thread(&self, new: NewThread) -> RepoResult<Thread> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(&format!(
            "INSERT INTO threads (intervention_id, team_id, thread_type, title, created_by)
             VALUES ($1, $2, $3, $4, $5) RETURNING {THREAD_COLUMNS}"
        ))
        .bind(new.intervention_id)
        .bind(new.team_id)
        .bind(new.thread_type.as_str())
        .bind(&new.title)
        .bind(new.created_by)
        .fetch_one(&mut *tx)
        .await;
        let row = match inserted {
            Ok(row) => row,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(RepoError::Conflict(format!(
                    "intervention {} already has a {} thread",
                    new.intervention_id, new.thread_type
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let thread = row_to_thread(&row)?;
        for user_id in std::iter::once(new.created_by).chain(new.participants) {
            sqlx::query(
                "INSERT INTO thread_participants (thread_id, user_id) VALUES ($1, $2)
                 ON CONFLICT (thread_id, user_id) DO NOTHING",
            )
            .bind(thread.id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(thread)
    }

    async fn get_thread(&self, id: Id) -> RepoResult<Thread> {
        let row = sqlx::query(&format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RepoError::not_found(Resource::Thread, id))?;
        row_to_thread(&row)
    }

    async fn list_threads_by_intervention(&self, intervention_id: Id) -> RepoResult<Vec<Thread>> {
        let rows = sqlx::query(&format!(
            "SELECT {THREAD_COLUMNS} FROM threads WHERE intervention_id = $1
             ORDER BY COALESCE(last_message_at, created_at) DESC, id DESC"
        ))
        .bind(intervention_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_thread).collect()
    }

    async fn list_threads_for_participant(&self, user_id: Id) -> RepoResult<Vec<Thread>> {
        let rows = sqlx::query(&format!(
            "SELECT {THREAD_COLUMNS} FROM threads
             WHERE id IN (SELECT thread_id FROM thread_participants WHERE user_id = $1)
             ORDER BY id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_thread).collect()
    }

    async fn bump_activity(&self, thread_id: Id, message_at: DateTime<Utc>) -> RepoResult<()> {
        let res = sqlx::query(
            "UPDATE threads SET message_count = message_count + 1,
                    last_message_at = GREATEST(COALESCE(last_message_at, $2), $2)
             WHERE id = $1",
        )
        .bind(thread_id)
        .bind(message_at)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(RepoError::not_found(Resource::Thread, thread_id));
        }
        Ok(())
    }
}

#[async_trait]
impl ParticipantRepo for PgRepo {
    async fn add_participant(&self, thread_id: Id, user_id: Id) -> RepoResult<Participant> {
        self.ensure_thread(thread_id).await?;
        let row = sqlx::query(
            "WITH ins AS (
                 INSERT INTO thread_participants (thread_id, user_id) VALUES ($1, $2)
                 ON CONFLICT (thread_id, user_id) DO NOTHING
                 RETURNING thread_id, user_id, joined_at, last_read_message_id
             )
             SELECT * FROM ins
             UNION ALL
             SELECT thread_id, user_id, joined_at, last_read_message_id FROM thread_participants
             WHERE thread_id = $1 AND user_id = $2
             LIMIT 1",
        )
        .bind(thread_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        row_to_participant(&row)
    }

    async fn remove_participant(&self, thread_id: Id, user_id: Id) -> RepoResult<()> {
        let mut tx = self.pool.begin().await?;
        // row lock on the thread serializes concurrent membership changes
        let locked = sqlx::query("SELECT id FROM threads WHERE id = $1 FOR UPDATE")
            .bind(thread_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(RepoError::not_found(Resource::Thread, thread_id));
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM thread_participants WHERE thread_id = $1")
            .bind(thread_id)
            .fetch_one(&mut *tx)
            .await?;
        let present: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM thread_participants WHERE thread_id = $1 AND user_id = $2)",
        )
        .bind(thread_id)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;
        if !present {
            return Err(RepoError::not_found(Resource::Participant, user_id));
        }
        if count <= 1 {
            return Err(RepoError::Conflict(format!("thread {thread_id} must keep at least one participant")));
        }
        sqlx::query("DELETE FROM thread_participants WHERE thread_id = $1 AND user_id = $2")
            .bind(thread_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_participants(&self, thread_id: Id) -> RepoResult<Vec<Participant>> {
        self.ensure_thread(thread_id).await?;
        let rows = sqlx::query(
            "SELECT thread_id, user_id, joined_at, last_read_message_id FROM thread_participants
             WHERE thread_id = $1 ORDER BY joined_at, user_id",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_participant).collect()
    }
}

#[async_trait]
impl MessageRepo for PgRepo {
    async fn create_message(&self, new: NewMessage) -> RepoResult<Message> {
        let content = validate_content(&new.content)?;
        self.ensure_thread(new.thread_id).await?;
        let row = sqlx::query(&format!(
            "INSERT INTO messages (thread_id, author_id, content, attachments, metadata)
             VALUES ($1, $2, $3, $4, $5) RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(new.thread_id)
        .bind(new.author_id)
        .bind(content)
        .bind(&new.attachments)
        .bind(&new.metadata)
        .fetch_one(&self.pool)
        .await?;
        row_to_message(&row)
    }

    async fn get_message(&self, id: Id) -> RepoResult<Message> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RepoError::not_found(Resource::Message, id))?;
        row_to_message(&row)
    }

    async fn list_messages(&self, thread_id: Id, page: Page) -> RepoResult<Vec<Message>> {
        self.ensure_thread(thread_id).await?;
        let sql = match page.direction {
            PageDirection::Oldest => format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = $1
                 ORDER BY created_at ASC, id ASC LIMIT $2 OFFSET $3"
            ),
            PageDirection::Newest => format!(
                "SELECT * FROM (
                     SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = $1
                     ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3
                 ) page ORDER BY created_at ASC, id ASC"
            ),
        };
        let rows = sqlx::query(&sql)
            .bind(thread_id)
            .bind(i64::from(page.limit))
            .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn soft_delete_message(&self, id: Id, deleted_by: Id) -> RepoResult<Message> {
        let row = sqlx::query(&format!(
            "UPDATE messages SET deleted_at = COALESCE(deleted_at, now()),
                                 deleted_by = COALESCE(deleted_by, $2)
             WHERE id = $1 RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(id)
        .bind(deleted_by)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RepoError::not_found(Resource::Message, id))?;
        row_to_message(&row)
    }

    async fn count_after(&self, thread_id: Id, after: Option<(DateTime<Utc>, Id)>) -> RepoResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages
             WHERE thread_id = $1 AND deleted_at IS NULL
               AND ($2::timestamptz IS NULL OR (created_at, id) > ($2::timestamptz, $3::bigint))",
        )
        .bind(thread_id)
        .bind(after.map(|(at, _)| at))
        .bind(after.map(|(_, id)| id))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn latest_message(&self, thread_id: Id) -> RepoResult<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = $1
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_message).transpose()
    }

    async fn link_attachments(&self, message_id: Id, attachment_ids: &[String]) -> RepoResult<()> {
        let mut tx = self.pool.begin().await?;
        for attachment_id in attachment_ids {
            sqlx::query(
                "INSERT INTO message_attachments (message_id, attachment_id) VALUES ($1, $2)
                 ON CONFLICT (message_id, attachment_id) DO NOTHING",
            )
            .bind(message_id)
            .bind(attachment_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                    RepoError::not_found(Resource::Message, message_id)
                }
                other => other.into(),
            })?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ReadStateRepo for PgRepo {
    async fn get_read_marker(&self, thread_id: Id, user_id: Id) -> RepoResult<Option<ReadMarker>> {
        let row = sqlx::query(&format!(
            "SELECT {MARKER_COLUMNS} FROM read_markers WHERE thread_id = $1 AND user_id = $2"
        ))
        .bind(thread_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_marker).transpose()
    }

    async fn advance_read_marker(&self, thread_id: Id, user_id: Id, message: &Message) -> RepoResult<ReadMarker> {
        self.ensure_thread(thread_id).await?;
        let mut tx = self.pool.begin().await?;
        // the conditional update keeps the marker from moving backwards
        sqlx::query(
            "INSERT INTO read_markers (thread_id, user_id, message_id, message_created_at, updated_at)
             VALUES ($1, $2, $3, $4, now())
             ON CONFLICT (thread_id, user_id) DO UPDATE
                SET message_id = EXCLUDED.message_id,
                    message_created_at = EXCLUDED.message_created_at,
                    updated_at = now()
              WHERE (read_markers.message_created_at, read_markers.message_id)
                    <= (EXCLUDED.message_created_at, EXCLUDED.message_id)",
        )
        .bind(thread_id)
        .bind(user_id)
        .bind(message.id)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;
        let row = sqlx::query(&format!(
            "SELECT {MARKER_COLUMNS} FROM read_markers WHERE thread_id = $1 AND user_id = $2"
        ))
        .bind(thread_id)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;
        let marker = row_to_marker(&row)?;
        sqlx::query("UPDATE thread_participants SET last_read_message_id = $3 WHERE thread_id = $1 AND user_id = $2")
            .bind(thread_id)
            .bind(user_id)
            .bind(marker.message_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(marker)
    }
}

impl ChangeFeed for PgRepo {
    fn message_feed(&self) -> broadcast::Receiver<Message> {
        self.feed.subscribe()
    }
}
