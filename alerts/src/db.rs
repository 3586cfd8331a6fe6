use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// A Telegram user known to the bot. Admins receive motion alerts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Option<i64>,
    pub username: String,
    pub telegram_id: String,
    pub chat_id: i64,
    pub admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: Option<i64>,
    pub message: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub read: bool,
    pub user_id: Option<i64>,
}

/// Input for [`AlertDb::create_notification`].
///
/// When `notification` is set it is stored as-is and the other fields are
/// ignored. Otherwise both `message` and `timestamp` are required.
#[derive(Debug, Clone, Default)]
pub struct CreateNotificationRequest {
    pub message: Option<String>,
    pub timestamp: Option<i64>,
    pub user_id: Option<i64>,
    pub notification: Option<Notification>,
}

#[derive(Debug, thiserror::Error)]
pub enum AlertDbError {
    #[error("invalid request: {0}")]
    Validation(&'static str),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// SQLite store for users and notifications.
///
/// WAL mode is enabled so the registration loop and the alert path can write
/// without blocking readers.
pub struct AlertDb {
    conn: Mutex<Connection>,
}

impl AlertDb {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, AlertDbError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|_e| rusqlite::Error::InvalidPath(dir.into()))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn, &path.display().to_string())
    }

    pub fn open_in_memory() -> Result<Self, AlertDbError> {
        Self::init(Connection::open_in_memory()?, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> Result<Self, AlertDbError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                username    TEXT    NOT NULL DEFAULT '',
                telegram_id TEXT    NOT NULL UNIQUE,
                chat_id     INTEGER NOT NULL,
                admin       INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS notifications (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                message     TEXT    NOT NULL,
                timestamp   INTEGER NOT NULL,
                read        INTEGER NOT NULL DEFAULT 0,
                user_id     INTEGER REFERENCES users(id) ON DELETE SET NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_ts
                ON notifications(timestamp);

            PRAGMA foreign_keys = ON;",
        )?;

        info!(path = label, "alert database opened");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- Users ------------------------------------------------------------------

    /// Insert the user, or refresh username and chat id of an existing one
    /// with the same Telegram id. An upsert can grant admin rights but never
    /// revokes them.
    pub fn upsert_user(&self, user: &User) -> Result<i64, AlertDbError> {
        let conn = self.conn();
        let id = conn.query_row(
            "INSERT INTO users (username, telegram_id, chat_id, admin)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(telegram_id) DO UPDATE SET
                username = excluded.username,
                chat_id  = excluded.chat_id,
                admin    = MAX(admin, excluded.admin)
             RETURNING id",
            params![user.username, user.telegram_id, user.chat_id, user.admin],
            |row| row.get(0),
        )?;
        debug!(id, telegram_id = user.telegram_id, "upserted user");
        Ok(id)
    }

    /// Grant or revoke admin rights. Returns false if the user is unknown.
    pub fn set_admin(&self, telegram_id: &str, admin: bool) -> Result<bool, AlertDbError> {
        let changed = self.conn().execute(
            "UPDATE users SET admin = ?1 WHERE telegram_id = ?2",
            params![admin, telegram_id],
        )?;
        Ok(changed > 0)
    }

    pub fn find_admins(&self) -> Result<Vec<User>, AlertDbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, username, telegram_id, chat_id, admin
             FROM users WHERE admin = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_user)?;
        Ok(rows.collect::<SqlResult<Vec<_>>>()?)
    }

    pub fn find_user_by_telegram_id(
        &self,
        telegram_id: &str,
    ) -> Result<Option<User>, AlertDbError> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, username, telegram_id, chat_id, admin
                 FROM users WHERE telegram_id = ?1",
                params![telegram_id],
                row_to_user,
            )
            .optional()?)
    }

    // -- Notifications ----------------------------------------------------------

    /// Store a notification. Returns the new row id.
    pub fn create_notification(&self, req: CreateNotificationRequest) -> Result<i64, AlertDbError> {
        let notification = match req {
            CreateNotificationRequest {
                notification: Some(n),
                ..
            } => n,
            CreateNotificationRequest {
                message: Some(message),
                timestamp: Some(timestamp),
                user_id,
                ..
            } => Notification {
                id: None,
                message,
                timestamp,
                read: false,
                user_id,
            },
            _ => {
                return Err(AlertDbError::Validation(
                    "message and timestamp must be provided if notification is not set",
                ))
            }
        };

        let conn = self.conn();
        conn.execute(
            "INSERT INTO notifications (message, timestamp, read, user_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                notification.message,
                notification.timestamp,
                notification.read,
                notification.user_id
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, timestamp = notification.timestamp, "inserted notification");
        Ok(id)
    }

    /// All notifications, newest first.
    pub fn list_notifications(&self) -> Result<Vec<Notification>, AlertDbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, message, timestamp, read, user_id
             FROM notifications ORDER BY timestamp DESC, id DESC",
        )?;
        let rows = stmt.query_map([], row_to_notification)?;
        Ok(rows.collect::<SqlResult<Vec<_>>>()?)
    }

    pub fn mark_read(&self, id: i64) -> Result<bool, AlertDbError> {
        let changed = self
            .conn()
            .execute("UPDATE notifications SET read = 1 WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn delete_notification(&self, id: i64) -> Result<bool, AlertDbError> {
        let changed = self
            .conn()
            .execute("DELETE FROM notifications WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }
}

fn row_to_user(row: &Row<'_>) -> SqlResult<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        telegram_id: row.get(2)?,
        chat_id: row.get(3)?,
        admin: row.get(4)?,
    })
}

fn row_to_notification(row: &Row<'_>) -> SqlResult<Notification> {
    Ok(Notification {
        id: row.get(0)?,
        message: row.get(1)?,
        timestamp: row.get(2)?,
        read: row.get(3)?,
        user_id: row.get(4)?,
    })
}
