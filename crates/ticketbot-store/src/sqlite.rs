//! SQLite-backed team registry and response ledger with durable persistence.

use crate::{
    BotResponse, MessageHandle, ResponseKey, ResponseLedger, StoreError, StoreResult, Team,
    TeamRegistry, TicketSet,
};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Busy timeout applied to every connection unless overridden.
pub const DEFAULT_SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Persistent SQLite store used in production deployments.
///
/// Every call opens its own connection on the blocking thread pool, so a
/// locked database never stalls the async runtime.
#[derive(Debug)]
pub struct SqliteLinkStore {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteLinkStore {
    /// Opens a SQLite-backed store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let connection = open_connection(&db_path, DEFAULT_SQLITE_BUSY_TIMEOUT)?;
        initialize_schema(&connection)?;
        Ok(Self {
            db_path,
            busy_timeout: DEFAULT_SQLITE_BUSY_TIMEOUT,
        })
    }

    /// Caps how long a call waits on a locked database before failing with `DatabaseBusy`.
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }

    async fn with_connection<T, F>(&self, work: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        let busy_timeout = self.busy_timeout;
        tokio::task::spawn_blocking(move || {
            let mut connection = open_connection(&db_path, busy_timeout)?;
            work(&mut connection)
        })
        .await?
    }
}

fn open_connection(db_path: &Path, busy_timeout: Duration) -> StoreResult<Connection> {
    let connection = Connection::open(db_path)?;
    connection.busy_timeout(busy_timeout)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    Ok(connection)
}

fn initialize_schema(connection: &Connection) -> StoreResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS teams (
            team_id TEXT PRIMARY KEY,
            tracker_url TEXT NULL,
            no_url_error_sent INTEGER NOT NULL DEFAULT 0,
            access_token TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS bot_responses (
            team_id TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            message_id TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            tickets_json TEXT NOT NULL,
            PRIMARY KEY (team_id, channel_id, message_id),
            FOREIGN KEY(team_id) REFERENCES teams(team_id)
        );
        "#,
    )?;
    Ok(())
}

fn read_team(connection: &Connection, team_id: &str) -> StoreResult<Option<Team>> {
    let row = connection
        .query_row(
            "SELECT team_id, tracker_url, no_url_error_sent, access_token
             FROM teams WHERE team_id = ?1",
            params![team_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    row.map(|(team_id, tracker_url, flag, access_token)| {
        Ok(Team {
            team_id,
            tracker_url,
            no_url_error_sent: flag_from_db(flag)?,
            access_token,
        })
    })
    .transpose()
}

fn write_response(connection: &Connection, response: &BotResponse) -> StoreResult<()> {
    connection.execute(
        r#"
        INSERT INTO bot_responses (
            team_id, channel_id, message_id, payload_json, tickets_json
        ) VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(team_id, channel_id, message_id) DO UPDATE SET
            payload_json = excluded.payload_json,
            tickets_json = excluded.tickets_json
        "#,
        params![
            response.key.team_id,
            response.key.channel_id,
            response.key.message_id,
            serialize_json(&response.handle)?,
            serialize_json(&response.tickets)?,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl TeamRegistry for SqliteLinkStore {
    async fn get_team(&self, team_id: &str) -> StoreResult<Option<Team>> {
        let team_id = team_id.to_string();
        self.with_connection(move |connection| read_team(connection, &team_id))
            .await
    }

    async fn upsert_team(&self, team_id: &str, access_token: &str) -> StoreResult<Team> {
        let team_id = team_id.to_string();
        let access_token = access_token.to_string();
        self.with_connection(move |connection| {
            connection.execute(
                r#"
                INSERT INTO teams (team_id, access_token) VALUES (?1, ?2)
                ON CONFLICT(team_id) DO UPDATE SET access_token = excluded.access_token
                "#,
                params![team_id, access_token],
            )?;
            read_team(connection, &team_id)?.ok_or(StoreError::TeamNotFound(team_id))
        })
        .await
    }

    async fn set_tracker_url(&self, team_id: &str, url: &str) -> StoreResult<()> {
        let team_id = team_id.to_string();
        let url = url.to_string();
        self.with_connection(move |connection| {
            let updated = connection.execute(
                "UPDATE teams SET tracker_url = ?1 WHERE team_id = ?2",
                params![url, team_id],
            )?;
            if updated == 0 {
                return Err(StoreError::TeamNotFound(team_id));
            }
            Ok(())
        })
        .await
    }

    async fn set_no_url_error_sent(&self, team_id: &str, sent: bool) -> StoreResult<()> {
        let team_id = team_id.to_string();
        self.with_connection(move |connection| {
            let updated = connection.execute(
                "UPDATE teams SET no_url_error_sent = ?1 WHERE team_id = ?2",
                params![i64::from(sent), team_id],
            )?;
            if updated == 0 {
                return Err(StoreError::TeamNotFound(team_id));
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ResponseLedger for SqliteLinkStore {
    async fn get_response(&self, key: &ResponseKey) -> StoreResult<Option<BotResponse>> {
        let key = key.clone();
        self.with_connection(move |connection| {
            let row = connection
                .query_row(
                    "SELECT payload_json, tickets_json FROM bot_responses
                     WHERE team_id = ?1 AND channel_id = ?2 AND message_id = ?3",
                    params![key.team_id, key.channel_id, key.message_id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;

            row.map(|(payload_json, tickets_json)| {
                Ok(BotResponse {
                    handle: deserialize_json::<MessageHandle>(&payload_json)?,
                    tickets: deserialize_json::<TicketSet>(&tickets_json)?,
                    key,
                })
            })
            .transpose()
        })
        .await
    }

    async fn insert_response(&self, response: BotResponse) -> StoreResult<()> {
        self.with_connection(move |connection| {
            let transaction =
                connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let exists = transaction
                .query_row(
                    "SELECT 1 FROM bot_responses
                     WHERE team_id = ?1 AND channel_id = ?2 AND message_id = ?3",
                    params![
                        response.key.team_id,
                        response.key.channel_id,
                        response.key.message_id
                    ],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(StoreError::ResponseAlreadyExists(response.key));
            }

            write_response(&transaction, &response)?;
            transaction.commit()?;
            Ok(())
        })
        .await
    }

    async fn put_response(&self, response: BotResponse) -> StoreResult<()> {
        self.with_connection(move |connection| write_response(connection, &response))
            .await
    }

    async fn delete_response(&self, key: &ResponseKey) -> StoreResult<bool> {
        let key = key.clone();
        self.with_connection(move |connection| {
            let deleted = connection.execute(
                "DELETE FROM bot_responses
                 WHERE team_id = ?1 AND channel_id = ?2 AND message_id = ?3",
                params![key.team_id, key.channel_id, key.message_id],
            )?;
            Ok(deleted > 0)
        })
        .await
    }
}

fn serialize_json<T: Serialize>(value: &T) -> StoreResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn deserialize_json<T: DeserializeOwned>(value: &str) -> StoreResult<T> {
    Ok(serde_json::from_str(value)?)
}

fn flag_from_db(value: i64) -> StoreResult<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(StoreError::InvalidPersistedValue {
            field: "no_url_error_sent",
            value: other.to_string(),
        }),
    }
}
