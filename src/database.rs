//! SQLite persistence for study time.
//!
//! Holds the monitored channel of each server, cumulative per-learner
//! totals, a record of every persisted session (keyed so replays are
//! no-ops) and the engine's config table.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;
use crate::monitor::{ClosedSession, StudyStore};

type StoreResult<T> = Result<T, StoreError>;

/// Config keys seeded on first open, with their defaults.
const CONFIG_DEFAULTS: [(&str, &str, &str); 10] = [
    (
        "grace_period_secs",
        "300",
        "Time to turn on camera or screen share before removal (seconds)",
    ),
    (
        "exemption_window_secs",
        "600",
        "How long a verified poor connection exempts a user (seconds)",
    ),
    (
        "verdict_timeout_secs",
        "90",
        "How long to wait for a network verdict (seconds)",
    ),
    ("min_download_mbps", "2.5", "Minimum download speed for a good connection"),
    ("min_upload_mbps", "2.5", "Minimum upload speed for a good connection"),
    ("max_ping_ms", "50", "Maximum ping for a good connection"),
    (
        "notice_delete_after_secs",
        "20",
        "Auto-delete window for channel notices (seconds)",
    ),
    (
        "departure_notice_delete_after_secs",
        "90",
        "Auto-delete window for the break notice (seconds)",
    ),
    (
        "disable_accounting",
        "discard",
        "Time before activity was turned off: discard or persist",
    ),
    (
        "exemption_sweep_secs",
        "60",
        "How often expired exemptions are reclaimed (seconds)",
    ),
];

/// Monitored channel of a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerChannel {
    pub server_id: String,
    pub channel_id: String,
    pub updated_at: String,
}

/// Accumulated time of one learner on one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerTime {
    pub server_id: String,
    pub time_secs: i64,
}

/// Everything stored about a learner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LearnerRecord {
    pub user_id: String,
    pub display_name: String,
    pub total_secs: i64,
    pub servers: Vec<ServerTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: String,
    pub display_name: String,
    pub time_secs: i64,
}

/// Database wrapper with thread-safe connection.
pub struct Database {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Opens or creates the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!(path = ?parent, error = %e, "Failed to create database directory");
            }
        }

        tracing::info!(path = ?path, "Opening database");

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// `<data_dir>/studymon/study.db`
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("studymon")
            .join("study.db")
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- Monitored voice channel per server
            CREATE TABLE IF NOT EXISTS servers (
                server_id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Cumulative totals
            CREATE TABLE IF NOT EXISTS learners (
                user_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL DEFAULT '',
                total_secs INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS learner_servers (
                user_id TEXT NOT NULL,
                server_id TEXT NOT NULL,
                time_secs INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, server_id)
            );

            -- One row per persisted session; the key makes replays no-ops
            CREATE TABLE IF NOT EXISTS study_sessions (
                session_key TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                server_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT NOT NULL,
                elapsed_secs INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                description TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_learner_servers_server ON learner_servers(server_id);
            CREATE INDEX IF NOT EXISTS idx_study_sessions_user ON study_sessions(user_id);
            "#,
        )?;

        let now = Utc::now().to_rfc3339();
        let mut seeded = 0;
        for (key, value, description) in CONFIG_DEFAULTS {
            seeded += conn.execute(
                "INSERT OR IGNORE INTO config (key, value, description, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![key, value, description, &now],
            )?;
        }
        if seeded > 0 {
            tracing::info!("Added {} default config settings", seeded);
        }

        tracing::debug!("Database schema initialized");
        Ok(())
    }

    // === Server Methods ===

    /// Sets (or replaces) the monitored channel of a server.
    pub fn set_study_channel(&self, server_id: &str, channel_id: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO servers (server_id, channel_id, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(server_id) DO UPDATE SET channel_id = excluded.channel_id, updated_at = excluded.updated_at",
            params![server_id, channel_id, Utc::now().to_rfc3339()],
        )?;
        tracing::info!(server_id = %server_id, channel_id = %channel_id, "Study channel set");
        Ok(())
    }

    pub fn server_channel(&self, server_id: &str) -> StoreResult<Option<ServerChannel>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT server_id, channel_id, updated_at FROM servers WHERE server_id = ?1",
                params![server_id],
                |row| {
                    Ok(ServerChannel {
                        server_id: row.get(0)?,
                        channel_id: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Deletes a server's monitored-channel configuration. Study times
    /// recorded for the server are kept.
    ///
    /// Returns the deleted configuration, if there was one.
    pub fn delete_server(&self, server_id: &str) -> StoreResult<Option<ServerChannel>> {
        let existing = self.server_channel(server_id)?;
        self.conn()?
            .execute("DELETE FROM servers WHERE server_id = ?1", params![server_id])?;

        if existing.is_some() {
            tracing::info!(server_id = %server_id, "Server configuration deleted");
        }
        Ok(existing)
    }

    // === Learner Methods ===

    /// Adds a closed session to the learner's totals.
    ///
    /// Returns `false` without changing anything if the session key was
    /// already recorded.
    pub fn add_session(&self, session: &ClosedSession) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO study_sessions (session_key, user_id, server_id, started_at, ended_at, elapsed_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.session_key,
                session.user_id,
                session.server_id,
                session.started_at.to_rfc3339(),
                session.ended_at.to_rfc3339(),
                session.elapsed_secs as i64,
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO learners (user_id, display_name, total_secs, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                 total_secs = learners.total_secs + excluded.total_secs,
                 display_name = CASE WHEN excluded.display_name <> '' THEN excluded.display_name ELSE learners.display_name END,
                 updated_at = excluded.updated_at",
            params![
                session.user_id,
                session.display_name,
                session.elapsed_secs as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.execute(
            "INSERT INTO learner_servers (user_id, server_id, time_secs) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, server_id) DO UPDATE SET time_secs = learner_servers.time_secs + excluded.time_secs",
            params![session.user_id, session.server_id, session.elapsed_secs as i64],
        )?;

        tx.commit()?;
        Ok(true)
    }

    pub fn learner(&self, user_id: &str) -> StoreResult<Option<LearnerRecord>> {
        let conn = self.conn()?;
        let head = conn
            .query_row(
                "SELECT display_name, total_secs FROM learners WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        let Some((display_name, total_secs)) = head else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT server_id, time_secs FROM learner_servers WHERE user_id = ?1 ORDER BY time_secs DESC",
        )?;
        let servers = stmt
            .query_map(params![user_id], |row| {
                Ok(ServerTime {
                    server_id: row.get(0)?,
                    time_secs: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(LearnerRecord {
            user_id: user_id.to_string(),
            display_name,
            total_secs,
            servers,
        }))
    }

    /// Deletes everything stored about a learner and returns it.
    pub fn delete_learner(&self, user_id: &str) -> StoreResult<Option<LearnerRecord>> {
        let Some(record) = self.learner(user_id)? else {
            return Ok(None);
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM learners WHERE user_id = ?1", params![user_id])?;
        tx.execute("DELETE FROM learner_servers WHERE user_id = ?1", params![user_id])?;
        tx.execute("DELETE FROM study_sessions WHERE user_id = ?1", params![user_id])?;
        tx.commit()?;

        tracing::info!(user_id = %user_id, "Learner data deleted");
        Ok(Some(record))
    }

    /// Top learners by accumulated time, on one server or globally.
    pub fn leaderboard(
        &self,
        server_id: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<LeaderboardEntry>> {
        let conn = self.conn()?;
        let rows = match server_id {
            Some(server_id) => {
                let mut stmt = conn.prepare(
                    "SELECT ls.user_id, COALESCE(l.display_name, ''), ls.time_secs
                     FROM learner_servers ls LEFT JOIN learners l ON l.user_id = ls.user_id
                     WHERE ls.server_id = ?1 AND ls.time_secs > 0
                     ORDER BY ls.time_secs DESC, ls.user_id ASC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![server_id, limit as i64], ranked_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT user_id, display_name, total_secs FROM learners
                     WHERE total_secs > 0
                     ORDER BY total_secs DESC, user_id ASC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit as i64], ranked_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };

        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, (user_id, display_name, time_secs))| LeaderboardEntry {
                rank: i + 1,
                user_id,
                display_name,
                time_secs,
            })
            .collect())
    }

    // === Config Methods ===

    /// Gets a configuration value by key.
    pub fn get_config(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Sets a known configuration value. Returns `false` for unknown keys.
    pub fn set_config(&self, key: &str, value: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE config SET value = ?1, updated_at = ?2 WHERE key = ?3",
            params![value, &now, key],
        )?;
        Ok(changed > 0)
    }

    /// Gets all config settings.
    pub fn get_all_config(&self) -> StoreResult<Vec<(String, String, Option<String>)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, value, description FROM config ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn ranked_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

impl StudyStore for Database {
    fn study_channel(&self, server_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.server_channel(server_id)?.map(|s| s.channel_id))
    }

    fn record_session(&self, session: &ClosedSession) -> Result<bool, StoreError> {
        self.add_session(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration};

    fn session(user: &str, server: &str, started_at: DateTime<Utc>, secs: i64) -> ClosedSession {
        ClosedSession {
            session_key: crate::monitor::ledger::session_key(user, server, started_at),
            user_id: user.to_string(),
            server_id: server.to_string(),
            display_name: format!("{}-name", user),
            started_at,
            ended_at: started_at + Duration::seconds(secs),
            elapsed_secs: secs as u64,
        }
    }

    #[test]
    fn test_create_database_seeds_config() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.get_config("grace_period_secs").unwrap().as_deref(), Some("300"));
        assert_eq!(db.get_all_config().unwrap().len(), CONFIG_DEFAULTS.len());
        assert_eq!(db.get_config("missing").unwrap(), None);
    }

    #[test]
    fn test_set_config_only_known_keys() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.set_config("disable_accounting", "persist").unwrap());
        assert!(!db.set_config("nonsense", "1").unwrap());
        assert_eq!(db.get_config("disable_accounting").unwrap().as_deref(), Some("persist"));
    }

    #[test]
    fn test_study_channel_upsert_and_delete() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.study_channel("g1").unwrap(), None);

        db.set_study_channel("g1", "vc1").unwrap();
        db.set_study_channel("g1", "vc2").unwrap();
        assert_eq!(db.study_channel("g1").unwrap().as_deref(), Some("vc2"));

        let deleted = db.delete_server("g1").unwrap().unwrap();
        assert_eq!(deleted.channel_id, "vc2");
        assert_eq!(db.study_channel("g1").unwrap(), None);
        assert_eq!(db.delete_server("g1").unwrap(), None);
    }

    #[test]
    fn test_delete_server_keeps_study_times() {
        let db = Database::open_in_memory().unwrap();
        db.set_study_channel("g1", "vc").unwrap();
        db.record_session(&session("u1", "g1", Utc::now(), 240)).unwrap();

        db.delete_server("g1").unwrap();
        assert_eq!(db.study_channel("g1").unwrap(), None);
        let local = db.leaderboard(Some("g1"), 10).unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].time_secs, 240);
        assert_eq!(db.learner("u1").unwrap().unwrap().servers[0].time_secs, 240);
    }

    #[test]
    fn test_record_session_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let s = session("u1", "g1", Utc::now(), 600);

        assert!(db.record_session(&s).unwrap());
        assert!(!db.record_session(&s).unwrap());

        let learner = db.learner("u1").unwrap().unwrap();
        assert_eq!(learner.total_secs, 600);
        assert_eq!(learner.display_name, "u1-name");
        assert_eq!(learner.servers[0].time_secs, 600);
    }

    #[test]
    fn test_totals_accumulate_across_servers() {
        let db = Database::open_in_memory().unwrap();
        let start = Utc::now();
        db.record_session(&session("u1", "g1", start, 100)).unwrap();
        db.record_session(&session("u1", "g1", start + Duration::hours(1), 50)).unwrap();
        db.record_session(&session("u1", "g2", start, 30)).unwrap();

        let learner = db.learner("u1").unwrap().unwrap();
        assert_eq!(learner.total_secs, 180);
        assert_eq!(
            learner.servers,
            vec![
                ServerTime { server_id: "g1".into(), time_secs: 150 },
                ServerTime { server_id: "g2".into(), time_secs: 30 },
            ]
        );
    }

    #[test]
    fn test_leaderboard_local_and_global() {
        let db = Database::open_in_memory().unwrap();
        let start = Utc::now();
        db.record_session(&session("a", "g1", start, 300)).unwrap();
        db.record_session(&session("b", "g1", start, 500)).unwrap();
        db.record_session(&session("c", "g2", start, 900)).unwrap();

        let local = db.leaderboard(Some("g1"), 10).unwrap();
        assert_eq!(local.len(), 2);
        assert_eq!((local[0].rank, local[0].user_id.as_str()), (1, "b"));
        assert_eq!(local[1].display_name, "a-name");

        let global = db.leaderboard(None, 2).unwrap();
        assert_eq!(global.len(), 2);
        assert_eq!(global[0].user_id, "c");
        assert_eq!(global[1].user_id, "b");
    }

    #[test]
    fn test_delete_learner() {
        let db = Database::open_in_memory().unwrap();
        let s = session("u1", "g1", Utc::now(), 60);
        db.record_session(&s).unwrap();

        let deleted = db.delete_learner("u1").unwrap().unwrap();
        assert_eq!(deleted.total_secs, 60);
        assert_eq!(db.learner("u1").unwrap(), None);
        assert_eq!(db.delete_learner("u1").unwrap(), None);
        assert!(db.leaderboard(Some("g1"), 10).unwrap().is_empty());
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("study.db");
        {
            let db = Database::open(&path).unwrap();
            db.set_study_channel("g1", "vc").unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.study_channel("g1").unwrap().as_deref(), Some("vc"));
    }
}
