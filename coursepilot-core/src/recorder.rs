use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use crate::platform::Platform;
use crate::sqlite::configure_connection;

pub type RecorderResult<T> = Result<T, RecorderError>;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("failed to open progress database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Error,
    Warning,
    Info,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Error => "error",
            LogStatus::Warning => "warning",
            LogStatus::Info => "info",
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only activity record. Write-only from the driver's
/// perspective; the CLI reads them back for human chronology only.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityLogEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub message: String,
    pub status: LogStatus,
    pub details: Option<String>,
}

impl ActivityLogEntry {
    pub fn new(action: &str, message: impl Into<String>, status: LogStatus) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.to_string(),
            message: message.into(),
            status,
            details: None,
        }
    }
}

/// Durable sink for per-run progress. At-least-once semantics: the
/// driver may re-issue any of these after a retried iteration, so every
/// write is an upsert or an append.
pub trait ProgressRecorder: Send + Sync {
    fn record_video(
        &self,
        user: Option<i64>,
        platform: Platform,
        url: &str,
        title: Option<&str>,
    ) -> RecorderResult<()>;

    fn mark_video_complete(
        &self,
        user: Option<i64>,
        url: &str,
        completed_at: DateTime<Utc>,
    ) -> RecorderResult<()>;

    fn upsert_playlist_progress(
        &self,
        user: Option<i64>,
        playlist_url: &str,
        videos_watched: u32,
        last_video_url: Option<&str>,
        is_complete: bool,
    ) -> RecorderResult<()>;

    fn append_log(&self, user: Option<i64>, entry: &ActivityLogEntry) -> RecorderResult<()>;

    fn record_quiz_attempt(
        &self,
        user: Option<i64>,
        platform: Platform,
        question: &str,
        options: &[String],
        chosen: Option<&str>,
        confidence: f64,
        submitted: bool,
    ) -> RecorderResult<()>;

    fn cached_quiz_answer(&self, question_hash: &str) -> RecorderResult<Option<String>>;

    fn cache_quiz_answer(
        &self,
        question_hash: &str,
        question: &str,
        answer: &str,
    ) -> RecorderResult<()>;
}

/// SQLite-backed recorder. Holds path and flags only; a connection is
/// opened per call so the handle stays cheap to clone across runs.
#[derive(Debug, Clone)]
pub struct SqliteRecorder {
    path: PathBuf,
    flags: OpenFlags,
}

const LEARNING_SCHEMA: &str = include_str!("../sql/learning.sql");

impl SqliteRecorder {
    pub fn new(path: impl AsRef<Path>) -> RecorderResult<Self> {
        let recorder = Self {
            path: path.as_ref().to_path_buf(),
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };
        recorder.initialize()?;
        Ok(recorder)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> RecorderResult<Connection> {
        let conn =
            Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
                RecorderError::Open {
                    source,
                    path: self.path.clone(),
                }
            })?;
        configure_connection(&conn).map_err(|source| RecorderError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    fn initialize(&self) -> RecorderResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = self.open()?;
        conn.execute_batch(LEARNING_SCHEMA)?;
        Ok(())
    }
}

fn user_key(user: Option<i64>) -> i64 {
    user.unwrap_or(0)
}

impl ProgressRecorder for SqliteRecorder {
    fn record_video(
        &self,
        user: Option<i64>,
        platform: Platform,
        url: &str,
        title: Option<&str>,
    ) -> RecorderResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO videos (user_id, platform, url, title, watched_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, url) DO UPDATE SET
                 title = COALESCE(excluded.title, title),
                 watched_at = excluded.watched_at",
            params![user_key(user), platform.as_str(), url, title, Utc::now()],
        )?;
        Ok(())
    }

    fn mark_video_complete(
        &self,
        user: Option<i64>,
        url: &str,
        completed_at: DateTime<Utc>,
    ) -> RecorderResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE videos SET completed = 1, watched_at = ?3
             WHERE user_id = ?1 AND url = ?2",
            params![user_key(user), url, completed_at],
        )?;
        Ok(())
    }

    fn upsert_playlist_progress(
        &self,
        user: Option<i64>,
        playlist_url: &str,
        videos_watched: u32,
        last_video_url: Option<&str>,
        is_complete: bool,
    ) -> RecorderResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO playlist_progress
                 (user_id, playlist_url, total_videos_watched, last_watched_at,
                  last_video_url, is_complete)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id, playlist_url) DO UPDATE SET
                 total_videos_watched = excluded.total_videos_watched,
                 last_watched_at = excluded.last_watched_at,
                 last_video_url = COALESCE(excluded.last_video_url, last_video_url),
                 is_complete = excluded.is_complete",
            params![
                user_key(user),
                playlist_url,
                videos_watched as i64,
                Utc::now(),
                last_video_url,
                is_complete,
            ],
        )?;
        Ok(())
    }

    fn append_log(&self, user: Option<i64>, entry: &ActivityLogEntry) -> RecorderResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO activity_logs (user_id, ts, action, message, status, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_key(user),
                entry.timestamp,
                entry.action,
                entry.message,
                entry.status.as_str(),
                entry.details,
            ],
        )?;
        Ok(())
    }

    fn record_quiz_attempt(
        &self,
        user: Option<i64>,
        platform: Platform,
        question: &str,
        options: &[String],
        chosen: Option<&str>,
        confidence: f64,
        submitted: bool,
    ) -> RecorderResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO quizzes
                 (user_id, platform, question, options, chosen_answer, confidence, submitted, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user_key(user),
                platform.as_str(),
                question,
                serde_json::to_string(options)?,
                chosen,
                confidence,
                submitted,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    fn cached_quiz_answer(&self, question_hash: &str) -> RecorderResult<Option<String>> {
        let conn = self.open()?;
        let answer: Option<String> = conn
            .query_row(
                "SELECT cached_answer FROM quiz_cache WHERE question_hash = ?1",
                params![question_hash],
                |row| row.get(0),
            )
            .optional()?;
        if answer.is_some() {
            conn.execute(
                "UPDATE quiz_cache SET times_used = times_used + 1, last_used = ?2
                 WHERE question_hash = ?1",
                params![question_hash, Utc::now()],
            )?;
        }
        Ok(answer)
    }

    fn cache_quiz_answer(
        &self,
        question_hash: &str,
        question: &str,
        answer: &str,
    ) -> RecorderResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO quiz_cache (question_hash, question_text, cached_answer, last_used)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(question_hash) DO UPDATE SET
                 cached_answer = excluded.cached_answer,
                 last_used = excluded.last_used",
            params![question_hash, question, answer, Utc::now()],
        )?;
        Ok(())
    }
}
