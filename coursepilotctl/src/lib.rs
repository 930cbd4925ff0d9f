use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use coursepilot_core::{
    load_automation_config, AutomationError, BrowserLauncher, Credentials, Platform,
    PlaybackDriver, PlaybackSession, PlaybackSpeed, ProgressRecorder, RunOptions, SqliteRecorder,
};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Runtime;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] coursepilot_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("progress store error: {0}")]
    Recorder(#[from] coursepilot_core::RecorderError),
    #[error("automation error: {0}")]
    Automation(#[from] AutomationError),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Playlist automation control interface", long_about = None)]
pub struct Cli {
    /// Path to automation.toml
    #[arg(long, default_value = "configs/automation.toml")]
    pub config: PathBuf,
    /// Path to the progress database
    #[arg(long, default_value = "data/learning.sqlite")]
    pub db: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Drive a playlist until it ends or is interrupted
    Run(RunArgs),
    /// Show stored playlist progress
    Progress(ProgressArgs),
    /// Show recent activity log entries
    Logs(LogsArgs),
    /// List the playback speeds the platforms accept
    Speeds,
    /// Emit shell completions
    Completions { shell: Shell },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Playlist or first-video URL
    #[arg(long)]
    pub playlist: String,
    /// Target platform
    #[arg(long)]
    pub platform: Platform,
    /// Playback speed
    #[arg(long, default_value = "1.0")]
    pub speed: PlaybackSpeed,
    /// Stop after this many videos
    #[arg(long)]
    pub limit: Option<u32>,
    /// Run with a visible browser window
    #[arg(long, default_value_t = false)]
    pub headful: bool,
    /// Numeric user the progress is recorded under
    #[arg(long)]
    pub user: Option<i64>,
    /// Attempt to answer quizzes between videos
    #[arg(long = "auto-quiz", default_value_t = false)]
    pub quiz: bool,
    /// Account name for platforms that need a form login
    #[arg(long, requires = "password")]
    pub username: Option<String>,
    /// Password for the form login
    #[arg(long, requires = "username")]
    pub password: Option<String>,
}

#[derive(Args, Debug)]
pub struct ProgressArgs {
    /// Filter by user
    #[arg(long)]
    pub user: Option<i64>,
    /// Maximum rows returned
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Filter by user
    #[arg(long)]
    pub user: Option<i64>,
    /// Filter by action name
    #[arg(long)]
    pub action: Option<String>,
    /// Maximum rows returned
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

pub fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Run(args) => {
            let report = run_playlist(&cli, args)?;
            render(&report, cli.format)
        }
        Commands::Progress(args) => {
            let rows = progress_rows(&cli.db, args)?;
            render(&rows, cli.format)
        }
        Commands::Logs(args) => {
            let rows = log_rows(&cli.db, args)?;
            render(&rows, cli.format)
        }
        Commands::Speeds => {
            let rows: Vec<SpeedRow> = PlaybackSpeed::ALL
                .into_iter()
                .map(|speed| SpeedRow {
                    value: speed.as_f64(),
                    label: speed.to_string(),
                })
                .collect();
            render(&rows, cli.format)
        }
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            let name = command.get_name().to_string();
            clap_complete::generate(*shell, &mut command, name, &mut std::io::stdout());
            Ok(())
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub end: String,
    pub videos_watched: u32,
    pub last_video_url: Option<String>,
}

fn run_playlist(cli: &Cli, args: &RunArgs) -> Result<RunReport> {
    let config = load_automation_config(&cli.config)?;
    let recorder: std::sync::Arc<dyn ProgressRecorder> =
        std::sync::Arc::new(SqliteRecorder::new(&cli.db)?);

    let headless = !args.headful && config.chromium.headless;
    let session = PlaybackSession::new(args.platform, args.speed)
        .headless(headless)
        .user(args.user);
    let options = RunOptions {
        video_limit: args.limit,
        speed: args.speed,
        auto_quiz: args.quiz || config.quiz.enabled,
        quiz_confidence: config.quiz.confidence_threshold,
    };
    let timings = (&config.timing).into();

    let runtime = Runtime::new()?;
    runtime.block_on(async move {
        let launcher = BrowserLauncher::new(config);
        let browser = launcher.launch(&session).await?;
        let page = browser.player_page().await?;

        if let (Some(username), Some(password)) = (&args.username, &args.password) {
            let credentials = Credentials {
                username: username.clone(),
                password: password.clone(),
            };
            browser.login(&page, &credentials).await?;
        }

        let mut driver =
            PlaybackDriver::new(page, recorder, session, options).with_timings(timings);

        let stop = driver.stop_signal();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("stopping after the current step...");
                stop.stop();
            }
        });

        let outcome = driver.run(&args.playlist).await;
        browser.shutdown().await?;
        let outcome = outcome?;

        Ok(RunReport {
            end: format!("{:?}", outcome.end),
            videos_watched: outcome.videos_watched,
            last_video_url: outcome.last_video_url,
        })
    })
}

#[derive(Debug, Serialize)]
pub struct ProgressRow {
    pub user_id: i64,
    pub playlist_url: String,
    pub total_videos_watched: i64,
    pub last_watched_at: Option<DateTime<Utc>>,
    pub last_video_url: Option<String>,
    pub is_complete: bool,
}

fn progress_rows(db: &PathBuf, args: &ProgressArgs) -> Result<Vec<ProgressRow>> {
    let conn = Connection::open_with_flags(db, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let mut stmt = conn.prepare(
        "SELECT user_id, playlist_url, total_videos_watched, last_watched_at,
                last_video_url, is_complete
         FROM playlist_progress
         WHERE (?1 IS NULL OR user_id = ?1)
         ORDER BY last_watched_at DESC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![args.user, args.limit as i64], |row| {
            Ok(ProgressRow {
                user_id: row.get(0)?,
                playlist_url: row.get(1)?,
                total_videos_watched: row.get(2)?,
                last_watched_at: row.get(3)?,
                last_video_url: row.get(4)?,
                is_complete: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Serialize)]
pub struct LogRow {
    pub ts: DateTime<Utc>,
    pub action: String,
    pub message: String,
    pub status: String,
}

fn log_rows(db: &PathBuf, args: &LogsArgs) -> Result<Vec<LogRow>> {
    let conn = Connection::open_with_flags(db, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let mut stmt = conn.prepare(
        "SELECT ts, action, message, status
         FROM activity_logs
         WHERE (?1 IS NULL OR user_id = ?1)
           AND (?2 IS NULL OR action = ?2)
         ORDER BY id DESC
         LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(
            rusqlite::params![args.user, args.action, args.limit as i64],
            |row| {
                Ok(LogRow {
                    ts: row.get(0)?,
                    action: row.get(1)?,
                    message: row.get(2)?,
                    status: row.get(3)?,
                })
            },
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Serialize)]
pub struct SpeedRow {
    pub value: f64,
    pub label: String,
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        format!(
            "run ended ({}) after {} videos{}",
            self.end,
            self.videos_watched,
            self.last_video_url
                .as_deref()
                .map(|url| format!(", last video {url}"))
                .unwrap_or_default()
        )
    }
}

impl DisplayFallback for Vec<ProgressRow> {
    fn display(&self) -> String {
        if self.is_empty() {
            return "no playlist progress recorded".to_string();
        }
        self.iter()
            .map(|row| {
                format!(
                    "user {} | {} | {} videos | complete: {}",
                    row.user_id, row.playlist_url, row.total_videos_watched, row.is_complete
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for Vec<LogRow> {
    fn display(&self) -> String {
        if self.is_empty() {
            return "no activity recorded".to_string();
        }
        self.iter()
            .map(|row| {
                format!(
                    "{} [{}] {}: {}",
                    row.ts.format("%Y-%m-%d %H:%M:%S"),
                    row.status,
                    row.action,
                    row.message
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for Vec<SpeedRow> {
    fn display(&self) -> String {
        self.iter()
            .map(|row| row.label.clone())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursepilot_core::{ActivityLogEntry, LogStatus};
    use tempfile::tempdir;

    #[test]
    fn cli_parses_a_run_command() {
        let cli = Cli::parse_from([
            "coursepilotctl",
            "run",
            "--playlist",
            "https://www.youtube.com/playlist?list=PL1",
            "--platform",
            "youtube",
            "--speed",
            "1.5",
            "--limit",
            "3",
        ]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.platform, Platform::Youtube);
                assert_eq!(args.speed, PlaybackSpeed::X1_5);
                assert_eq!(args.limit, Some(3));
                assert!(!args.headful);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn invalid_speed_is_rejected_by_the_parser() {
        let result = Cli::try_parse_from([
            "coursepilotctl",
            "run",
            "--playlist",
            "x",
            "--platform",
            "youtube",
            "--speed",
            "1.3",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn progress_and_logs_read_back_recorded_data() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("learning.sqlite");
        let recorder = SqliteRecorder::new(&db).unwrap();
        recorder
            .upsert_playlist_progress(Some(3), "https://yt/p", 4, Some("https://yt/v4"), true)
            .unwrap();
        recorder
            .append_log(
                Some(3),
                &ActivityLogEntry::new("video_play", "playing", LogStatus::Success),
            )
            .unwrap();

        let rows = progress_rows(
            &db,
            &ProgressArgs {
                user: Some(3),
                limit: 10,
            },
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_videos_watched, 4);
        assert!(rows[0].is_complete);

        let logs = log_rows(
            &db,
            &LogsArgs {
                user: Some(3),
                action: Some("video_play".into()),
                limit: 10,
            },
        )
        .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "success");
    }
}
