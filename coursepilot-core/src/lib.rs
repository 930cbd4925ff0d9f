pub mod browser;
pub mod config;
pub mod error;
pub mod platform;
pub mod quiz;
pub mod recorder;
pub mod sqlite;

pub use browser::{
    AutomationError, AutomationResult, BrowserLauncher, BrowserSession, ControlState, Credentials,
    DriverState, PlaybackDriver, PlaybackSession, PlayerPage, RunEnd, RunOptions, RunOutcome,
    RunStatus, StopSignal, Timings, VideoState,
};
pub use config::{
    load_automation_config, AutomationConfig, ChromiumSection, FlagsSection, PlaybackSpeed,
    QuizSection, TimingSection,
};
pub use error::{ConfigError, Result};
pub use platform::{Platform, SelectorSet};
pub use quiz::{AnswerModel, KeywordHeuristicModel, QuizAnswer, QuizOutcome, QuizPrompt, QuizRunner};
pub use recorder::{
    ActivityLogEntry, LogStatus, ProgressRecorder, RecorderError, RecorderResult, SqliteRecorder,
};
