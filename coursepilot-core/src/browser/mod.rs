//! Browser automation: the chromium session, the player page seam and
//! the playlist playback driver built on top of them.

pub mod driver;
pub mod error;
pub mod page;
pub mod poll;
pub mod session;

pub use driver::{
    DriverState, PlaybackDriver, RunEnd, RunOptions, RunOutcome, RunStatus, StopSignal, Timings,
    COMPLETION_EPSILON_SECONDS, MAX_CONSECUTIVE_ERRORS,
};
pub use error::{AutomationError, AutomationResult};
pub use page::{ControlState, PlayerPage, VideoState};
pub use session::{BrowserLauncher, BrowserSession, CdpPlayerPage, Credentials, PlaybackSession};
