use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::{PlaybackSpeed, TimingSection};
use crate::quiz::{AnswerModel, KeywordHeuristicModel, QuizOutcome, QuizRunner};
use crate::recorder::{ActivityLogEntry, LogStatus, ProgressRecorder};

use super::error::{AutomationError, AutomationResult};
use super::page::{ControlState, PlayerPage};
use super::poll::poll_until;
use super::session::PlaybackSession;

/// A video counts as finished when strictly less than this many seconds
/// remain. Platforms cut the last moments for outros and end cards, so
/// an exact-end check never fires.
pub const COMPLETION_EPSILON_SECONDS: f64 = 3.0;

/// Consecutive failed iterations tolerated before the run gives up.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Paused observations in a row before a pause is treated as the user's
/// own and playback is left alone.
const MANUAL_PAUSE_STREAK: u32 = 3;

/// Per-run knobs supplied by the caller, not the config file.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Stop after this many videos. `None` runs to the end of the
    /// playlist.
    pub video_limit: Option<u32>,
    pub speed: PlaybackSpeed,
    pub auto_quiz: bool,
    pub quiz_confidence: f64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            video_limit: None,
            speed: PlaybackSpeed::default(),
            auto_quiz: false,
            quiz_confidence: 0.7,
        }
    }
}

/// All driver wait intervals as concrete durations.
#[derive(Debug, Clone)]
pub struct Timings {
    pub ready_poll: Duration,
    pub ready_timeout: Duration,
    pub tick: Duration,
    pub ad_check: Duration,
    pub pause_check: Duration,
    pub next_click_wait: Duration,
    pub autoplay_wait: Duration,
    pub toggle_wait: Duration,
    pub advance_settle: Duration,
    pub element_wait: Duration,
    pub error_backoff: Duration,
}

impl From<&TimingSection> for Timings {
    fn from(section: &TimingSection) -> Self {
        let secs = Duration::from_secs;
        Self {
            ready_poll: secs(section.ready_poll_seconds),
            ready_timeout: secs(section.ready_timeout_seconds),
            tick: secs(section.tick_seconds),
            ad_check: secs(section.ad_check_seconds),
            pause_check: secs(section.pause_check_seconds),
            next_click_wait: secs(section.next_click_wait_seconds),
            autoplay_wait: secs(section.autoplay_wait_seconds),
            toggle_wait: secs(section.toggle_wait_seconds),
            advance_settle: secs(section.advance_settle_seconds),
            element_wait: secs(section.element_wait_seconds),
            error_backoff: secs(section.error_backoff_seconds),
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        (&TimingSection::default()).into()
    }
}

/// Where the driver currently is in the playback cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Loading,
    Ready,
    Playing,
    Ad,
    Paused,
    Complete,
    Advancing,
    Finished,
}

/// Live view of a run, published on a watch channel owned by the
/// driver instance. Observers subscribe through
/// [`PlaybackDriver::status_watch`]; the driver itself never reads it
/// back.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatus {
    pub state: DriverState,
    pub videos_watched: u32,
    pub consecutive_errors: u32,
    pub current_video: Option<String>,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self {
            state: DriverState::Idle,
            videos_watched: 0,
            consecutive_errors: 0,
            current_video: None,
        }
    }
}

/// Cooperative stop flag, sampled at every tick and wait point. Safe to
/// trigger from any thread, including a ctrl-c handler.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a run ended. Only playlist-shaped endings mark the playlist
/// complete in the progress store; giving up on errors or an operator
/// stop leaves the stored flag untouched at `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// The platform said so: the next-control was explicitly disabled.
    EndOfPlaylist,
    /// Every advance strategy failed until the error budget ran out.
    /// Indistinguishable from a broken page, so not marked complete.
    NoFurtherVideo,
    LimitReached,
    ErrorBudgetExhausted,
    Stopped,
}

impl RunEnd {
    pub fn marks_playlist_complete(self) -> bool {
        matches!(self, RunEnd::EndOfPlaylist | RunEnd::LimitReached)
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub end: RunEnd,
    pub videos_watched: u32,
    pub last_video_url: Option<String>,
}

#[derive(Debug)]
enum IterationEnd {
    Advanced,
    EndOfPlaylist,
    LimitReached,
    Stopped,
}

#[derive(Debug)]
enum MonitorEnd {
    Complete,
    Stopped,
}

#[derive(Debug)]
enum AdvanceOutcome {
    Advanced { strategy: &'static str },
    EndOfPlaylist,
}

/// Per-run mutable state. `last_counted` is the identity of the video
/// already credited to this run, so a retried iteration never counts
/// the same video twice.
#[derive(Debug, Default)]
struct RunState {
    watched: u32,
    consecutive_errors: u32,
    last_counted: Option<String>,
    completed_current: bool,
    last_video_url: Option<String>,
}

/// The playlist state machine. Owns its page for the whole run and
/// records progress through the shared recorder as it goes.
pub struct PlaybackDriver<P: PlayerPage> {
    page: P,
    recorder: Arc<dyn ProgressRecorder>,
    session: PlaybackSession,
    timings: Timings,
    options: RunOptions,
    status_tx: watch::Sender<RunStatus>,
    stop: StopSignal,
    quiz: Option<QuizRunner>,
}

impl<P: PlayerPage> PlaybackDriver<P> {
    pub fn new(
        page: P,
        recorder: Arc<dyn ProgressRecorder>,
        session: PlaybackSession,
        options: RunOptions,
    ) -> Self {
        let quiz = options.auto_quiz.then(|| {
            QuizRunner::new(
                Box::new(KeywordHeuristicModel),
                Arc::clone(&recorder),
                options.quiz_confidence,
            )
        });
        let (status_tx, _) = watch::channel(RunStatus::default());
        Self {
            page,
            recorder,
            session,
            timings: Timings::default(),
            options,
            status_tx,
            stop: StopSignal::new(),
            quiz,
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Swap in a different quiz answer model. Takes effect only when
    /// quizzes are enabled in the options.
    pub fn with_answer_model(mut self, model: Box<dyn AnswerModel>) -> Self {
        if self.options.auto_quiz {
            self.quiz = Some(QuizRunner::new(
                model,
                Arc::clone(&self.recorder),
                self.options.quiz_confidence,
            ));
        }
        self
    }

    pub fn status_watch(&self) -> watch::Receiver<RunStatus> {
        self.status_tx.subscribe()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    fn set_state(&self, state: DriverState) {
        self.status_tx.send_modify(|status| status.state = state);
    }

    fn publish(&self, update: impl FnOnce(&mut RunStatus)) {
        self.status_tx.send_modify(update);
    }

    fn user(&self) -> Option<i64> {
        self.session.user_id
    }

    fn log(&self, action: &str, message: impl Into<String>, status: LogStatus) {
        let entry = ActivityLogEntry::new(action, message, status);
        if let Err(err) = self.recorder.append_log(self.user(), &entry) {
            warn!(error = %err, action, "failed to append activity log");
        }
    }

    /// Drive the playlist at `playlist_url` until it ends, the limit is
    /// hit, the stop signal fires or the error budget runs out. Only
    /// session loss returns an `Err`.
    pub async fn run(&mut self, playlist_url: &str) -> AutomationResult<RunOutcome> {
        info!(
            session = %self.session.id,
            platform = %self.session.platform,
            speed = %self.options.speed,
            playlist = playlist_url,
            "starting playlist run"
        );
        self.log(
            "automation_start",
            format!("starting playlist {playlist_url}"),
            LogStatus::Info,
        );

        self.set_state(DriverState::Loading);
        self.page.navigate(playlist_url).await?;
        if self.session.platform == crate::platform::Platform::Youtube {
            self.ensure_autoplay_enabled().await?;
        }

        let mut state = RunState::default();
        let end = loop {
            if self.stop.is_stopped() {
                break RunEnd::Stopped;
            }

            match self.run_iteration(&mut state, playlist_url).await {
                Ok(IterationEnd::Advanced) => {
                    state.consecutive_errors = 0;
                    self.publish(|status| status.consecutive_errors = 0);
                }
                Ok(IterationEnd::EndOfPlaylist) => {
                    self.log(
                        "end_of_playlist",
                        "platform reported the playlist end",
                        LogStatus::Info,
                    );
                    break RunEnd::EndOfPlaylist;
                }
                Ok(IterationEnd::LimitReached) => break RunEnd::LimitReached,
                Ok(IterationEnd::Stopped) => break RunEnd::Stopped,
                Err(err) if err.is_session_fatal() => {
                    self.flush_on_failure(&state, playlist_url, &err);
                    return Err(err);
                }
                Err(err) => {
                    state.consecutive_errors += 1;
                    let consecutive = state.consecutive_errors;
                    self.publish(|status| status.consecutive_errors = consecutive);
                    let budget_spent = state.consecutive_errors >= MAX_CONSECUTIVE_ERRORS;
                    warn!(
                        error = %err,
                        consecutive = state.consecutive_errors,
                        "iteration failed"
                    );
                    self.log("automation_error", err.to_string(), LogStatus::Error);
                    if budget_spent {
                        if matches!(err, AutomationError::AdvanceExhausted(_)) {
                            self.log(
                                "end_of_playlist",
                                "no further video found after repeated attempts",
                                LogStatus::Warning,
                            );
                            break RunEnd::NoFurtherVideo;
                        }
                        break RunEnd::ErrorBudgetExhausted;
                    }
                    sleep(self.timings.error_backoff).await;
                }
            }
        };

        self.finish(&state, playlist_url, end)
    }

    fn finish(
        &self,
        state: &RunState,
        playlist_url: &str,
        end: RunEnd,
    ) -> AutomationResult<RunOutcome> {
        self.recorder.upsert_playlist_progress(
            self.user(),
            playlist_url,
            state.watched,
            state.last_video_url.as_deref(),
            end.marks_playlist_complete(),
        )?;
        self.log(
            "automation_complete",
            format!("run ended ({end:?}) after {} videos", state.watched),
            LogStatus::Success,
        );
        self.set_state(DriverState::Finished);
        info!(
            videos = state.watched,
            end = ?end,
            "playlist run finished"
        );
        Ok(RunOutcome {
            end,
            videos_watched: state.watched,
            last_video_url: state.last_video_url.clone(),
        })
    }

    /// Best-effort flush before surfacing a fatal error. Store errors
    /// here are swallowed so they never mask the original failure.
    fn flush_on_failure(&self, state: &RunState, playlist_url: &str, err: &AutomationError) {
        let _ = self.recorder.upsert_playlist_progress(
            self.user(),
            playlist_url,
            state.watched,
            state.last_video_url.as_deref(),
            false,
        );
        self.log(
            "automation_error",
            format!("session lost: {err}"),
            LogStatus::Error,
        );
    }

    async fn run_iteration(
        &self,
        state: &mut RunState,
        playlist_url: &str,
    ) -> AutomationResult<IterationEnd> {
        let url = self.page.current_url().await?;
        let identity = self.session.platform.video_identity(&url);
        let already_counted = state.last_counted.as_deref() == Some(identity.as_str());

        if !already_counted {
            self.play_video(&url).await?;
            state.last_counted = Some(identity.clone());
            state.last_video_url = Some(url.clone());
            state.completed_current = false;
            state.watched += 1;
            let watched = state.watched;
            self.publish(|status| status.videos_watched = watched);
            // Counted as soon as playback starts, so progress read
            // back mid-run already includes the video on screen.
            self.recorder.upsert_playlist_progress(
                self.user(),
                playlist_url,
                state.watched,
                Some(&url),
                false,
            )?;
        } else if !state.completed_current {
            // Retrying the same video after a transient error: make
            // sure it is actually moving again before monitoring.
            debug!("resuming monitoring of the current video");
            self.page
                .click_first(self.session.platform.selectors().play_buttons)
                .await?;
            self.apply_speed().await?;
            self.set_state(DriverState::Playing);
        }

        if !state.completed_current {
            match self.monitor_until_complete().await? {
                MonitorEnd::Stopped => return Ok(IterationEnd::Stopped),
                MonitorEnd::Complete => {
                    state.completed_current = true;
                    self.set_state(DriverState::Complete);
                    self.recorder
                        .mark_video_complete(self.user(), &url, Utc::now())?;
                    self.log(
                        "video_complete",
                        format!("finished video {} of this run", state.watched),
                        LogStatus::Success,
                    );
                }
            }
        }

        if let Some(limit) = self.options.video_limit {
            if state.watched >= limit {
                info!(limit, "video limit reached");
                return Ok(IterationEnd::LimitReached);
            }
        }

        self.set_state(DriverState::Advancing);
        match self.advance(&identity).await? {
            AdvanceOutcome::EndOfPlaylist => Ok(IterationEnd::EndOfPlaylist),
            AdvanceOutcome::Advanced { strategy } => {
                self.log(
                    "advance_success",
                    format!("moved to the next video via {strategy}"),
                    LogStatus::Success,
                );
                self.post_advance().await?;
                Ok(IterationEnd::Advanced)
            }
        }
    }

    /// Bring the current video from whatever state the page loaded in
    /// to actively playing at the configured speed.
    async fn play_video(&self, url: &str) -> AutomationResult<()> {
        self.set_state(DriverState::Loading);
        let ready = poll_until(self.timings.ready_poll, self.timings.ready_timeout, || async move {
            Ok(self
                .page
                .video_state()
                .await?
                .filter(|state| state.valid_duration().is_some()))
        })
        .await?;
        if ready.is_none() {
            // Keep going without a known duration; completion will be
            // detected once metadata eventually arrives.
            warn!("player metadata did not arrive in time, continuing degraded");
        }
        self.set_state(DriverState::Ready);

        self.skip_ads().await?;
        self.apply_speed().await?;

        if let Some(video) = self.page.video_state().await? {
            if video.paused {
                self.page
                    .click_first(self.session.platform.selectors().play_buttons)
                    .await?;
            }
        }
        sleep(Duration::from_secs(1)).await;
        // Playing means unpaused and actually moving. One more nudge
        // covers a first click eaten by an overlay.
        if let Some(video) = self.page.video_state().await? {
            if video.paused || video.position <= 0.0 {
                self.page
                    .click_first(self.session.platform.selectors().play_buttons)
                    .await?;
            }
        }

        let title = self.page.title().await.ok().filter(|t| !t.is_empty());
        self.recorder.record_video(
            self.user(),
            self.session.platform,
            url,
            title.as_deref(),
        )?;
        self.log(
            "video_play",
            format!("playing {url}"),
            LogStatus::Success,
        );
        let current = url.to_string();
        self.publish(|status| {
            status.state = DriverState::Playing;
            status.current_video = Some(current);
        });
        Ok(())
    }

    /// Watch the video until it completes. Ads and pauses are handled
    /// on their own cadences inside the same loop.
    async fn monitor_until_complete(&self) -> AutomationResult<MonitorEnd> {
        let mut last_ad_check = Instant::now();
        let mut last_pause_check = Instant::now();
        let mut pause_streak = 0u32;

        loop {
            if self.stop.is_stopped() {
                return Ok(MonitorEnd::Stopped);
            }

            if let Some(video) = self.page.video_state().await? {
                if video.is_complete(COMPLETION_EPSILON_SECONDS) {
                    return Ok(MonitorEnd::Complete);
                }
            }

            if last_ad_check.elapsed() >= self.timings.ad_check {
                last_ad_check = Instant::now();
                if self.skip_ads().await? {
                    // The ad player swaps the media element, so the
                    // rate has to be reapplied on the real video.
                    self.apply_speed().await?;
                }
            }

            if last_pause_check.elapsed() >= self.timings.pause_check {
                last_pause_check = Instant::now();
                if self.handle_pause(&mut pause_streak).await? {
                    return Ok(MonitorEnd::Stopped);
                }
            }

            sleep(self.timings.tick).await;
        }
    }

    /// Returns true when the stop signal fired while waiting out a
    /// manual pause.
    async fn handle_pause(&self, streak: &mut u32) -> AutomationResult<bool> {
        let Some(first) = self.page.video_state().await? else {
            return Ok(false);
        };
        if !first.paused {
            *streak = 0;
            return Ok(false);
        }

        // Resample shortly after; a buffering stall reports paused for
        // a moment and then recovers on its own.
        sleep(Duration::from_millis(500)).await;
        let Some(second) = self.page.video_state().await? else {
            return Ok(false);
        };
        if !second.paused || (second.position - first.position).abs() >= 1.0 {
            *streak = 0;
            return Ok(false);
        }

        *streak += 1;
        self.set_state(DriverState::Paused);

        if *streak < MANUAL_PAUSE_STREAK {
            debug!(streak = *streak, "paused video, attempting resume");
            self.page
                .click_first(self.session.platform.selectors().play_buttons)
                .await?;
            self.apply_speed().await?;
            self.log(
                "pause_detected",
                "playback paused, resume attempted",
                LogStatus::Warning,
            );
            return Ok(false);
        }

        // Repeated pauses mean the user did this on purpose. Leave the
        // player alone and wait for them.
        info!("pause looks intentional, waiting for the user to resume");
        self.log(
            "user_pause",
            "waiting for the user to resume playback",
            LogStatus::Info,
        );
        loop {
            if self.stop.is_stopped() {
                return Ok(true);
            }
            sleep(Duration::from_secs(1)).await;
            if let Some(video) = self.page.video_state().await? {
                if !video.paused {
                    *streak = 0;
                    self.set_state(DriverState::Playing);
                    self.log("user_resume", "user resumed playback", LogStatus::Info);
                    return Ok(false);
                }
            }
        }
    }

    /// Click any visible skip-ad control. Returns whether one was
    /// clicked; no ad present is the common, silent case.
    async fn skip_ads(&self) -> AutomationResult<bool> {
        let selectors = self.session.platform.selectors();
        if selectors.ad_skip.is_empty() {
            return Ok(false);
        }
        match self.page.click_first(selectors.ad_skip).await? {
            Some(selector) => {
                self.set_state(DriverState::Ad);
                self.log(
                    "ad_skip",
                    format!("skipped ad via {selector}"),
                    LogStatus::Info,
                );
                self.set_state(DriverState::Playing);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn apply_speed(&self) -> AutomationResult<()> {
        let applied = self
            .page
            .set_playback_rate(self.options.speed.as_f64())
            .await?;
        if !applied {
            debug!("no video element to receive the playback rate");
        }
        Ok(())
    }

    /// YouTube only: flip the autonav toggle on before the first video
    /// so the platform advances on its own.
    async fn ensure_autoplay_enabled(&self) -> AutomationResult<()> {
        let selectors = self.session.platform.selectors();
        let checked = self
            .page
            .attribute(selectors.autoplay_toggle, "aria-checked")
            .await?;
        if checked.as_deref() == Some("false") {
            if self.page.click_first(selectors.autoplay_toggle).await?.is_some() {
                info!("enabled platform autoplay");
            }
        }
        Ok(())
    }

    /// Try the advance strategies in order. Success means the page now
    /// shows a different video identity; an explicitly disabled
    /// next-control means the playlist is over.
    async fn advance(&self, current_identity: &str) -> AutomationResult<AdvanceOutcome> {
        let selectors = self.session.platform.selectors();

        if self
            .page
            .click_first(selectors.next_buttons)
            .await?
            .is_some()
        {
            sleep(self.timings.next_click_wait).await;
            if self.identity_changed(current_identity).await? {
                return Ok(AdvanceOutcome::Advanced {
                    strategy: "next button",
                });
            }
        }

        let advanced = poll_until(
            Duration::from_secs(1),
            self.timings.autoplay_wait,
            || async move {
                Ok(self
                    .identity_changed(current_identity)
                    .await?
                    .then_some(()))
            },
        )
        .await?;
        if advanced.is_some() {
            return Ok(AdvanceOutcome::Advanced {
                strategy: "platform autoplay",
            });
        }

        if self
            .page
            .control_state(selectors.next_buttons, selectors.next_disabled_markers)
            .await?
            == ControlState::Disabled
        {
            return Ok(AdvanceOutcome::EndOfPlaylist);
        }

        if !selectors.autoplay_toggle.is_empty() {
            // Only flip the toggle when it reports off; clicking an
            // enabled toggle would turn platform autoplay off.
            let checked = self
                .page
                .attribute(selectors.autoplay_toggle, "aria-checked")
                .await?;
            if checked.as_deref() == Some("false")
                && self
                    .page
                    .click_first(selectors.autoplay_toggle)
                    .await?
                    .is_some()
            {
                sleep(self.timings.toggle_wait).await;
                if self.identity_changed(current_identity).await? {
                    return Ok(AdvanceOutcome::Advanced {
                        strategy: "autoplay toggle",
                    });
                }
            }
        }

        Err(AutomationError::AdvanceExhausted(
            "no strategy moved to a new video".into(),
        ))
    }

    async fn identity_changed(&self, current_identity: &str) -> AutomationResult<bool> {
        let url = self.page.current_url().await?;
        Ok(self.session.platform.video_identity(&url) != current_identity)
    }

    /// Let the next page settle, deal with an interstitial quiz, then
    /// wait for its video element.
    async fn post_advance(&self) -> AutomationResult<()> {
        sleep(self.timings.advance_settle).await;

        if let Some(quiz) = &self.quiz {
            match quiz
                .try_answer(&self.page, self.session.platform, self.user())
                .await?
            {
                QuizOutcome::NoQuiz => {}
                QuizOutcome::Answered { confidence, .. } => {
                    self.log(
                        "quiz_answered",
                        format!("quiz answered with confidence {confidence:.2}"),
                        LogStatus::Success,
                    );
                }
                QuizOutcome::Failed { reason } => {
                    self.log(
                        "quiz_skipped",
                        format!("quiz left unanswered: {reason}"),
                        LogStatus::Warning,
                    );
                }
            }
        }

        let selectors = self.session.platform.selectors();
        let present = poll_until(
            Duration::from_secs(1),
            self.timings.element_wait,
            || async move {
                Ok(self
                    .page
                    .element_present(selectors.video_player)
                    .await?
                    .then_some(()))
            },
        )
        .await?;
        if present.is_none() {
            warn!("video element missing after advance, continuing degraded");
        }

        self.apply_speed().await?;
        Ok(())
    }
}
