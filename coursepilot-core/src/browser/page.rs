use async_trait::async_trait;
use serde::Deserialize;

use super::error::AutomationResult;

/// Snapshot of the live `<video>` element, recomputed on every poll
/// tick and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct VideoState {
    pub position: f64,
    /// Raw reported duration. Freshly loaded players report 0, NaN or
    /// infinity before metadata arrives; use [`VideoState::valid_duration`].
    pub duration: f64,
    pub paused: bool,
}

impl VideoState {
    /// The duration, but only when it is a finite positive number.
    /// Zero, NaN and infinity are transient player states, not lengths.
    pub fn valid_duration(&self) -> Option<f64> {
        (self.duration.is_finite() && self.duration > 0.0).then_some(self.duration)
    }

    /// Completion check with an exclusive epsilon: remaining time must
    /// be strictly under `epsilon` seconds. Unknown durations never
    /// count as complete.
    pub fn is_complete(&self, epsilon: f64) -> bool {
        match self.valid_duration() {
            Some(duration) if self.position >= 0.0 => duration - self.position < epsilon,
            _ => false,
        }
    }
}

/// Observed state of a page control such as the next-video button.
/// `Disabled` is the platform's explicit end-of-playlist signal and is
/// derived from attributes and class markers, never from a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Missing,
    Clickable,
    Disabled,
}

/// Everything the playback driver needs from a live player page. The
/// production implementation drives a CDP page; tests script one.
#[async_trait]
pub trait PlayerPage: Send + Sync {
    async fn navigate(&self, url: &str) -> AutomationResult<()>;

    async fn current_url(&self) -> AutomationResult<String>;

    async fn title(&self) -> AutomationResult<String>;

    /// `None` when the video element is not present on the page.
    async fn video_state(&self) -> AutomationResult<Option<VideoState>>;

    /// Returns false when no video element was there to accept the rate.
    async fn set_playback_rate(&self, rate: f64) -> AutomationResult<bool>;

    /// Click the first visible, enabled element among `candidates`.
    /// Returns the selector that was clicked, if any. A no-op returning
    /// `None` when nothing matches.
    async fn click_first(&self, candidates: &[&str]) -> AutomationResult<Option<String>>;

    /// Inspect the first element matching any candidate and classify
    /// it; `disabled_markers` are class fragments that mean disabled.
    async fn control_state(
        &self,
        candidates: &[&str],
        disabled_markers: &[&str],
    ) -> AutomationResult<ControlState>;

    /// Attribute of the first element matching any candidate.
    async fn attribute(&self, candidates: &[&str], name: &str)
        -> AutomationResult<Option<String>>;

    async fn element_present(&self, selector: &str) -> AutomationResult<bool>;

    async fn text_of(&self, selector: &str) -> AutomationResult<Option<String>>;

    async fn texts_of(&self, selector: &str) -> AutomationResult<Vec<String>>;

    /// Click the option element under `selector` whose text contains
    /// `text`. Used for quiz answer selection.
    async fn click_option_with_text(&self, selector: &str, text: &str) -> AutomationResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(position: f64, duration: f64) -> VideoState {
        VideoState {
            position,
            duration,
            paused: false,
        }
    }

    #[test]
    fn invalid_durations_are_never_complete() {
        for duration in [0.0, -1.0, f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            for position in [0.0, 10.0, 1e9] {
                assert!(
                    !state(position, duration).is_complete(3.0),
                    "duration {duration} position {position} must not be complete"
                );
            }
        }
    }

    #[test]
    fn completion_epsilon_is_exclusive() {
        assert!(state(118.0, 120.0).is_complete(3.0));
        assert!(state(117.5, 120.0).is_complete(3.0));
        // Exactly three seconds remaining is not yet complete.
        assert!(!state(117.0, 120.0).is_complete(3.0));
        assert!(!state(40.0, 120.0).is_complete(3.0));
    }

    #[test]
    fn negative_positions_are_rejected() {
        assert!(!state(-1.0, 2.0).is_complete(3.0));
    }

    #[test]
    fn valid_duration_filters_transient_values() {
        assert_eq!(state(0.0, 120.0).valid_duration(), Some(120.0));
        assert_eq!(state(0.0, 0.0).valid_duration(), None);
        assert_eq!(state(0.0, f64::INFINITY).valid_duration(), None);
        assert_eq!(state(0.0, f64::NAN).valid_duration(), None);
    }
}
