use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

/// Supported learning platforms. The enumeration is closed on purpose:
/// every platform needs a hand-maintained selector table below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Coursera,
    Udemy,
    Moodle,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Youtube,
        Platform::Coursera,
        Platform::Udemy,
        Platform::Moodle,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Youtube => "youtube",
            Platform::Coursera => "coursera",
            Platform::Udemy => "udemy",
            Platform::Moodle => "moodle",
        }
    }

    pub fn selectors(self) -> &'static SelectorSet {
        match self {
            Platform::Youtube => &YOUTUBE,
            Platform::Coursera => &COURSERA,
            Platform::Udemy => &UDEMY,
            Platform::Moodle => &MOODLE,
        }
    }

    /// The identity of the video currently loaded at `url`, used to
    /// detect platform-driven navigation. YouTube keys on the `v`
    /// query parameter; the other platforms address each lecture by
    /// path, so the path itself is the identity. Falls back to the
    /// raw string when the URL does not parse.
    pub fn video_identity(self, url: &str) -> String {
        let Ok(parsed) = Url::parse(url) else {
            return url.to_string();
        };
        match self {
            Platform::Youtube => parsed
                .query_pairs()
                .find(|(key, _)| key == "v")
                .map(|(_, value)| value.into_owned())
                .unwrap_or_else(|| parsed.path().to_string()),
            _ => parsed.path().to_string(),
        }
    }
}

impl FromStr for Platform {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "youtube" => Ok(Platform::Youtube),
            "coursera" => Ok(Platform::Coursera),
            "udemy" => Ok(Platform::Udemy),
            "moodle" => Ok(Platform::Moodle),
            other => Err(ConfigError::Invalid(format!(
                "unsupported platform: {other}"
            ))),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-platform element locators for the fixed abstract action set.
/// Several actions carry a prioritized candidate list because the
/// platforms A/B-test their frontend markup.
#[derive(Debug, Clone)]
pub struct SelectorSet {
    pub video_player: &'static str,
    pub play_buttons: &'static [&'static str],
    pub next_buttons: &'static [&'static str],
    pub ad_skip: &'static [&'static str],
    pub ad_indicators: &'static [&'static str],
    pub autoplay_toggle: &'static [&'static str],
    /// Class fragments that mark the next-control as disabled, the
    /// platform's explicit end-of-playlist signal.
    pub next_disabled_markers: &'static [&'static str],
    pub quiz_question: Option<&'static str>,
    pub quiz_options: Option<&'static str>,
    pub quiz_submit: Option<&'static str>,
}

static YOUTUBE: SelectorSet = SelectorSet {
    video_player: "video.html5-main-video",
    play_buttons: &[
        "button.ytp-play-button",
        ".ytp-play-button",
        "button[aria-label*=\"Play\"]",
        ".ytp-large-play-button",
    ],
    next_buttons: &[
        "a.ytp-next-button",
        ".ytp-next-button",
        "button.ytp-next-button",
        "a[aria-label*=\"Next\"]",
    ],
    ad_skip: &[
        "button.ytp-ad-skip-button",
        "button.ytp-ad-skip-button-modern",
        ".ytp-ad-skip-button",
        "button[class*=\"skip\"]",
        ".videoAdUiSkipButton",
    ],
    ad_indicators: &[".ytp-ad-player-overlay", ".video-ads"],
    autoplay_toggle: &[
        "button.ytp-button[data-tooltip-target-id=\"ytp-autonav-toggle-button\"]",
        ".ytp-autonav-toggle-button",
        "button[aria-label*=\"Autoplay\"]",
    ],
    next_disabled_markers: &["ytp-button-disabled"],
    quiz_question: None,
    quiz_options: None,
    quiz_submit: None,
};

static COURSERA: SelectorSet = SelectorSet {
    video_player: "video",
    play_buttons: &["button[aria-label*=\"Play\"]"],
    next_buttons: &["button[data-test=\"next-button\"]"],
    ad_skip: &[],
    ad_indicators: &[],
    autoplay_toggle: &[],
    next_disabled_markers: &["disabled"],
    quiz_question: Some("div[data-test=\"quiz-question\"]"),
    quiz_options: Some("label.rc-Option"),
    quiz_submit: Some("button[type=\"submit\"]"),
};

static UDEMY: SelectorSet = SelectorSet {
    video_player: "video.vp-center",
    play_buttons: &["button[data-purpose=\"play-button\"]"],
    next_buttons: &["button[data-purpose=\"next-item\"]"],
    ad_skip: &[],
    ad_indicators: &[],
    autoplay_toggle: &[],
    next_disabled_markers: &["disabled"],
    quiz_question: Some("div[data-purpose=\"question-prompt\"]"),
    quiz_options: Some("label.mc-quiz-question--answer-label"),
    quiz_submit: Some("button[data-purpose=\"submit-quiz\"]"),
};

static MOODLE: SelectorSet = SelectorSet {
    video_player: "video",
    play_buttons: &["button[title*=\"Play\"]"],
    next_buttons: &["a.next-activity-link"],
    ad_skip: &[],
    ad_indicators: &[],
    autoplay_toggle: &[],
    next_disabled_markers: &["disabled"],
    quiz_question: Some("div.qtext"),
    quiz_options: Some("div.answer label"),
    quiz_submit: Some("input[type=\"submit\"]"),
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_parses_case_insensitively() {
        assert_eq!("YouTube".parse::<Platform>().unwrap(), Platform::Youtube);
        assert_eq!("moodle".parse::<Platform>().unwrap(), Platform::Moodle);
        assert!("linkedin".parse::<Platform>().is_err());
    }

    #[test]
    fn youtube_identity_is_the_v_parameter() {
        let platform = Platform::Youtube;
        let id = platform.video_identity("https://www.youtube.com/watch?v=abc123&list=PL9&index=4");
        assert_eq!(id, "abc123");

        let same = platform.video_identity("https://www.youtube.com/watch?v=abc123&t=42");
        assert_eq!(id, same);
    }

    #[test]
    fn path_platforms_key_on_the_path() {
        let id = Platform::Udemy.video_identity("https://www.udemy.com/course/rust/learn/lecture/100#overview");
        assert_eq!(id, "/course/rust/learn/lecture/100");
    }

    #[test]
    fn unparsable_urls_fall_back_to_raw_string() {
        assert_eq!(Platform::Youtube.video_identity("not a url"), "not a url");
    }

    #[test]
    fn every_platform_has_a_player_and_next_control() {
        for platform in Platform::ALL {
            let selectors = platform.selectors();
            assert!(!selectors.video_player.is_empty());
            assert!(!selectors.next_buttons.is_empty());
            assert!(!selectors.next_disabled_markers.is_empty());
        }
    }
}
