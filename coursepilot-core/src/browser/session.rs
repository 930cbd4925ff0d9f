use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AutomationConfig, PlaybackSpeed};
use crate::platform::Platform;

use super::error::{AutomationError, AutomationResult};
use super::page::{ControlState, PlayerPage, VideoState};
use super::poll::poll_until;

/// One logical automation session: a platform, a target speed and the
/// browser that serves it. Exclusively owned by its driver for the
/// lifetime of the run.
#[derive(Debug, Clone)]
pub struct PlaybackSession {
    pub id: Uuid,
    pub platform: Platform,
    pub speed: PlaybackSpeed,
    pub headless: bool,
    pub user_id: Option<i64>,
}

impl PlaybackSession {
    pub fn new(platform: Platform, speed: PlaybackSpeed) -> Self {
        Self {
            id: Uuid::new_v4(),
            platform,
            speed,
            headless: true,
            user_id: None,
        }
    }

    pub fn headless(mut self, value: bool) -> Self {
        self.headless = value;
        self
    }

    pub fn user(mut self, user_id: Option<i64>) -> Self {
        self.user_id = user_id;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct BrowserLauncher {
    config: Arc<AutomationConfig>,
}

impl BrowserLauncher {
    pub fn new(config: AutomationConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &AutomationConfig {
        &self.config
    }

    pub async fn launch(&self, session: &PlaybackSession) -> AutomationResult<BrowserSession> {
        let chromium_config = self.build_chromium_config(session)?;
        info!(
            session = %session.id,
            platform = %session.platform,
            headless = session.headless,
            "launching chromium instance"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| AutomationError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        Ok(BrowserSession {
            browser,
            handler_task: Some(handler_task),
            config: Arc::clone(&self.config),
            session: session.clone(),
        })
    }

    fn profile_dir(&self, session: &PlaybackSession) -> PathBuf {
        let base = self
            .config
            .chromium
            .profile_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        let machine = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
        let name = match session.user_id {
            Some(user) => format!("coursepilot_profile_user{user}_{machine}"),
            None => format!("coursepilot_profile_{machine}"),
        };
        base.join(name)
    }

    fn build_chromium_config(&self, session: &PlaybackSession) -> AutomationResult<ChromiumConfig> {
        let chromium = &self.config.chromium;
        let flags = &self.config.flags;

        let mut builder = ChromiumConfig::builder().user_data_dir(self.profile_dir(session));
        if let Some(executable) = &chromium.executable_path {
            builder = builder.chrome_executable(executable);
        }
        if !session.headless {
            builder = builder.with_head();
        }
        if !chromium.sandbox {
            builder = builder.no_sandbox();
        }

        let mut args = vec![format!(
            "--window-size={},{}",
            chromium.window[0], chromium.window[1]
        )];
        if chromium.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if flags.mute_audio {
            args.push("--mute-audio".into());
        }
        if !flags.autoplay_policy.is_empty() {
            args.push(format!("--autoplay-policy={}", flags.autoplay_policy));
        }
        if let Some(lang) = &flags.lang {
            args.push(format!("--lang={lang}"));
        }
        if let Some(agent) = &flags.user_agent {
            args.push(format!("--user-agent={agent}"));
        }
        if flags.no_first_run {
            args.push("--no-first-run".into());
        }
        if flags.disable_automation_controlled {
            args.push("--disable-blink-features=AutomationControlled".into());
        }
        args.push("--disable-background-timer-throttling".into());
        builder = builder.args(args);

        builder.build().map_err(AutomationError::Configuration)
    }
}

/// A live browser tied one-to-one with a [`PlaybackSession`]. Dropping
/// without `shutdown` leaves the chromium process to the OS; the Drop
/// impl warns when that happens.
#[derive(Debug)]
pub struct BrowserSession {
    browser: Browser,
    handler_task: Option<JoinHandle<()>>,
    config: Arc<AutomationConfig>,
    session: PlaybackSession,
}

impl BrowserSession {
    pub fn session(&self) -> &PlaybackSession {
        &self.session
    }

    /// Open the tab the driver will own for the whole run.
    pub async fn player_page(&self) -> AutomationResult<CdpPlayerPage> {
        let params = CreateTargetParams::new("about:blank");
        let page = self.browser.new_page(params).await?;
        if let Some(agent) = &self.config.flags.user_agent {
            let params = SetUserAgentOverrideParams::builder()
                .user_agent(agent.clone())
                .build()
                .map_err(AutomationError::Configuration)?;
            page.set_user_agent(params).await?;
        }
        Ok(CdpPlayerPage::new(
            page,
            self.session.platform.selectors().video_player,
        ))
    }

    /// Form login for the platforms that expose one. The driver itself
    /// assumes an authenticated session; this is a convenience for the
    /// CLI front end.
    pub async fn login(
        &self,
        page: &CdpPlayerPage,
        credentials: &Credentials,
    ) -> AutomationResult<()> {
        match self.session.platform {
            Platform::Coursera => {
                self.form_login(
                    page,
                    "https://www.coursera.org/?authMode=login",
                    "#email",
                    "#password",
                    "button[type=\"submit\"]",
                    credentials,
                )
                .await
            }
            Platform::Udemy => {
                self.form_login(
                    page,
                    "https://www.udemy.com/join/login-popup/",
                    "#email--1",
                    "#password--2",
                    "button[type=\"submit\"]",
                    credentials,
                )
                .await
            }
            platform => {
                warn!(%platform, "login not implemented for this platform");
                Ok(())
            }
        }
    }

    async fn form_login(
        &self,
        page: &CdpPlayerPage,
        login_url: &str,
        email_selector: &str,
        password_selector: &str,
        submit_selector: &str,
        credentials: &Credentials,
    ) -> AutomationResult<()> {
        page.navigate(login_url).await?;
        let found = poll_until(Duration::from_secs(1), Duration::from_secs(10), || async move {
            Ok(page.element_present(email_selector).await?.then_some(()))
        })
        .await?;
        if found.is_none() {
            return Err(AutomationError::Timeout("login form".into()));
        }

        let email = page.cdp_page().find_element(email_selector).await?;
        email.click().await?;
        email.type_str(&credentials.username).await?;
        let password = page.cdp_page().find_element(password_selector).await?;
        password.click().await?;
        password.type_str(&credentials.password).await?;
        let submit = page.cdp_page().find_element(submit_selector).await?;
        submit.click().await?;
        sleep(Duration::from_secs(3)).await;
        info!(platform = %self.session.platform, "login form submitted");
        Ok(())
    }

    pub async fn shutdown(mut self) -> AutomationResult<()> {
        info!(session = %self.session.id, "closing browser session");
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "browser did not close cleanly");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "handler task ended with an error");
            }
        }
        Ok(())
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!(
                    session = %self.session.id,
                    "BrowserSession dropped without explicit shutdown"
                );
            }
        }
    }
}

/// [`PlayerPage`] backed by a CDP page. All element interaction goes
/// through injected scripts that return JSON payloads, which keeps the
/// locator logic in one place and avoids stale element handles.
#[derive(Debug)]
pub struct CdpPlayerPage {
    page: Page,
    video_selector: &'static str,
}

#[derive(Debug, Deserialize)]
struct VideoStatePayload {
    present: bool,
    position: f64,
    duration: Option<f64>,
    paused: bool,
}

#[derive(Debug, Deserialize)]
struct ClickPayload {
    clicked: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ControlPayload {
    found: bool,
    disabled: bool,
}

#[derive(Debug, Deserialize)]
struct AttributePayload {
    value: Option<String>,
}

impl CdpPlayerPage {
    pub fn new(page: Page, video_selector: &'static str) -> Self {
        Self {
            page,
            video_selector,
        }
    }

    pub fn cdp_page(&self) -> &Page {
        &self.page
    }

    async fn eval<T: serde::de::DeserializeOwned>(
        &self,
        what: &str,
        script: String,
    ) -> AutomationResult<T> {
        self.page
            .evaluate(script.as_str())
            .await
            .map_err(AutomationError::Cdp)?
            .into_value()
            .map_err(|err| AutomationError::Script(format!("{what}: {err}")))
    }
}

#[async_trait]
impl PlayerPage for CdpPlayerPage {
    async fn navigate(&self, url: &str) -> AutomationResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(AutomationError::Configuration)?;
        self.page.goto(params).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn current_url(&self) -> AutomationResult<String> {
        self.page
            .url()
            .await?
            .ok_or_else(|| AutomationError::SessionLost("page reports no url".into()))
    }

    async fn title(&self) -> AutomationResult<String> {
        Ok(self.page.get_title().await?.unwrap_or_default())
    }

    async fn video_state(&self) -> AutomationResult<Option<VideoState>> {
        let selector = serde_json::to_string(self.video_selector)
            .map_err(|err| AutomationError::Script(err.to_string()))?;
        let script = format!(
            "(() => {{
                const video = document.querySelector({selector});
                if (!video) {{
                    return {{ present: false, position: 0, duration: null, paused: true }};
                }}
                return {{
                    present: true,
                    position: video.currentTime || 0,
                    duration: isFinite(video.duration) ? video.duration : null,
                    paused: video.paused,
                }};
            }})()"
        );
        let payload: VideoStatePayload = self.eval("video state", script).await?;
        if !payload.present {
            return Ok(None);
        }
        Ok(Some(VideoState {
            position: payload.position,
            // Non-finite durations cannot cross the JSON boundary; the
            // hook sends null and we restore the "unknown" marker here.
            duration: payload.duration.unwrap_or(f64::NAN),
            paused: payload.paused,
        }))
    }

    async fn set_playback_rate(&self, rate: f64) -> AutomationResult<bool> {
        let selector = serde_json::to_string(self.video_selector)
            .map_err(|err| AutomationError::Script(err.to_string()))?;
        let script = format!(
            "(() => {{
                const video = document.querySelector({selector});
                if (!video) return false;
                video.playbackRate = {rate};
                return true;
            }})()"
        );
        self.eval("playback rate", script).await
    }

    async fn click_first(&self, candidates: &[&str]) -> AutomationResult<Option<String>> {
        if candidates.is_empty() {
            return Ok(None);
        }
        let list = serde_json::to_string(candidates)
            .map_err(|err| AutomationError::Script(err.to_string()))?;
        let script = format!(
            "(() => {{
                const visible = (node) =>
                    !!(node.offsetWidth || node.offsetHeight || node.getClientRects().length);
                for (const selector of {list}) {{
                    const node = document.querySelector(selector);
                    if (!node || !visible(node) || node.disabled) continue;
                    node.click();
                    return {{ clicked: selector }};
                }}
                return {{ clicked: null }};
            }})()"
        );
        let payload: ClickPayload = self.eval("click", script).await?;
        Ok(payload.clicked)
    }

    async fn control_state(
        &self,
        candidates: &[&str],
        disabled_markers: &[&str],
    ) -> AutomationResult<ControlState> {
        if candidates.is_empty() {
            return Ok(ControlState::Missing);
        }
        let list = serde_json::to_string(candidates)
            .map_err(|err| AutomationError::Script(err.to_string()))?;
        let markers = serde_json::to_string(disabled_markers)
            .map_err(|err| AutomationError::Script(err.to_string()))?;
        let script = format!(
            "(() => {{
                for (const selector of {list}) {{
                    const node = document.querySelector(selector);
                    if (!node) continue;
                    const classes = node.className || '';
                    const disabled =
                        node.disabled === true ||
                        node.getAttribute('aria-disabled') === 'true' ||
                        {markers}.some((marker) => classes.includes(marker));
                    return {{ found: true, disabled }};
                }}
                return {{ found: false, disabled: false }};
            }})()"
        );
        let payload: ControlPayload = self.eval("control state", script).await?;
        Ok(if !payload.found {
            ControlState::Missing
        } else if payload.disabled {
            ControlState::Disabled
        } else {
            ControlState::Clickable
        })
    }

    async fn attribute(
        &self,
        candidates: &[&str],
        name: &str,
    ) -> AutomationResult<Option<String>> {
        if candidates.is_empty() {
            return Ok(None);
        }
        let list = serde_json::to_string(candidates)
            .map_err(|err| AutomationError::Script(err.to_string()))?;
        let attr = serde_json::to_string(name)
            .map_err(|err| AutomationError::Script(err.to_string()))?;
        let script = format!(
            "(() => {{
                for (const selector of {list}) {{
                    const node = document.querySelector(selector);
                    if (node) return {{ value: node.getAttribute({attr}) }};
                }}
                return {{ value: null }};
            }})()"
        );
        let payload: AttributePayload = self.eval("attribute", script).await?;
        Ok(payload.value)
    }

    async fn element_present(&self, selector: &str) -> AutomationResult<bool> {
        let sel = serde_json::to_string(selector)
            .map_err(|err| AutomationError::Script(err.to_string()))?;
        let script = format!("!!document.querySelector({sel})");
        self.eval("element present", script).await
    }

    async fn text_of(&self, selector: &str) -> AutomationResult<Option<String>> {
        let sel = serde_json::to_string(selector)
            .map_err(|err| AutomationError::Script(err.to_string()))?;
        let script = format!(
            "(() => {{
                const node = document.querySelector({sel});
                return {{ value: node ? (node.innerText || node.textContent || '').trim() : null }};
            }})()"
        );
        let payload: AttributePayload = self.eval("text", script).await?;
        Ok(payload.value.filter(|text| !text.is_empty()))
    }

    async fn texts_of(&self, selector: &str) -> AutomationResult<Vec<String>> {
        let sel = serde_json::to_string(selector)
            .map_err(|err| AutomationError::Script(err.to_string()))?;
        let script = format!(
            "Array.from(document.querySelectorAll({sel}))
                .map((node) => (node.innerText || node.textContent || '').trim())
                .filter((text) => text.length > 0)"
        );
        self.eval("texts", script).await
    }

    async fn click_option_with_text(&self, selector: &str, text: &str) -> AutomationResult<bool> {
        let sel = serde_json::to_string(selector)
            .map_err(|err| AutomationError::Script(err.to_string()))?;
        let needle = serde_json::to_string(text)
            .map_err(|err| AutomationError::Script(err.to_string()))?;
        let script = format!(
            "(() => {{
                for (const node of document.querySelectorAll({sel})) {{
                    const text = (node.innerText || node.textContent || '').trim();
                    if (text.includes({needle})) {{
                        node.click();
                        return true;
                    }}
                }}
                return false;
            }})()"
        );
        self.eval("option click", script).await
    }
}
