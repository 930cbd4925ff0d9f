use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::browser::error::{AutomationError, AutomationResult};
use crate::browser::page::PlayerPage;
use crate::platform::Platform;
use crate::recorder::ProgressRecorder;

/// A quiz as scraped off the page: the question text plus the visible
/// option labels, in page order.
#[derive(Debug, Clone, PartialEq)]
pub struct QuizPrompt {
    pub question: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuizAnswer {
    /// Exact text of the chosen option.
    pub choice: String,
    /// Model confidence in `[0, 1]`. Answers below the runner's
    /// threshold are recorded but never submitted.
    pub confidence: f64,
}

/// Strategy seam for picking an answer. The default heuristic model is
/// deliberately conservative; anything smarter plugs in here.
#[async_trait]
pub trait AnswerModel: Send + Sync {
    async fn answer(&self, prompt: &QuizPrompt) -> AutomationResult<Option<QuizAnswer>>;
}

/// Keyword-overlap heuristic. Scores each option by how many question
/// tokens it shares, with a small bias toward "all of the above".
#[derive(Debug, Default)]
pub struct KeywordHeuristicModel;

#[async_trait]
impl AnswerModel for KeywordHeuristicModel {
    async fn answer(&self, prompt: &QuizPrompt) -> AutomationResult<Option<QuizAnswer>> {
        if prompt.options.is_empty() {
            return Ok(None);
        }

        if let Some(catch_all) = prompt
            .options
            .iter()
            .find(|option| option.to_lowercase().contains("all of the above"))
        {
            return Ok(Some(QuizAnswer {
                choice: catch_all.clone(),
                confidence: 0.75,
            }));
        }

        let question_tokens = tokens(&prompt.question);
        let mut best: Option<(usize, &String)> = None;
        for option in &prompt.options {
            let overlap = tokens(option)
                .iter()
                .filter(|token| question_tokens.contains(*token))
                .count();
            if best.map_or(true, |(score, _)| overlap > score) {
                best = Some((overlap, option));
            }
        }

        let (overlap, choice) = best.expect("options checked non-empty above");
        if overlap == 0 {
            // Nothing matched; fall back to the longest option with low
            // confidence so the runner can decline to submit.
            let longest = prompt
                .options
                .iter()
                .max_by_key(|option| option.len())
                .expect("options checked non-empty above");
            return Ok(Some(QuizAnswer {
                choice: longest.clone(),
                confidence: 0.3,
            }));
        }

        let confidence = (overlap as f64 / question_tokens.len().max(1) as f64).min(0.95);
        Ok(Some(QuizAnswer {
            choice: choice.clone(),
            confidence,
        }))
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() > 2)
        .map(str::to_string)
        .collect()
}

/// Stable identity for a question so cached answers survive cosmetic
/// whitespace and casing changes.
pub fn question_hash(question: &str) -> String {
    let normalized = question.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.to_lowercase().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuizOutcome {
    /// No quiz on the page, or the platform has no quiz support.
    NoQuiz,
    Answered {
        question: String,
        choice: String,
        confidence: f64,
        from_cache: bool,
    },
    /// A quiz was found but not submitted. Never aborts the run.
    Failed { reason: String },
}

/// Detects and answers a quiz on the current page. Quiz failures are
/// absorbed; only session loss escapes to the caller.
pub struct QuizRunner {
    model: Box<dyn AnswerModel>,
    recorder: Arc<dyn ProgressRecorder>,
    confidence_threshold: f64,
}

impl QuizRunner {
    pub fn new(
        model: Box<dyn AnswerModel>,
        recorder: Arc<dyn ProgressRecorder>,
        confidence_threshold: f64,
    ) -> Self {
        Self {
            model,
            recorder,
            confidence_threshold,
        }
    }

    pub async fn try_answer(
        &self,
        page: &dyn PlayerPage,
        platform: Platform,
        user: Option<i64>,
    ) -> AutomationResult<QuizOutcome> {
        match self.attempt(page, platform, user).await {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_session_fatal() => Err(err),
            Err(err) => {
                warn!(error = %err, "quiz attempt failed, continuing playback");
                Ok(QuizOutcome::Failed {
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn attempt(
        &self,
        page: &dyn PlayerPage,
        platform: Platform,
        user: Option<i64>,
    ) -> AutomationResult<QuizOutcome> {
        let selectors = platform.selectors();
        let (Some(question_sel), Some(options_sel)) =
            (selectors.quiz_question, selectors.quiz_options)
        else {
            return Ok(QuizOutcome::NoQuiz);
        };

        let Some(question) = page.text_of(question_sel).await? else {
            return Ok(QuizOutcome::NoQuiz);
        };
        let options = page.texts_of(options_sel).await?;
        if options.is_empty() {
            return Ok(QuizOutcome::Failed {
                reason: "question present but no options found".into(),
            });
        }

        let hash = question_hash(&question);
        let cached = self.recorder.cached_quiz_answer(&hash)?;
        let (answer, from_cache) = match cached {
            Some(choice) => {
                debug!("answering quiz from cache");
                (
                    QuizAnswer {
                        choice,
                        confidence: 1.0,
                    },
                    true,
                )
            }
            None => {
                let prompt = QuizPrompt {
                    question: question.clone(),
                    options: options.clone(),
                };
                match self.model.answer(&prompt).await? {
                    Some(answer) => (answer, false),
                    None => {
                        self.recorder.record_quiz_attempt(
                            user, platform, &question, &options, None, 0.0, false,
                        )?;
                        return Ok(QuizOutcome::Failed {
                            reason: "model produced no answer".into(),
                        });
                    }
                }
            }
        };

        if answer.confidence < self.confidence_threshold {
            self.recorder.record_quiz_attempt(
                user,
                platform,
                &question,
                &options,
                Some(&answer.choice),
                answer.confidence,
                false,
            )?;
            return Ok(QuizOutcome::Failed {
                reason: format!(
                    "confidence {:.2} below threshold {:.2}",
                    answer.confidence, self.confidence_threshold
                ),
            });
        }

        if !page.click_option_with_text(options_sel, &answer.choice).await? {
            return Ok(QuizOutcome::Failed {
                reason: "chosen option not clickable".into(),
            });
        }
        if let Some(submit_sel) = selectors.quiz_submit {
            if page.click_first(&[submit_sel]).await?.is_none() {
                return Err(AutomationError::Script(
                    "quiz submit control missing".into(),
                ));
            }
        }

        self.recorder.record_quiz_attempt(
            user,
            platform,
            &question,
            &options,
            Some(&answer.choice),
            answer.confidence,
            true,
        )?;
        if !from_cache {
            self.recorder
                .cache_quiz_answer(&hash, &question, &answer.choice)?;
        }

        info!(
            confidence = answer.confidence,
            from_cache, "quiz answered and submitted"
        );
        Ok(QuizOutcome::Answered {
            question,
            choice: answer.choice,
            confidence: answer.confidence,
            from_cache,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(question: &str, options: &[&str]) -> QuizPrompt {
        QuizPrompt {
            question: question.to_string(),
            options: options.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn heuristic_prefers_keyword_overlap() {
        let model = KeywordHeuristicModel;
        let answer = model
            .answer(&prompt(
                "Which keyword declares an immutable binding in Rust?",
                &[
                    "The mut keyword",
                    "The let keyword declares an immutable binding",
                    "The static keyword",
                ],
            ))
            .await
            .unwrap()
            .unwrap();
        assert!(answer.choice.contains("let"));
        assert!(answer.confidence > 0.3);
    }

    #[tokio::test]
    async fn heuristic_prefers_all_of_the_above() {
        let model = KeywordHeuristicModel;
        let answer = model
            .answer(&prompt(
                "Which of these are valid?",
                &["Option A", "Option B", "All of the above"],
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer.choice, "All of the above");
        assert_eq!(answer.confidence, 0.75);
    }

    #[tokio::test]
    async fn heuristic_falls_back_with_low_confidence() {
        let model = KeywordHeuristicModel;
        let answer = model
            .answer(&prompt("Completely unrelated?", &["xyz", "a much longer option"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer.choice, "a much longer option");
        assert!(answer.confidence < 0.5);
    }

    #[test]
    fn hash_ignores_case_and_whitespace() {
        assert_eq!(
            question_hash("What  is Rust?"),
            question_hash("what is rust?")
        );
        assert_ne!(question_hash("What is Rust?"), question_hash("What is Go?"));
    }

    mod runner {
        use crate::browser::error::AutomationResult;
        use crate::browser::page::{ControlState, PlayerPage, VideoState};
        use crate::platform::Platform;
        use crate::quiz::*;
        use crate::recorder::{ActivityLogEntry, ProgressRecorder, RecorderResult};
        use async_trait::async_trait;
        use chrono::{DateTime, Utc};
        use std::collections::HashMap;
        use std::sync::{Arc, Mutex};

        struct QuizPage {
            question: Option<String>,
            options: Vec<String>,
            clicked: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl PlayerPage for QuizPage {
            async fn navigate(&self, _url: &str) -> AutomationResult<()> {
                Ok(())
            }
            async fn current_url(&self) -> AutomationResult<String> {
                Ok("https://example.test".into())
            }
            async fn title(&self) -> AutomationResult<String> {
                Ok(String::new())
            }
            async fn video_state(&self) -> AutomationResult<Option<VideoState>> {
                Ok(None)
            }
            async fn set_playback_rate(&self, _rate: f64) -> AutomationResult<bool> {
                Ok(false)
            }
            async fn click_first(&self, candidates: &[&str]) -> AutomationResult<Option<String>> {
                Ok(candidates.first().map(|s| s.to_string()))
            }
            async fn control_state(
                &self,
                _candidates: &[&str],
                _disabled_markers: &[&str],
            ) -> AutomationResult<ControlState> {
                Ok(ControlState::Missing)
            }
            async fn attribute(
                &self,
                _candidates: &[&str],
                _name: &str,
            ) -> AutomationResult<Option<String>> {
                Ok(None)
            }
            async fn element_present(&self, _selector: &str) -> AutomationResult<bool> {
                Ok(false)
            }
            async fn text_of(&self, _selector: &str) -> AutomationResult<Option<String>> {
                Ok(self.question.clone())
            }
            async fn texts_of(&self, _selector: &str) -> AutomationResult<Vec<String>> {
                Ok(self.options.clone())
            }
            async fn click_option_with_text(
                &self,
                _selector: &str,
                text: &str,
            ) -> AutomationResult<bool> {
                self.clicked.lock().unwrap().push(text.to_string());
                Ok(self.options.iter().any(|o| o == text))
            }
        }

        #[derive(Default)]
        struct StubRecorder {
            cache: Mutex<HashMap<String, String>>,
            attempts: Mutex<Vec<(Option<String>, bool)>>,
        }

        impl ProgressRecorder for StubRecorder {
            fn record_video(
                &self,
                _user: Option<i64>,
                _platform: Platform,
                _url: &str,
                _title: Option<&str>,
            ) -> RecorderResult<()> {
                Ok(())
            }
            fn mark_video_complete(
                &self,
                _user: Option<i64>,
                _url: &str,
                _completed_at: DateTime<Utc>,
            ) -> RecorderResult<()> {
                Ok(())
            }
            fn upsert_playlist_progress(
                &self,
                _user: Option<i64>,
                _playlist_url: &str,
                _videos_watched: u32,
                _last_video_url: Option<&str>,
                _is_complete: bool,
            ) -> RecorderResult<()> {
                Ok(())
            }
            fn append_log(
                &self,
                _user: Option<i64>,
                _entry: &ActivityLogEntry,
            ) -> RecorderResult<()> {
                Ok(())
            }
            fn record_quiz_attempt(
                &self,
                _user: Option<i64>,
                _platform: Platform,
                _question: &str,
                _options: &[String],
                chosen: Option<&str>,
                _confidence: f64,
                submitted: bool,
            ) -> RecorderResult<()> {
                self.attempts
                    .lock()
                    .unwrap()
                    .push((chosen.map(str::to_string), submitted));
                Ok(())
            }
            fn cached_quiz_answer(&self, question_hash: &str) -> RecorderResult<Option<String>> {
                Ok(self.cache.lock().unwrap().get(question_hash).cloned())
            }
            fn cache_quiz_answer(
                &self,
                question_hash: &str,
                _question: &str,
                answer: &str,
            ) -> RecorderResult<()> {
                self.cache
                    .lock()
                    .unwrap()
                    .insert(question_hash.to_string(), answer.to_string());
                Ok(())
            }
        }

        /// Fails the test if the runner consults the model at all.
        struct UnreachableModel;

        #[async_trait]
        impl AnswerModel for UnreachableModel {
            async fn answer(&self, _prompt: &QuizPrompt) -> AutomationResult<Option<QuizAnswer>> {
                panic!("model must not be consulted");
            }
        }

        struct FixedModel(QuizAnswer);

        #[async_trait]
        impl AnswerModel for FixedModel {
            async fn answer(&self, _prompt: &QuizPrompt) -> AutomationResult<Option<QuizAnswer>> {
                Ok(Some(self.0.clone()))
            }
        }

        #[tokio::test]
        async fn cached_answers_skip_the_model() {
            let question = "Which trait enables formatted printing?".to_string();
            let recorder = Arc::new(StubRecorder::default());
            recorder
                .cache
                .lock()
                .unwrap()
                .insert(question_hash(&question), "Display".to_string());

            let page = QuizPage {
                question: Some(question),
                options: vec!["Debug".into(), "Display".into()],
                clicked: Mutex::new(Vec::new()),
            };
            let runner = QuizRunner::new(
                Box::new(UnreachableModel),
                Arc::clone(&recorder) as Arc<dyn ProgressRecorder>,
                0.7,
            );

            let outcome = runner
                .try_answer(&page, Platform::Coursera, None)
                .await
                .unwrap();
            match outcome {
                QuizOutcome::Answered {
                    confidence,
                    from_cache,
                    choice,
                    ..
                } => {
                    assert_eq!(confidence, 1.0);
                    assert!(from_cache);
                    assert_eq!(choice, "Display");
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
            assert_eq!(page.clicked.lock().unwrap().as_slice(), ["Display"]);
            let attempts = recorder.attempts.lock().unwrap();
            assert_eq!(attempts.len(), 1);
            assert!(attempts[0].1);
        }

        #[tokio::test]
        async fn missing_question_means_no_quiz() {
            let page = QuizPage {
                question: None,
                options: Vec::new(),
                clicked: Mutex::new(Vec::new()),
            };
            let recorder = Arc::new(StubRecorder::default());
            let runner = QuizRunner::new(
                Box::new(UnreachableModel),
                recorder as Arc<dyn ProgressRecorder>,
                0.7,
            );

            let outcome = runner
                .try_answer(&page, Platform::Coursera, None)
                .await
                .unwrap();
            assert_eq!(outcome, QuizOutcome::NoQuiz);
        }

        #[tokio::test]
        async fn low_confidence_answers_are_recorded_but_not_submitted() {
            let page = QuizPage {
                question: Some("A hard question?".into()),
                options: vec!["A".repeat(4), "B".repeat(4)],
                clicked: Mutex::new(Vec::new()),
            };
            let recorder = Arc::new(StubRecorder::default());
            let runner = QuizRunner::new(
                Box::new(FixedModel(QuizAnswer {
                    choice: "AAAA".into(),
                    confidence: 0.4,
                })),
                Arc::clone(&recorder) as Arc<dyn ProgressRecorder>,
                0.7,
            );

            let outcome = runner
                .try_answer(&page, Platform::Coursera, None)
                .await
                .unwrap();
            assert!(matches!(outcome, QuizOutcome::Failed { .. }));
            assert!(page.clicked.lock().unwrap().is_empty());
            let attempts = recorder.attempts.lock().unwrap();
            assert_eq!(attempts.len(), 1);
            assert!(!attempts[0].1);
            assert!(recorder.cache.lock().unwrap().is_empty());
        }
    }
}
