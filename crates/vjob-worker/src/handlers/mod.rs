//! Video job handlers.
//!
//! Upstream calls are memoized in the shared cache and retried per error
//! kind. Transcripts and analysis results are keyed by video and content so
//! identical work is reused across owners.

mod analysis;
mod process;
mod transcript;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use vjob_cache::key::{ai_result_key, transcript_key};
use vjob_cache::TtlCache;
use vjob_models::{Job, JobKind};
use vjob_queue::{HandlerOptions, HandlerRegistry};
use vjob_recovery::{retry_classified, ErrorKind, JobFailure, RetryPolicies};

use crate::upstream::{AnalysisProvider, TranscriptProvider};

pub use analysis::AnalyzeVideoHandler;
pub use process::ProcessVideoHandler;
pub use transcript::FetchTranscriptHandler;

/// Dependencies shared by the video handlers.
#[derive(Clone)]
pub struct HandlerContext {
    pub cache: Arc<TtlCache<Value>>,
    pub policies: Arc<RetryPolicies>,
    pub transcripts: Arc<dyn TranscriptProvider>,
    pub analysis: Arc<dyn AnalysisProvider>,
}

impl HandlerContext {
    /// Transcript text for `video_key`, from cache or the provider.
    pub async fn transcript(&self, video_key: &str) -> Result<String, JobFailure> {
        let key = transcript_key(video_key);
        let cached = self
            .cache
            .get_or_insert_with(&key, None, || async {
                retry_classified(&self.policies, "fetch_transcript", || {
                    self.transcripts.fetch_transcript(video_key)
                })
                .await
                .into_result()
                .map(|text| json!({ "text": text }))
            })
            .await?;

        cached
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                JobFailure::classified(ErrorKind::Unknown, format!("cache entry {} has no text", key))
            })
    }

    /// Analysis of `transcript`, from cache or the LLM provider.
    pub async fn analysis(&self, transcript: &str, prompt: Option<&str>) -> Result<Value, JobFailure> {
        let key = ai_result_key(transcript, prompt);
        self.cache
            .get_or_insert_with(&key, None, || async {
                retry_classified(&self.policies, "analyze_transcript", || {
                    self.analysis.analyze(transcript, prompt)
                })
                .await
                .into_result()
            })
            .await
    }
}

/// Video key of `job`, or a validation failure.
pub(crate) fn require_video(job: &Job) -> Result<&str, JobFailure> {
    job.payload.video_key().ok_or_else(|| {
        JobFailure::classified(
            ErrorKind::Validation,
            format!("{} job requires video_id or video_url", job.kind),
        )
    })
}

/// Register the video handlers.
pub fn register_video_handlers(
    registry: &HandlerRegistry,
    ctx: HandlerContext,
    concurrency: usize,
    timeout: Duration,
) {
    let options = HandlerOptions::new(concurrency, timeout);
    registry.register(
        JobKind::FetchTranscript,
        FetchTranscriptHandler::new(ctx.clone()),
        options,
    );
    registry.register(
        JobKind::AnalyzeVideo,
        AnalyzeVideoHandler::new(ctx.clone()),
        options,
    );
    registry.register(JobKind::ProcessVideo, ProcessVideoHandler::new(ctx), options);
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use vjob_cache::CacheConfig;
    use vjob_recovery::RetryPolicy;

    use super::*;

    /// Provider returning scripted outcomes, then repeating the last one.
    pub struct ScriptedTranscripts {
        pub calls: AtomicUsize,
        outcomes: Mutex<Vec<Result<String, JobFailure>>>,
    }

    impl ScriptedTranscripts {
        pub fn new(outcomes: Vec<Result<String, JobFailure>>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                outcomes: Mutex::new(outcomes),
            }
        }
    }

    #[async_trait]
    impl TranscriptProvider for ScriptedTranscripts {
        async fn fetch_transcript(&self, _video_key: &str) -> Result<String, JobFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.len() > 1 {
                outcomes.remove(0)
            } else {
                outcomes[0].clone()
            }
        }
    }

    pub struct EchoAnalysis {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl AnalysisProvider for EchoAnalysis {
        async fn analyze(&self, transcript: &str, prompt: Option<&str>) -> Result<Value, JobFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "chars": transcript.len(), "prompt": prompt }))
        }
    }

    pub fn fast_policies() -> Arc<RetryPolicies> {
        Arc::new(RetryPolicies::uniform(RetryPolicy::new(
            3,
            Duration::from_millis(100),
            Duration::from_millis(400),
            2.0,
            false,
        )))
    }

    pub fn context(transcripts: Arc<ScriptedTranscripts>, analysis: Arc<EchoAnalysis>) -> HandlerContext {
        HandlerContext {
            cache: Arc::new(TtlCache::new(CacheConfig::default())),
            policies: fast_policies(),
            transcripts,
            analysis,
        }
    }

    pub fn echo() -> Arc<EchoAnalysis> {
        Arc::new(EchoAnalysis {
            calls: AtomicUsize::new(0),
        })
    }
}
