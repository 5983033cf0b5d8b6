//! Transcript analysis handler.

use async_trait::async_trait;
use serde_json::{json, Value};

use vjob_models::Job;
use vjob_queue::JobHandler;
use vjob_recovery::JobFailure;

use super::{require_video, HandlerContext};

/// Runs LLM analysis over a video's transcript.
///
/// The result is cached by a hash of transcript and prompt, so owners
/// submitting the same video with the same prompt share one LLM call.
pub struct AnalyzeVideoHandler {
    ctx: HandlerContext,
}

impl AnalyzeVideoHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for AnalyzeVideoHandler {
    async fn execute(&self, job: &Job) -> Result<Value, JobFailure> {
        let video = require_video(job)?;
        let prompt = job.payload.prompt.as_deref();

        let transcript = self.ctx.transcript(video).await?;
        let analysis = self.ctx.analysis(&transcript, prompt).await?;

        Ok(json!({ "video": video, "analysis": analysis }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use vjob_models::{JobKind, JobPayload};

    use super::*;
    use crate::handlers::testing::{context, echo, ScriptedTranscripts};

    #[tokio::test]
    async fn test_identical_inputs_share_analysis() {
        let transcripts = Arc::new(ScriptedTranscripts::new(vec![Ok("hello world".to_string())]));
        let analysis = echo();
        let handler = AnalyzeVideoHandler::new(context(transcripts, analysis.clone()));

        let payload = JobPayload::for_video("abc").with_prompt("find hooks");
        let a = handler
            .execute(&Job::new(JobKind::AnalyzeVideo, payload.clone(), "u1"))
            .await
            .unwrap();
        let b = handler
            .execute(&Job::new(JobKind::AnalyzeVideo, payload, "u2"))
            .await
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(a["analysis"]["prompt"], "find hooks");
        assert_eq!(analysis.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_prompt_runs_again() {
        let transcripts = Arc::new(ScriptedTranscripts::new(vec![Ok("hello world".to_string())]));
        let analysis = echo();
        let handler = AnalyzeVideoHandler::new(context(transcripts, analysis.clone()));

        for prompt in ["find hooks", "summarize"] {
            let payload = JobPayload::for_video("abc").with_prompt(prompt);
            handler
                .execute(&Job::new(JobKind::AnalyzeVideo, payload, "u1"))
                .await
                .unwrap();
        }
        assert_eq!(analysis.calls.load(Ordering::SeqCst), 2);
    }
}
