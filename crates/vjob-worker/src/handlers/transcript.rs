//! Transcript fetch handler.

use async_trait::async_trait;
use serde_json::{json, Value};

use vjob_models::Job;
use vjob_queue::JobHandler;
use vjob_recovery::JobFailure;

use super::{require_video, HandlerContext};

/// Fetches (and caches) a video's transcript.
pub struct FetchTranscriptHandler {
    ctx: HandlerContext,
}

impl FetchTranscriptHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for FetchTranscriptHandler {
    async fn execute(&self, job: &Job) -> Result<Value, JobFailure> {
        let video = require_video(job)?;
        let text = self.ctx.transcript(video).await?;
        Ok(json!({ "video": video, "text": text }))
    }
}
