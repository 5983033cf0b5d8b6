//! Full video processing handler.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use vjob_models::Job;
use vjob_queue::JobHandler;
use vjob_recovery::JobFailure;

use super::{require_video, HandlerContext};

/// Transcript, then analysis, reported with the credits the job consumed.
pub struct ProcessVideoHandler {
    ctx: HandlerContext,
}

impl ProcessVideoHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl JobHandler for ProcessVideoHandler {
    async fn execute(&self, job: &Job) -> Result<Value, JobFailure> {
        let video = require_video(job)?;

        let transcript = self.ctx.transcript(video).await?;
        info!(job_id = %job.id, chars = transcript.len(), "Transcript ready");

        let analysis = self
            .ctx
            .analysis(&transcript, job.payload.prompt.as_deref())
            .await?;

        Ok(json!({
            "video": video,
            "transcriptChars": transcript.len(),
            "analysis": analysis,
            "credits": job.payload.credits.unwrap_or(0),
        }))
    }
}
