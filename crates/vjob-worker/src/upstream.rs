//! Upstream service clients.
//!
//! Both providers are opaque async calls that can fail. The HTTP clients
//! turn every failure into a `JobFailure` carrying enough detail (status
//! code, transport error kind) for the classifier to decide on retries.

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use vjob_recovery::{ErrorKind, JobFailure};

use crate::config::UpstreamConfig;
use crate::error::WorkerResult;

/// Fetches transcripts for a video.
#[async_trait]
pub trait TranscriptProvider: Send + Sync {
    async fn fetch_transcript(&self, video_key: &str) -> Result<String, JobFailure>;
}

/// Runs LLM analysis over a transcript.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    async fn analyze(&self, transcript: &str, prompt: Option<&str>) -> Result<Value, JobFailure>;
}

#[derive(Debug, Deserialize)]
struct TranscriptResponse {
    text: String,
}

#[derive(Debug, Serialize)]
struct AnalysisRequest<'a> {
    transcript: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
}

fn build_client(config: &UpstreamConfig) -> WorkerResult<Client> {
    Ok(Client::builder().timeout(config.timeout).build()?)
}

/// Map a transport error. Timeouts and connect failures are explicit; the
/// rest goes through the message classifier.
fn transport_failure(service: &str, err: reqwest::Error) -> JobFailure {
    let message = format!("{} request failed: {}", service, err);
    if err.is_timeout() {
        JobFailure::classified(ErrorKind::Timeout, message)
    } else if err.is_connect() {
        JobFailure::classified(ErrorKind::Network, message)
    } else {
        match err.status() {
            Some(status) => JobFailure::http(status.as_u16(), message),
            None => JobFailure::new(message),
        }
    }
}

/// Turn a non-2xx response into a failure carrying its status.
async fn check_status(service: &str, response: Response) -> Result<Response, JobFailure> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(JobFailure::http(
        status.as_u16(),
        format!("{} returned {}: {}", service, status, body.trim()),
    ))
}

/// Transcript service over HTTP: `GET {base}/transcripts?video={key}`.
pub struct HttpTranscriptClient {
    client: Client,
    base_url: String,
}

impl HttpTranscriptClient {
    pub fn new(config: &UpstreamConfig) -> WorkerResult<Self> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.transcript_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TranscriptProvider for HttpTranscriptClient {
    async fn fetch_transcript(&self, video_key: &str) -> Result<String, JobFailure> {
        let url = format!("{}/transcripts", self.base_url);
        debug!("Fetching transcript for {}", video_key);

        let response = self
            .client
            .get(&url)
            .query(&[("video", video_key)])
            .send()
            .await
            .map_err(|e| transport_failure("transcript service", e))?;
        let response = check_status("transcript service", response).await?;

        let body: TranscriptResponse = response.json().await.map_err(|e| {
            JobFailure::classified(
                ErrorKind::ServerError,
                format!("malformed transcript response: {}", e),
            )
        })?;
        Ok(body.text)
    }
}

/// LLM service over HTTP: `POST {base}/analyze`.
pub struct HttpAnalysisClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpAnalysisClient {
    pub fn new(config: &UpstreamConfig) -> WorkerResult<Self> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.llm_url.trim_end_matches('/').to_string(),
            api_key: config.llm_api_key.clone(),
        })
    }
}

#[async_trait]
impl AnalysisProvider for HttpAnalysisClient {
    async fn analyze(&self, transcript: &str, prompt: Option<&str>) -> Result<Value, JobFailure> {
        let url = format!("{}/analyze", self.base_url);

        let mut request = self
            .client
            .post(&url)
            .json(&AnalysisRequest { transcript, prompt });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_failure("llm service", e))?;
        let response = check_status("llm service", response).await?;

        response.json().await.map_err(|e| {
            JobFailure::classified(
                ErrorKind::ServerError,
                format!("malformed analysis response: {}", e),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> UpstreamConfig {
        UpstreamConfig {
            transcript_url: server.uri(),
            llm_url: server.uri(),
            llm_api_key: Some("secret".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_transcript_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/transcripts"))
            .and(query_param("video", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "text": "hi" })))
            .mount(&server)
            .await;

        let client = HttpTranscriptClient::new(&config(&server)).unwrap();
        assert_eq!(client.fetch_transcript("abc").await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_status_codes_are_classified() {
        let cases = [
            (401, ErrorKind::Auth),
            (429, ErrorKind::RateLimit),
            (402, ErrorKind::QuotaExceeded),
            (503, ErrorKind::ServerError),
            (422, ErrorKind::Validation),
        ];

        for (status, expected) in cases {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/transcripts"))
                .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
                .mount(&server)
                .await;

            let client = HttpTranscriptClient::new(&config(&server)).unwrap();
            let err = client.fetch_transcript("abc").await.unwrap_err();
            assert_eq!(err.status, Some(status));
            assert_eq!(err.kind(), expected, "status {status}");
        }
    }

    #[tokio::test]
    async fn test_analysis_sends_bearer_and_prompt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "highlights": [1, 2] })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpAnalysisClient::new(&config(&server)).unwrap();
        let out = client.analyze("hello", Some("find hooks")).await.unwrap();
        assert_eq!(out, json!({ "highlights": [1, 2] }));
    }

    #[tokio::test]
    async fn test_connection_refused_is_network() {
        let client = HttpTranscriptClient::new(&UpstreamConfig {
            transcript_url: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        })
        .unwrap();

        let err = client.fetch_transcript("abc").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
    }
}
