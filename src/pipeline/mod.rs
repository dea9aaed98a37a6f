//! External-collaborator contracts.
//!
//! The language-understanding pipeline and the sentiment scorer are black
//! boxes behind narrow traits; relaydesk only supplies the customer message
//! plus recent conversation history and consumes text/score back. The
//! bundled implementations call HTTP services; tests substitute mocks.

use crate::ledger::Message;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Generates the bot's reply to a customer message.
#[async_trait]
pub trait ReplyPipeline: Send + Sync {
    async fn generate_reply(&self, content: &str, history: &[Message]) -> Result<String>;
}

/// Scores text sentiment in `0.0..=1.0`; values below the configured
/// threshold escalate the conversation to a human.
#[async_trait]
pub trait SentimentScorer: Send + Sync {
    async fn score(&self, text: &str) -> Result<f32>;
}

#[derive(Serialize)]
struct ReplyRequest<'a> {
    message: &'a str,
    history: Vec<HistoryTurn<'a>>,
}

#[derive(Serialize)]
struct HistoryTurn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ReplyResponse {
    reply: String,
}

/// Reply pipeline backed by an HTTP service.
pub struct HttpReplyPipeline {
    client: reqwest::Client,
    url: String,
}

impl HttpReplyPipeline {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl ReplyPipeline for HttpReplyPipeline {
    async fn generate_reply(&self, content: &str, history: &[Message]) -> Result<String> {
        let body = ReplyRequest {
            message: content,
            history: history
                .iter()
                .map(|m| HistoryTurn {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
        };

        debug!(url = %self.url, history = history.len(), "invoking reply pipeline");
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("reply pipeline request failed")?
            .error_for_status()
            .context("reply pipeline returned an error status")?;

        let parsed: ReplyResponse = response
            .json()
            .await
            .context("reply pipeline returned malformed JSON")?;
        Ok(parsed.reply)
    }
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct ScoreResponse {
    score: f32,
}

/// Sentiment scorer backed by an HTTP service.
pub struct HttpSentimentScorer {
    client: reqwest::Client,
    url: String,
}

impl HttpSentimentScorer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl SentimentScorer for HttpSentimentScorer {
    async fn score(&self, text: &str) -> Result<f32> {
        let response = self
            .client
            .post(&self.url)
            .json(&ScoreRequest { text })
            .send()
            .await
            .context("sentiment scorer request failed")?
            .error_for_status()
            .context("sentiment scorer returned an error status")?;

        let parsed: ScoreResponse = response
            .json()
            .await
            .context("sentiment scorer returned malformed JSON")?;
        Ok(parsed.score.clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn http_pipeline_posts_message_and_history() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/reply"))
            .and(body_partial_json(serde_json::json!({"message": "hi"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "reply": "Hello!"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let pipeline = HttpReplyPipeline::new(format!("{}/reply", server.uri()));
        let reply = pipeline.generate_reply("hi", &[]).await.unwrap();
        assert_eq!(reply, "Hello!");
    }

    #[tokio::test]
    async fn http_pipeline_surfaces_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let pipeline = HttpReplyPipeline::new(server.uri());
        assert!(pipeline.generate_reply("hi", &[]).await.is_err());
    }

    #[tokio::test]
    async fn http_scorer_clamps_out_of_range_scores() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "score": 1.7
            })))
            .mount(&server)
            .await;

        let scorer = HttpSentimentScorer::new(server.uri());
        let score = scorer.score("great!").await.unwrap();
        assert!((score - 1.0).abs() < f32::EPSILON);
    }
}
