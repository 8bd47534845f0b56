// HTTP client for the model runner service.
//
// The inference engine runs as a separate long-lived process (it holds the
// GPU); this client drives its load/unload/generate endpoints. Model loads
// take seconds to minutes, so requests carry no overall timeout.

use async_trait::async_trait;
use common::errors::RunnerError;
use common::runner::{GenerationOutput, ModelRunner, SamplingOptions};
use serde::{Deserialize, Serialize};
use tracing::instrument;

#[derive(Debug, Serialize)]
struct LoadRequest<'a> {
    model: &'a str,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    prompts: &'a [String],
    temperature: f64,
    top_p: f64,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    outputs: Vec<GeneratedItem>,
}

#[derive(Debug, Deserialize)]
struct GeneratedItem {
    text: String,
    prompt_tokens: u32,
    completion_tokens: u32,
    #[serde(default = "default_finish_reason")]
    finish_reason: String,
}

fn default_finish_reason() -> String {
    "stop".to_string()
}

pub struct HttpModelRunner {
    client: reqwest::Client,
    base_url: String,
}

impl HttpModelRunner {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, RunnerError> {
        let response = self
            .client
            .post(self.endpoint(path))
            .json(body)
            .send()
            .await
            .map_err(|e| RunnerError::Inference(format!("model runner unreachable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RunnerError::Inference(format!(
                "model runner returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelRunner for HttpModelRunner {
    #[instrument(skip(self))]
    async fn load(&self, model: &str) -> Result<(), RunnerError> {
        self.post_json("/v1/models/load", &LoadRequest { model })
            .await
            .map_err(|e| RunnerError::ModelLoad {
                model: model.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unload(&self) -> Result<(), RunnerError> {
        self.post_json("/v1/models/unload", &serde_json::json!({}))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, prompts), fields(prompt_count = prompts.len()))]
    async fn generate(
        &self,
        prompts: &[String],
        options: &SamplingOptions,
    ) -> Result<Vec<GenerationOutput>, RunnerError> {
        let response = self
            .post_json(
                "/v1/generate",
                &GenerateRequest {
                    prompts,
                    temperature: options.temperature,
                    top_p: options.top_p,
                    max_tokens: options.max_tokens,
                },
            )
            .await?;

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| RunnerError::Inference(format!("invalid generate response: {}", e)))?;

        Ok(parsed
            .outputs
            .into_iter()
            .map(|item| GenerationOutput {
                text: item.text,
                prompt_tokens: item.prompt_tokens,
                completion_tokens: item.completion_tokens,
                finish_reason: item.finish_reason,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sampling() -> SamplingOptions {
        SamplingOptions {
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 128,
        }
    }

    #[tokio::test]
    async fn test_generate_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/generate"))
            .and(body_partial_json(serde_json::json!({
                "temperature": 0.7,
                "max_tokens": 128,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "outputs": [
                    { "text": "hi", "prompt_tokens": 4, "completion_tokens": 2, "finish_reason": "stop" },
                    { "text": "there", "prompt_tokens": 4, "completion_tokens": 3 }
                ]
            })))
            .mount(&server)
            .await;

        let runner = HttpModelRunner::new(&server.uri());
        let prompts = vec!["user: a".to_string(), "user: b".to_string()];
        let outputs = runner.generate(&prompts, &sampling()).await.unwrap();

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].text, "hi");
        assert_eq!(outputs[0].total_tokens(), 6);
        // finish_reason defaults to "stop" when the engine omits it
        assert_eq!(outputs[1].finish_reason, "stop");
    }

    #[tokio::test]
    async fn test_load_failure_maps_to_model_load_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/models/load"))
            .respond_with(ResponseTemplate::new(500).set_body_string("OOM"))
            .mount(&server)
            .await;

        let runner = HttpModelRunner::new(&server.uri());
        let err = runner.load("llama-3").await.unwrap_err();
        assert!(matches!(err, RunnerError::ModelLoad { .. }));
        assert!(err.to_string().contains("llama-3"));
    }

    #[tokio::test]
    async fn test_generate_failure_is_inference_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/generate"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let runner = HttpModelRunner::new(&server.uri());
        let err = runner
            .generate(&["user: x".to_string()], &sampling())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Inference(_)));
    }
}
