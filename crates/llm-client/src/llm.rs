//! LLM client used by the template synthesis pipeline's generate/refine
//! stages (spec.md §4.5 stages 2 and 5), generalized from the Anthropic
//! provider's request/response shape.

use async_trait::async_trait;
use reqwest::Client;
use scan_core::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

const API_VERSION: &str = "2023-06-01";

/// Deterministic sampling parameters (spec.md §4.5 stage 2: "temperature≤0.2,
/// seed fixed per pipeline run").
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub temperature: f32,
    pub seed: u64,
    pub max_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self { temperature: 0.2, seed: 0, max_tokens: 4096 }
    }
}

/// Generates and refines Nuclei detection templates from an LLM endpoint.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Render `cve_id`/`description` into a template-generation prompt, call
    /// the model, and return the raw completion text (the caller extracts
    /// and validates the YAML block).
    async fn generate_template(
        &self,
        cve_id: &str,
        description: &str,
        sampling: SamplingParams,
    ) -> CoreResult<String>;

    /// Ask the model to correct `prior_body` given `failure_diagnostic`
    /// (parser output or scanner stderr from a failed validation run).
    async fn refine_template(
        &self,
        cve_id: &str,
        prior_body: &str,
        failure_diagnostic: &str,
        sampling: SamplingParams,
    ) -> CoreResult<String>;
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
    seed: u64,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// HTTP-backed [`LlmClient`].
pub struct HttpLlmClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpLlmClient {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    async fn complete(&self, system: String, user: String, sampling: SamplingParams) -> CoreResult<String> {
        let request = CompletionRequest {
            model: self.model.clone(),
            messages: vec![Message { role: "system", content: system }, Message { role: "user", content: user }],
            max_tokens: sampling.max_tokens,
            temperature: sampling.temperature,
            seed: sampling.seed,
            stream: false,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("api-version", API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| CoreError::LlmUnavailable(e.to_string()))?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| CoreError::LlmUnavailable(e.to_string()))?;

        if !status.is_success() {
            if let Ok(err) = serde_json::from_slice::<ApiErrorBody>(&body) {
                return Err(CoreError::LlmUnavailable(format!("{status}: {}", err.error.message)));
            }
            return Err(CoreError::LlmUnavailable(format!("{status}: {}", String::from_utf8_lossy(&body))));
        }

        let parsed: CompletionResponse =
            serde_json::from_slice(&body).map_err(|e| CoreError::InvalidOutput(e.to_string()))?;

        let text = parsed.content.into_iter().map(|b| b.text).collect::<Vec<_>>().join("");
        extract_yaml_block(&text).ok_or_else(|| CoreError::InvalidOutput("LLM response contained no YAML block".to_string()))
    }
}

/// Extract the first fenced YAML (or generic) code block from a model
/// response, falling back to the whole trimmed text if no fence is present.
fn extract_yaml_block(text: &str) -> Option<String> {
    let text = text.trim();
    for fence in ["```yaml", "```yml", "```"] {
        if let Some(start) = text.find(fence) {
            let after = &text[start + fence.len()..];
            if let Some(end) = after.find("```") {
                let block = after[..end].trim();
                if !block.is_empty() {
                    return Some(block.to_string());
                }
            }
        }
    }
    if text.is_empty() { None } else { Some(text.to_string()) }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate_template(&self, cve_id: &str, description: &str, sampling: SamplingParams) -> CoreResult<String> {
        let system = "You generate Nuclei YAML detection templates for a given CVE. \
            Respond with a single fenced yaml code block and nothing else."
            .to_string();
        let user = format!(
            "CVE: {cve_id}\nDescription: {description}\nThe template's `id` field must equal \"{cve_id}\"."
        );
        self.complete(system, user, sampling).await
    }

    async fn refine_template(
        &self,
        cve_id: &str,
        prior_body: &str,
        failure_diagnostic: &str,
        sampling: SamplingParams,
    ) -> CoreResult<String> {
        let system = "You correct a failing Nuclei YAML detection template given its prior body and the \
            validation failure diagnostic. Respond with a single fenced yaml code block and nothing else."
            .to_string();
        let user = format!(
            "CVE: {cve_id}\nPrior template:\n{prior_body}\n\nValidation failure:\n{failure_diagnostic}\n\nProduce a corrected template."
        );
        self.complete(system, user, sampling).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_yaml_block() {
        let text = "Here you go:\n```yaml\nid: CVE-2024-0001\n```\nLet me know if you need changes.";
        assert_eq!(extract_yaml_block(text).unwrap(), "id: CVE-2024-0001");
    }

    #[test]
    fn falls_back_to_whole_text_when_unfenced() {
        let text = "id: CVE-2024-0001\ninfo:\n  name: x";
        assert_eq!(extract_yaml_block(text).unwrap(), text);
    }

    #[test]
    fn empty_response_yields_none() {
        assert!(extract_yaml_block("   ").is_none());
    }

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn generate_template_extracts_the_yaml_block_from_a_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/complete"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"text": "```yaml\nid: CVE-2024-0001\ninfo:\n  name: x\n  severity: high\n```"}]
            })))
            .mount(&server)
            .await;

        let client = HttpLlmClient::new(format!("{}/complete", server.uri()), "secret", "claude-3-5-sonnet-20241022");
        let body = client.generate_template("CVE-2024-0001", "a thing broke", SamplingParams::default()).await.unwrap();
        assert!(body.starts_with("id: CVE-2024-0001"));
    }

    #[tokio::test]
    async fn non_success_status_surfaces_the_api_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/complete"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": {"message": "rate limited"}
            })))
            .mount(&server)
            .await;

        let client = HttpLlmClient::new(format!("{}/complete", server.uri()), "secret", "claude-3-5-sonnet-20241022");
        let err = client.generate_template("CVE-2024-0001", "a thing broke", SamplingParams::default()).await.unwrap_err();
        assert!(matches!(err, CoreError::LlmUnavailable(msg) if msg.contains("rate limited")));
    }
}
