use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;

use crate::grounding::AttestedCitation;
use crate::search::{GenerativeSearch, SearchResponse};

pub fn responses_endpoint(base_url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    format!("{base_url}/responses")
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl OpenAiConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY is not set"))?;
        let base_url = std::env::var("OPENAI_BASE_URL")
            .ok()
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "https://api.openai.com/v1".to_owned());
        Ok(Self {
            base_url,
            api_key,
            timeout: Duration::from_secs(120),
        })
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiSearch {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl OpenAiSearch {
    pub fn new(config: &OpenAiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("build openai http client")?;
        Ok(Self {
            client,
            endpoint: responses_endpoint(&config.base_url),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl GenerativeSearch for OpenAiSearch {
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
    ) -> anyhow::Result<SearchResponse> {
        let mut body = serde_json::json!({
            "model": model,
            "input": prompt,
            "tools": [{ "type": "web_search" }],
            "tool_choice": "auto",
            "store": false,
        });

        // NOTE: Some GPT-5 models reject sampling params like `temperature`.
        if !model.starts_with("gpt-5")
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert("temperature".to_owned(), serde_json::json!(temperature));
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {}", self.endpoint))?;

        let status = response.status();
        let raw = response.text().await.context("read OpenAI response body")?;
        if !status.is_success() {
            let message = parse_error_message(&raw).unwrap_or_else(|| raw.clone());
            anyhow::bail!("OpenAI API error ({status}): {message}");
        }

        let value: serde_json::Value = serde_json::from_str(&raw).context("parse OpenAI response")?;
        extract_search_response(&value).context("extract search response")
    }
}

fn parse_error_message(raw_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    let message = value.get("error")?.get("message")?.as_str()?.to_owned();
    Some(message)
}

/// Collects `output_text` parts and their `url_citation` annotations. Only the
/// annotations count as attested evidence.
fn extract_search_response(value: &serde_json::Value) -> anyhow::Result<SearchResponse> {
    let output = value
        .get("output")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("missing `output` array in response"))?;

    let mut text = String::new();
    let mut citations: Vec<AttestedCitation> = Vec::new();
    for item in output {
        if item.get("type").and_then(|v| v.as_str()) != Some("message") {
            continue;
        }
        let Some(content) = item.get("content").and_then(|v| v.as_array()) else {
            continue;
        };
        for part in content {
            if part.get("type").and_then(|v| v.as_str()) != Some("output_text") {
                continue;
            }
            if let Some(part_text) = part.get("text").and_then(|v| v.as_str()) {
                text.push_str(part_text);
            }
            let Some(annotations) = part.get("annotations").and_then(|v| v.as_array()) else {
                continue;
            };
            for annotation in annotations {
                if annotation.get("type").and_then(|v| v.as_str()) != Some("url_citation") {
                    continue;
                }
                let Some(url) = annotation.get("url").and_then(|v| v.as_str()) else {
                    continue;
                };
                let url = url.trim();
                if url.is_empty() || citations.iter().any(|c| c.url == url) {
                    continue;
                }
                citations.push(AttestedCitation {
                    url: url.to_owned(),
                    title: annotation
                        .get("title")
                        .and_then(|v| v.as_str())
                        .map(str::to_owned),
                });
            }
        }
    }

    Ok(SearchResponse {
        text,
        attested_citations: citations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_text_and_deduplicated_citations() -> anyhow::Result<()> {
        let value = serde_json::json!({
            "output": [
                { "type": "web_search_call", "status": "completed" },
                {
                    "type": "message",
                    "content": [{
                        "type": "output_text",
                        "text": "{\"sources_by_lesson\":[]}",
                        "annotations": [
                            { "type": "url_citation", "url": "https://a.example.com/x", "title": "A" },
                            { "type": "url_citation", "url": "https://a.example.com/x", "title": "A again" },
                            { "type": "file_citation", "file_id": "f1" },
                            { "type": "url_citation", "url": "https://b.example.com" }
                        ]
                    }]
                }
            ]
        });
        let response = extract_search_response(&value)?;
        assert_eq!(response.text, "{\"sources_by_lesson\":[]}");
        assert_eq!(response.attested_citations.len(), 2);
        assert_eq!(response.attested_citations[0].title.as_deref(), Some("A"));
        assert!(response.attested_citations[1].title.is_none());
        assert!(response.has_evidence());
        Ok(())
    }

    #[test]
    fn missing_output_is_an_error() {
        assert!(extract_search_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn endpoint_trims_trailing_slash() {
        assert_eq!(
            responses_endpoint("http://localhost:1/v1/"),
            "http://localhost:1/v1/responses"
        );
    }
}
