use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Context as _;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct OpenAiStubConfig {
    /// Base URL the curated source URLs point at (usually a [`SiteStub`]).
    pub source_base: String,
    /// Number of leading `/responses` calls answered with HTTP 500.
    pub fail_first: usize,
    /// Components the model "finds nothing" for.
    pub silent_components: Vec<String>,
    /// Replace the JSON text with prose so only the citations survive.
    pub garble_text: bool,
    /// Verdict given to every row in validation prompts.
    pub covers: bool,
}

impl OpenAiStubConfig {
    pub fn new(source_base: &str) -> Self {
        Self {
            source_base: source_base.trim_end_matches('/').to_owned(),
            fail_first: 0,
            silent_components: Vec::new(),
            garble_text: false,
            covers: true,
        }
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq)]
pub struct StubCall {
    pub model: String,
    pub temperature: Option<f64>,
}

pub struct OpenAiStub {
    pub base_url: String,
    calls: Arc<Mutex<Vec<StubCall>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl OpenAiStub {
    pub fn spawn(config: OpenAiStubConfig) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start openai stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}/v1");

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let calls = Arc::new(Mutex::new(Vec::<StubCall>::new()));
        let seen = Arc::clone(&calls);

        let handle = thread::spawn(move || {
            let mut served = 0usize;
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let path = request.url().to_string();
                if request.method() != &tiny_http::Method::Post || path != "/v1/responses" {
                    let _ = request.respond(
                        tiny_http::Response::from_string("not found").with_status_code(404),
                    );
                    continue;
                }

                let mut body = String::new();
                if request.as_reader().read_to_string(&mut body).is_err() {
                    let _ = request.respond(
                        tiny_http::Response::from_string("invalid request body")
                            .with_status_code(400),
                    );
                    continue;
                }

                let parsed: Value = match serde_json::from_str(&body) {
                    Ok(value) => value,
                    Err(_) => {
                        let _ = request.respond(
                            tiny_http::Response::from_string("invalid json").with_status_code(400),
                        );
                        continue;
                    }
                };

                seen.lock().expect("calls lock").push(StubCall {
                    model: parsed
                        .get("model")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_owned(),
                    temperature: parsed.get("temperature").and_then(|v| v.as_f64()),
                });

                served += 1;
                if served <= config.fail_first {
                    let _ = request.respond(
                        tiny_http::Response::from_string(
                            r#"{"error":{"message":"stub overloaded"}}"#,
                        )
                        .with_status_code(500),
                    );
                    continue;
                }

                let Some(prompt) = parsed.get("input").and_then(|v| v.as_str()) else {
                    let _ = request.respond(
                        tiny_http::Response::from_string("missing input").with_status_code(400),
                    );
                    continue;
                };

                let reply = if prompt.contains("BEGIN_COMPONENTS_JSON") {
                    curation_reply(prompt, &config)
                } else if prompt.contains("BEGIN_SOURCES_JSON") {
                    validation_reply(prompt, config.covers)
                } else {
                    Err(anyhow::anyhow!("unknown prompt mode"))
                };
                let (output_text, citations) = match reply {
                    Ok(reply) => reply,
                    Err(err) => {
                        let _ = request.respond(
                            tiny_http::Response::from_string(format!("stub error: {err:#}"))
                                .with_status_code(400),
                        );
                        continue;
                    }
                };

                let annotations = citations
                    .iter()
                    .map(|url| serde_json::json!({ "type": "url_citation", "url": url, "title": url }))
                    .collect::<Vec<_>>();
                let response_body = serde_json::json!({
                    "id": "resp_stub",
                    "object": "response",
                    "model": parsed.get("model").cloned().unwrap_or(Value::String("stub-model".to_owned())),
                    "output": [
                        { "type": "web_search_call", "status": "completed" },
                        {
                            "type": "message",
                            "role": "assistant",
                            "content": [
                                { "type": "output_text", "text": output_text, "annotations": annotations }
                            ]
                        }
                    ]
                });

                let mut response = tiny_http::Response::from_string(response_body.to_string())
                    .with_status_code(200);
                let header =
                    tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                        .expect("build header");
                response = response.with_header(header);
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            calls,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    #[allow(dead_code)]
    pub fn calls(&self) -> Vec<StubCall> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl Drop for OpenAiStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Serves canned pages for source URLs: `/ok/*` 200, `/auth/*` 401,
/// `/forbidden/*` 403, `/gone/*` 404, anything else 500.
#[allow(dead_code)]
pub struct SiteStub {
    pub base_url: String,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

#[allow(dead_code)]
impl SiteStub {
    pub fn spawn() -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start site stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}");
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };
                let path = request.url().to_string();
                let status = if path.starts_with("/ok/") {
                    200
                } else if path.starts_with("/auth/") {
                    401
                } else if path.starts_with("/forbidden/") {
                    403
                } else if path.starts_with("/gone/") {
                    404
                } else {
                    500
                };
                let _ = request.respond(
                    tiny_http::Response::from_string("<html><body>page</body></html>")
                        .with_status_code(status),
                );
            }
        });

        Self {
            base_url,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }
}

impl Drop for SiteStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Path prefix a component's source URL gets, chosen from its name.
pub fn route_for(component_name: &str) -> &'static str {
    let name = component_name.to_ascii_lowercase();
    if name.contains("login") {
        "auth"
    } else if name.contains("paywall") {
        "forbidden"
    } else if name.contains("missing") {
        "gone"
    } else {
        "ok"
    }
}

pub fn slug(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

fn extract_between<'a>(text: &'a str, begin: &str, end: &str) -> Option<&'a str> {
    let start = text.find(begin)? + begin.len();
    let rest = &text[start..];
    let end_rel = rest.find(end)?;
    Some(&rest[..end_rel])
}

fn curation_reply(
    prompt: &str,
    config: &OpenAiStubConfig,
) -> anyhow::Result<(String, Vec<String>)> {
    let raw = extract_between(prompt, "BEGIN_COMPONENTS_JSON\n", "\nEND_COMPONENTS_JSON")
        .ok_or_else(|| anyhow::anyhow!("missing component markers"))?;
    let components: Vec<Value> = serde_json::from_str(raw).context("parse components json")?;

    let mut lessons: Vec<(String, Vec<Value>)> = Vec::new();
    let mut citations = Vec::new();
    for component in &components {
        let lesson_id = component
            .get("lesson_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("component without lesson_id"))?;
        let name = component
            .get("component_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("component without component_name"))?;
        if config.silent_components.iter().any(|s| s == name) {
            continue;
        }

        let url = format!(
            "{}/{}/{}-{}",
            config.source_base,
            route_for(name),
            slug(lesson_id),
            slug(name)
        );
        citations.push(url.clone());
        let entry = serde_json::json!({
            "component_name": name,
            "candidate_sources": [
                { "title": format!("Guide to {name}"), "url": url, "rationale": "covers the topic" }
            ]
        });
        match lessons.iter_mut().find(|(id, _)| id == lesson_id) {
            Some((_, entries)) => entries.push(entry),
            None => lessons.push((lesson_id.to_owned(), vec![entry])),
        }
    }

    if config.garble_text {
        return Ok((
            "I found several helpful pages, see the citations.".to_owned(),
            citations,
        ));
    }

    let payload = serde_json::json!({
        "sources_by_lesson": lessons
            .into_iter()
            .map(|(lesson_id, components)| serde_json::json!({
                "lesson_id": lesson_id,
                "components": components,
            }))
            .collect::<Vec<_>>()
    });
    Ok((payload.to_string(), citations))
}

fn validation_reply(prompt: &str, covers: bool) -> anyhow::Result<(String, Vec<String>)> {
    let raw = extract_between(prompt, "BEGIN_SOURCES_JSON\n", "\nEND_SOURCES_JSON")
        .ok_or_else(|| anyhow::anyhow!("missing sources markers"))?;
    let rows: Vec<Value> = serde_json::from_str(raw).context("parse sources json")?;
    let verdicts = rows
        .iter()
        .filter_map(|row| row.get("row_id").and_then(|v| v.as_str()))
        .map(|row_id| serde_json::json!({ "row_id": row_id, "covers": covers, "note": "stub verdict" }))
        .collect::<Vec<_>>();
    Ok((
        serde_json::json!({ "verdicts": verdicts }).to_string(),
        Vec::new(),
    ))
}
