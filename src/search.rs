use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::formats::{ComponentKey, RequiredComponent};
use crate::grounding::{AttestedCitation, Claim};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub text: String,
    pub attested_citations: Vec<AttestedCitation>,
}

impl SearchResponse {
    pub fn has_evidence(&self) -> bool {
        self.attested_citations
            .iter()
            .any(|c| !c.url.trim().is_empty())
    }
}

/// A generative model with a web-search tool.
#[async_trait]
pub trait GenerativeSearch: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
    ) -> anyhow::Result<SearchResponse>;
}

/// Answers with no text and no evidence; every batch is skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSearch;

#[async_trait]
impl GenerativeSearch for NoopSearch {
    async fn generate(
        &self,
        _prompt: &str,
        _model: &str,
        _temperature: f32,
    ) -> anyhow::Result<SearchResponse> {
        Ok(SearchResponse::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("model output contains no JSON object")]
    NoJsonObject,
    #[error("model output is not valid curation JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("model output lists no candidate sources")]
    EmptyPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CurationPayload {
    pub sources_by_lesson: Vec<LessonSources>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonSources {
    pub lesson_id: String,
    #[serde(default)]
    pub components: Vec<ComponentSources>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSources {
    pub component_name: String,
    #[serde(default)]
    pub candidate_sources: Vec<CandidateSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSource {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize)]
struct PromptComponent<'a> {
    lesson_id: &'a str,
    lesson_title: &'a str,
    component_name: &'a str,
    is_critical: bool,
}

pub fn build_prompt(course_title: &str, batch: &[RequiredComponent]) -> anyhow::Result<String> {
    let components = batch
        .iter()
        .map(|c| PromptComponent {
            lesson_id: &c.lesson_id,
            lesson_title: &c.lesson_title,
            component_name: &c.component_name,
            is_critical: c.is_critical,
        })
        .collect::<Vec<_>>();
    let input_json = serde_json::to_string_pretty(&components)?;

    Ok(format!(
        "You are a research librarian curating reference sources for an online course.\n\
\n\
Course: {course_title}\n\
\n\
Task: For each lesson component below, find up to 3 publicly reachable web pages \
(articles, guides, official documentation) that a learner could read for it.\n\
\n\
BEGIN_COMPONENTS_JSON\n\
{input_json}\n\
END_COMPONENTS_JSON\n\
\n\
Hard rules:\n\
- Use the web search tool. Cite ONLY pages returned by your searches.\n\
- Never invent, shorten, or abbreviate URLs. Copy them exactly as found.\n\
- Prefer stable, freely accessible pages (no paywalls, no logins).\n\
- Use the `lesson_id` and `component_name` exactly as given.\n\
\n\
Output:\n\
- Output ONLY a single JSON object (no markdown fences, no commentary).\n\
- Schema:\n\
  {{\"sources_by_lesson\":[{{\"lesson_id\":\"...\",\"components\":[{{\"component_name\":\"...\",\"candidate_sources\":[{{\"title\":\"...\",\"url\":\"https://...\",\"rationale\":\"...\"}}]}}]}}]}}\n",
        input_json = input_json.trim_end(),
    ))
}

/// Parses model text into claims for the components of `batch`. Entries for
/// components outside the batch are ignored.
pub fn parse_claims(text: &str, batch: &[RequiredComponent]) -> Result<Vec<Claim>, ParseError> {
    let json = extract_json_object(text).ok_or(ParseError::NoJsonObject)?;
    let payload: CurationPayload = serde_json::from_str(json)?;

    let wanted = batch.iter().map(RequiredComponent::key).collect::<Vec<_>>();
    let mut claims = Vec::new();
    for lesson in &payload.sources_by_lesson {
        for component in &lesson.components {
            let key = ComponentKey::new(&lesson.lesson_id, &component.component_name);
            if !wanted.contains(&key) {
                tracing::debug!(component = %key, "ignoring sources for component outside batch");
                continue;
            }
            for source in &component.candidate_sources {
                if source.url.trim().is_empty() {
                    continue;
                }
                claims.push(Claim {
                    component: key.clone(),
                    title: source.title.trim().to_owned(),
                    url: source.url.trim().to_owned(),
                    rationale: source.rationale.trim().to_owned(),
                });
            }
        }
    }

    if claims.is_empty() {
        return Err(ParseError::EmptyPayload);
    }
    Ok(claims)
}

/// Turns raw attested citations into claims when the model text is unusable.
/// Citations are dealt round-robin over the batch in batch order.
pub fn fallback_claims(attested: &[AttestedCitation], batch: &[RequiredComponent]) -> Vec<Claim> {
    if batch.is_empty() {
        return Vec::new();
    }
    attested
        .iter()
        .filter(|c| !c.url.trim().is_empty())
        .enumerate()
        .map(|(idx, citation)| {
            let component = &batch[idx % batch.len()];
            Claim {
                component: component.key(),
                title: citation
                    .title
                    .clone()
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| citation.url.trim().to_owned()),
                url: citation.url.trim().to_owned(),
                rationale: format!(
                    "Search evidence for \"{}\" ({}).",
                    component.lesson_title, component.component_name
                ),
            }
        })
        .collect()
}

pub(crate) fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(lesson: &str, name: &str) -> RequiredComponent {
        RequiredComponent {
            lesson_id: lesson.to_owned(),
            lesson_title: format!("Lesson {lesson}"),
            component_name: name.to_owned(),
            is_critical: false,
        }
    }

    #[test]
    fn parses_fenced_output_and_filters_to_batch() -> anyhow::Result<()> {
        let text = r#"Here you go:
```json
{"sources_by_lesson":[
  {"lesson_id":"L1","components":[
    {"component_name":"reading","candidate_sources":[
      {"title":"Intro","url":" https://a.example.com/intro ","rationale":"covers basics"},
      {"title":"Blank","url":"","rationale":"x"}
    ]},
    {"component_name":"VIDEO","candidate_sources":[{"title":"V","url":"https://v.example.com"}]}
  ]}
]}
```"#;
        let claims = parse_claims(text, &[component("L1", "READING")])?;
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].url, "https://a.example.com/intro");
        assert_eq!(claims[0].component, ComponentKey::new("L1", "READING"));
        Ok(())
    }

    #[test]
    fn parse_errors_are_typed() {
        let batch = [component("L1", "READING")];
        assert!(matches!(
            parse_claims("no json here", &batch),
            Err(ParseError::NoJsonObject)
        ));
        assert!(matches!(
            parse_claims("{\"sources\": []}", &batch),
            Err(ParseError::InvalidJson(_))
        ));
        assert!(matches!(
            parse_claims("{\"sources_by_lesson\": []}", &batch),
            Err(ParseError::EmptyPayload)
        ));
    }

    #[test]
    fn fallback_deals_citations_round_robin() {
        let batch = [component("L1", "READING"), component("L2", "VIDEO")];
        let attested = [
            AttestedCitation {
                url: "https://a.example.com".to_owned(),
                title: Some("A".to_owned()),
            },
            AttestedCitation {
                url: "https://b.example.com".to_owned(),
                title: None,
            },
            AttestedCitation {
                url: "https://c.example.com".to_owned(),
                title: Some(" ".to_owned()),
            },
        ];
        let claims = fallback_claims(&attested, &batch);
        assert_eq!(claims.len(), 3);
        assert_eq!(claims[0].component, batch[0].key());
        assert_eq!(claims[1].component, batch[1].key());
        assert_eq!(claims[2].component, batch[0].key());
        assert_eq!(claims[1].title, "https://b.example.com");
        assert_eq!(claims[2].title, "https://c.example.com");
        assert!(!claims[0].rationale.is_empty());
    }

    #[test]
    fn prompt_mentions_every_component() -> anyhow::Result<()> {
        let prompt = build_prompt(
            "Rust 101",
            &[component("L1", "READING"), component("L2", "VIDEO")],
        )?;
        assert!(prompt.contains("BEGIN_COMPONENTS_JSON"));
        assert!(prompt.contains("\"lesson_id\": \"L2\""));
        assert!(prompt.contains("sources_by_lesson"));
        Ok(())
    }
}
