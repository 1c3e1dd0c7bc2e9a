//! Query enhancement.
//!
//! Before a question is embedded, the LLM classifies its intent and rewrites
//! it into keyword-dense search text, using earlier conversation turns to
//! resolve references like "they" or "that policy". Enhancement is strictly
//! best-effort: any failure falls back to the raw query.

use crate::config::Config;
use crate::provider::{complete_with_timeout, ChatRequest, Message, Provider, ProviderError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Related terms appended to the search text by default.
pub const DEFAULT_RELATED_TERMS_LIMIT: usize = 5;

const FALLBACK_REASONING: &str = "Preprocessing failed, using original query";

const SYSTEM_PROMPT: &str = r#"You are a query preprocessing expert for organizational knowledge retrieval systems.

Your task is to analyze user queries and optimize them for semantic search against organizational documents.

If conversation history is provided, use it to:
- Resolve pronouns and references (e.g., "they", "that", "it")
- Understand implicit context from previous questions
- Identify the current topic being discussed

For each query, you must:
1. Identify the INTENT TYPE (choose one):
   - facts: Requesting specific factual information (who, what, when, where)
   - procedures: Asking how to do something or about processes/workflows
   - people: Questions about team members, roles, or contacts
   - policy: Questions about rules, guidelines, or official policies
   - general: General questions or exploratory queries

2. REWRITE the query to be more searchable by:
   - Expanding conversational language into key terms
   - Converting questions into declarative keyword phrases
   - Including likely document terminology
   - Adding common organizational jargon variations

3. IDENTIFY related terms that might appear in relevant documents:
   - Synonyms and alternative phrasings
   - Common abbreviations or acronyms
   - Related concepts that might be mentioned together
   - Technical or domain-specific terminology

You must respond with ONLY a valid JSON object in this exact format:
{
  "intent_type": "facts|procedures|people|policy|general",
  "enhanced_query": "rewritten query with key terms",
  "related_terms": ["term1", "term2", "term3"],
  "reasoning": "brief explanation of enhancements made"
}

Examples:

Query: "How do we handle remote work?"
Response:
{
  "intent_type": "policy",
  "enhanced_query": "remote work policy procedure guidelines work from home telecommuting requirements",
  "related_terms": ["WFH", "telecommuting", "flexible work", "distributed team", "home office"],
  "reasoning": "Expanded conversational question into policy-related keywords likely to appear in HR documents"
}

Query: "Who is in charge of marketing?"
Response:
{
  "intent_type": "people",
  "enhanced_query": "marketing department head leader manager director team",
  "related_terms": ["CMO", "marketing lead", "brand manager", "marketing coordinator"],
  "reasoning": "Converted people question into role-based search terms"
}

Query: "What's our PTO policy?"
Response:
{
  "intent_type": "policy",
  "enhanced_query": "PTO paid time off vacation leave policy accrual sick days holiday",
  "related_terms": ["vacation days", "sick leave", "personal days", "time off request", "leave of absence"],
  "reasoning": "Expanded PTO acronym and added related leave terminology"
}"#;

/// Why an enhancement attempt was abandoned.
#[derive(Debug, Error)]
pub enum EnhancementError {
    #[error("LLM call failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("response is not a valid enhancement object: {0}")]
    Parse(String),

    #[error("enhanced query is empty")]
    EmptyQuery,
}

/// Coarse purpose of a query, used to steer the rewrite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentType {
    Facts,
    Procedures,
    People,
    Policy,
    #[default]
    General,
}

impl IntentType {
    /// Unknown labels map to [`IntentType::General`].
    pub fn parse(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "facts" => Self::Facts,
            "procedures" => Self::Procedures,
            "people" => Self::People,
            "policy" => Self::Policy,
            _ => Self::General,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Facts => "facts",
            Self::Procedures => "procedures",
            Self::People => "people",
            Self::Policy => "policy",
            Self::General => "general",
        }
    }
}

impl fmt::Display for IntentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one enhancement pass. Produced fresh per query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryEnhancement {
    pub original_query: String,
    pub intent_type: IntentType,
    pub enhanced_query: String,
    pub related_terms: Vec<String>,
    pub reasoning: String,
}

impl QueryEnhancement {
    /// The raw query, unchanged, with the fallback reasoning.
    pub fn fallback(query: &str) -> Self {
        Self {
            original_query: query.to_string(),
            intent_type: IntentType::General,
            enhanced_query: query.to_string(),
            related_terms: Vec::new(),
            reasoning: FALLBACK_REASONING.to_string(),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.reasoning == FALLBACK_REASONING
    }

    /// Enhanced query first, then up to `limit` related terms, space-joined.
    pub fn search_query(&self, limit: usize) -> String {
        let mut parts = vec![self.enhanced_query.as_str()];
        parts.extend(self.related_terms.iter().take(limit).map(|t| t.as_str()));
        parts.join(" ")
    }
}

/// Search text for an enhancement, using the default related-terms limit.
pub fn build_search_query(enhancement: &QueryEnhancement) -> String {
    enhancement.search_query(DEFAULT_RELATED_TERMS_LIMIT)
}

#[derive(Debug, Deserialize)]
struct RawEnhancement {
    #[serde(default)]
    intent_type: String,
    enhanced_query: String,
    #[serde(default)]
    related_terms: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

/// Rewrites queries through the LLM.
#[derive(Clone)]
pub struct QueryEnhancer {
    provider: Arc<dyn Provider>,
    model: String,
    max_tokens: u32,
    timeout: Duration,
}

impl QueryEnhancer {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            max_tokens: 512,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn from_config(provider: Arc<dyn Provider>, config: &Config) -> Self {
        Self::new(provider, config.llm.model.clone())
            .with_max_tokens(config.query.max_tokens)
            .with_timeout(config.llm.timeout())
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enhances `query`, falling back to the raw query on any failure.
    pub async fn enhance(
        &self,
        query: &str,
        org_name: Option<&str>,
        conversation_context: Option<&str>,
    ) -> QueryEnhancement {
        info!(query, "Preprocessing query");
        match self.try_enhance(query, org_name, conversation_context).await {
            Ok(enhancement) => {
                info!(
                    enhanced = %enhancement.enhanced_query,
                    intent = %enhancement.intent_type,
                    related = enhancement.related_terms.len(),
                    "Query enhanced"
                );
                enhancement
            }
            Err(e) => {
                warn!(error = %e, "Query preprocessing failed, using original query");
                QueryEnhancement::fallback(query)
            }
        }
    }

    /// Enhances `query`, surfacing the reason when it cannot.
    pub async fn try_enhance(
        &self,
        query: &str,
        org_name: Option<&str>,
        conversation_context: Option<&str>,
    ) -> Result<QueryEnhancement, EnhancementError> {
        let request = ChatRequest::new(
            self.model.clone(),
            vec![Message::user(user_prompt(query, org_name, conversation_context))],
        )
        .with_system(SYSTEM_PROMPT)
        .with_max_tokens(self.max_tokens)
        .with_temperature(0.0);

        let response = complete_with_timeout(self.provider.as_ref(), request, self.timeout).await?;
        let raw = parse_response(response.trim())?;

        let enhanced_query = raw.enhanced_query.trim().to_string();
        if enhanced_query.is_empty() {
            return Err(EnhancementError::EmptyQuery);
        }

        Ok(QueryEnhancement {
            original_query: query.to_string(),
            intent_type: IntentType::parse(&raw.intent_type),
            enhanced_query,
            related_terms: raw
                .related_terms
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            reasoning: raw.reasoning,
        })
    }
}

fn user_prompt(query: &str, org_name: Option<&str>, conversation_context: Option<&str>) -> String {
    let mut prompt = String::new();
    if let Some(context) = conversation_context.filter(|c| !c.trim().is_empty()) {
        prompt.push_str(&format!("Conversation History:\n{context}\n\n---\n"));
    }
    match org_name {
        Some(org) => prompt.push_str(&format!("Analyze and enhance this query for {org}:")),
        None => prompt.push_str("Analyze and enhance this query:"),
    }
    prompt.push_str(&format!("\nQuery: {query}"));
    prompt.push_str("\nRespond with the JSON object only.");
    prompt
}

/// Direct JSON first, then a ```json fence, then any fence.
fn parse_response(text: &str) -> Result<RawEnhancement, EnhancementError> {
    let direct = match serde_json::from_str::<RawEnhancement>(text) {
        Ok(raw) => return Ok(raw),
        Err(e) => e,
    };

    let fenced = fenced_block(text, "```json").or_else(|| fenced_block(text, "```"));
    match fenced {
        Some(block) => serde_json::from_str(block).map_err(|e| EnhancementError::Parse(e.to_string())),
        None => Err(EnhancementError::Parse(direct.to_string())),
    }
}

fn fenced_block<'a>(text: &'a str, opening: &str) -> Option<&'a str> {
    let start = text.find(opening)? + opening.len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    let mut block = rest[..end].trim();

    // A generic fence may still carry a language tag on its first line.
    if opening == "```" && !block.starts_with('{') {
        block = block.split_once('\n').map(|(_, body)| body.trim()).unwrap_or(block);
    }
    Some(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedProvider;

    const VALID: &str = r#"{
        "intent_type": "policy",
        "enhanced_query": "PTO paid time off vacation policy",
        "related_terms": ["vacation days", "sick leave", "personal days", "time off", "leave", "holidays"],
        "reasoning": "Expanded PTO"
    }"#;

    fn enhancer(provider: ScriptedProvider) -> (Arc<ScriptedProvider>, QueryEnhancer) {
        let provider = Arc::new(provider);
        (provider.clone(), QueryEnhancer::new(provider, "test-model"))
    }

    #[tokio::test]
    async fn test_direct_json() {
        let (_, enhancer) = enhancer(ScriptedProvider::replying(VALID));
        let result = enhancer.enhance("What's our PTO policy?", None, None).await;

        assert_eq!(result.original_query, "What's our PTO policy?");
        assert_eq!(result.intent_type, IntentType::Policy);
        assert_eq!(result.enhanced_query, "PTO paid time off vacation policy");
        assert_eq!(result.related_terms.len(), 6);
        assert!(!result.is_fallback());
    }

    #[tokio::test]
    async fn test_json_fence() {
        let reply = format!("Here you go:\n```json\n{VALID}\n```\nDone.");
        let (_, enhancer) = enhancer(ScriptedProvider::replying(reply));
        let result = enhancer.enhance("pto?", None, None).await;
        assert_eq!(result.intent_type, IntentType::Policy);
    }

    #[tokio::test]
    async fn test_generic_fence_with_tag() {
        let reply = format!("```JSON\n{VALID}\n```");
        let (_, enhancer) = enhancer(ScriptedProvider::replying(reply));
        let result = enhancer.enhance("pto?", None, None).await;
        assert_eq!(result.enhanced_query, "PTO paid time off vacation policy");
    }

    #[tokio::test]
    async fn test_invalid_text_falls_back() {
        let (_, enhancer) = enhancer(ScriptedProvider::replying("I think they mean vacation."));
        let result = enhancer.enhance("How much PTO?", None, None).await;

        assert_eq!(result.intent_type, IntentType::General);
        assert_eq!(result.enhanced_query, "How much PTO?");
        assert!(result.related_terms.is_empty());
        assert!(result.is_fallback());
    }

    #[tokio::test]
    async fn test_provider_error_falls_back() {
        let (_, enhancer) = enhancer(ScriptedProvider::failing());
        let result = enhancer.enhance("How much PTO?", None, None).await;
        assert_eq!(result, QueryEnhancement::fallback("How much PTO?"));
    }

    #[tokio::test]
    async fn test_blank_enhanced_query_falls_back() {
        let reply = r#"{"intent_type": "facts", "enhanced_query": "  ", "related_terms": []}"#;
        let (_, enhancer) = enhancer(ScriptedProvider::replying(reply));
        let result = enhancer.enhance("q", None, None).await;
        assert!(result.is_fallback());
    }

    #[tokio::test]
    async fn test_unknown_intent_maps_to_general() {
        let reply = r#"{"intent_type": "trivia", "enhanced_query": "capital cities"}"#;
        let (_, enhancer) = enhancer(ScriptedProvider::replying(reply));
        let result = enhancer.enhance("q", None, None).await;
        assert_eq!(result.intent_type, IntentType::General);
        assert_eq!(result.enhanced_query, "capital cities");
    }

    #[tokio::test]
    async fn test_prompt_includes_org_and_history() {
        let (provider, enhancer) = enhancer(ScriptedProvider::replying(VALID));
        enhancer
            .enhance("what about them?", Some("Acme"), Some("User: who runs marketing?"))
            .await;

        let request = &provider.requests()[0];
        assert_eq!(request.system.as_deref(), Some(SYSTEM_PROMPT));
        let prompt = request.last_user_message().unwrap();
        assert!(prompt.starts_with("Conversation History:\nUser: who runs marketing?"));
        assert!(prompt.contains("Analyze and enhance this query for Acme:"));
        assert!(prompt.contains("\nQuery: what about them?"));
    }

    #[test]
    fn test_build_search_query_limits_terms() {
        let enhancement = QueryEnhancement {
            original_query: "q".to_string(),
            intent_type: IntentType::Policy,
            enhanced_query: "pto policy".to_string(),
            related_terms: ["a", "b", "c", "d", "e", "f"].iter().map(|s| s.to_string()).collect(),
            reasoning: String::new(),
        };
        assert_eq!(build_search_query(&enhancement), "pto policy a b c d e");
        assert_eq!(build_search_query(&QueryEnhancement::fallback("raw")), "raw");
    }
}
