//! Free-text query parsing into structured search fields.
//!
//! Converts a natural-language query into `{keywords, authors, years,
//! institutions}`. An OpenAI-compatible LLM endpoint does the extraction when
//! configured; a deterministic rule-based pass (year tokens, a small
//! institution lexicon, "by <Name>" author patterns) always exists as the
//! fallback, so feeds keep working without an external model.
//!
//! The parser is advisory: empty output means "treat the entire text as
//! keywords".

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::{Result, ScholarError};
use crate::prompts::query_extraction::{build_user_prompt, SYSTEM_PROMPT};

/// LLM request timeout
const LLM_TIMEOUT: Duration = Duration::from_secs(20);

/// Institutions the rule-based pass recognizes without an LLM
const KNOWN_INSTITUTIONS: &[&str] = &[
    "MIT",
    "Stanford",
    "Harvard",
    "Berkeley",
    "Oxford",
    "Cambridge",
    "ETH Zurich",
    "Carnegie Mellon",
    "Princeton",
    "Caltech",
    "Max Planck",
    "Tsinghua",
    "DeepMind",
    "OpenAI",
];

/// Words dropped from the keyword remainder
const STOPWORDS: &[&str] = &[
    "a", "an", "the", "of", "on", "in", "at", "for", "and", "or", "about", "papers", "paper",
    "articles", "article", "recent", "latest", "new", "show", "me", "find", "search",
];

/// Structured fields extracted from a free-text query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedQuery {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    /// Entries use the year vocabulary: `2020`, `>2020`, `<2020`, `2018-2022`
    #[serde(default)]
    pub years: Vec<String>,
    #[serde(default)]
    pub institutions: Vec<String>,
}

impl ParsedQuery {
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
            && self.authors.is_empty()
            && self.years.is_empty()
            && self.institutions.is_empty()
    }
}

/// Query parser with an optional LLM extraction layer.
pub struct QueryParser {
    llm: Option<LlmConfig>,
    client: reqwest::Client,
}

impl QueryParser {
    pub fn new(llm: Option<LlmConfig>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(LLM_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { llm, client }
    }

    /// Parse a free-text query.
    ///
    /// LLM extraction failures degrade silently to the rule-based pass; an
    /// empty query yields an empty result.
    pub async fn parse(&self, text: &str) -> ParsedQuery {
        let text = text.trim();
        if text.is_empty() {
            return ParsedQuery::default();
        }

        if let Some(ref config) = self.llm {
            match self.llm_parse(config, text).await {
                Ok(parsed) if !parsed.is_empty() => return parsed,
                Ok(_) => debug!("LLM extraction returned nothing, using rules"),
                Err(e) => warn!(error = %e, "LLM extraction failed, using rules"),
            }
        }
        rule_based_parse(text)
    }

    async fn llm_parse(&self, config: &LlmConfig, text: &str) -> Result<ParsedQuery> {
        let request_body = serde_json::json!({
            "model": config.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_user_prompt(text)}
            ],
            "temperature": 0.0,
            "max_tokens": 500
        });
        let api_url = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&api_url)
            .header("Authorization", format!("Bearer {}", config.api_key))
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ScholarError::Upstream(format!(
                "LLM API returned {}",
                response.status()
            )));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ScholarError::Upstream(format!("bad LLM response: {}", e)))?;
        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();

        serde_json::from_str(&extract_json(&content))
            .map_err(|e| ScholarError::Upstream(format!("unparseable LLM output: {}", e)))
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Deterministic extraction: year constraints, known institutions, and
/// "by/from <Name>" author patterns; the remainder becomes keywords.
pub fn rule_based_parse(text: &str) -> ParsedQuery {
    let mut parsed = ParsedQuery::default();
    let mut remainder = text.to_string();

    // Year constraints first, most specific pattern wins
    #[allow(clippy::unwrap_used)]
    let range_re = Regex::new(r"\b((?:19|20)\d{2})\s*(?:-|to|until)\s*((?:19|20)\d{2})\b").unwrap();
    if let Some(caps) = range_re.captures(&remainder) {
        parsed.years.push(format!("{}-{}", &caps[1], &caps[2]));
        remainder = range_re.replace(&remainder, " ").to_string();
    }

    #[allow(clippy::unwrap_used)]
    let since_re = Regex::new(r"(?i)\b(?:since|after|from)\s+((?:19|20)\d{2})\b").unwrap();
    if let Some(caps) = since_re.captures(&remainder) {
        parsed.years.push(format!(">{}", &caps[1]));
        remainder = since_re.replace(&remainder, " ").to_string();
    }

    #[allow(clippy::unwrap_used)]
    let before_re = Regex::new(r"(?i)\b(?:before|until|up to)\s+((?:19|20)\d{2})\b").unwrap();
    if let Some(caps) = before_re.captures(&remainder) {
        parsed.years.push(format!("<{}", &caps[1]));
        remainder = before_re.replace(&remainder, " ").to_string();
    }

    #[allow(clippy::unwrap_used)]
    let year_re = Regex::new(r"\b((?:19|20)\d{2})\b").unwrap();
    if parsed.years.is_empty() {
        if let Some(caps) = year_re.captures(&remainder) {
            parsed.years.push(caps[1].to_string());
            remainder = year_re.replace(&remainder, " ").to_string();
        }
    }

    // Known institutions
    for institution in KNOWN_INSTITUTIONS {
        let pattern = format!(r"(?i)\b{}\b", regex::escape(institution));
        if let Ok(re) = Regex::new(&pattern) {
            if re.is_match(&remainder) {
                parsed.institutions.push(institution.to_string());
                remainder = re.replace(&remainder, " ").to_string();
            }
        }
    }

    // "papers by Jane Doe", "work from John Smith"
    #[allow(clippy::unwrap_used)]
    let author_re =
        Regex::new(r"\b(?:by|from)\s+([A-Z][a-zA-Z'\-]+(?:\s+[A-Z][a-zA-Z'\-]+)+)").unwrap();
    loop {
        let found = author_re
            .captures(&remainder)
            .and_then(|caps| caps.get(0).map(|m| (caps[1].to_string(), m.range())));
        match found {
            Some((name, range)) => {
                parsed.authors.push(name);
                remainder.replace_range(range, " ");
            }
            None => break,
        }
    }

    // Remainder, minus stopwords, becomes keyword tokens
    parsed.keywords = remainder
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .filter(|t| !STOPWORDS.contains(&t.to_lowercase().as_str()))
        .collect();

    parsed
}

/// Extract JSON from LLM output, tolerating markdown code fences and
/// surrounding prose.
fn extract_json(content: &str) -> String {
    let trimmed = content.trim();

    if trimmed.starts_with("```") {
        let lines: Vec<&str> = trimmed.lines().collect();
        if lines.len() >= 2 {
            let start = 1;
            let end = if lines.last().map(|l| l.trim()) == Some("```") {
                lines.len() - 1
            } else {
                lines.len()
            };
            return lines[start..end].join("\n");
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return trimmed[start..=end].to_string();
        }
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_parse_year_constraints() {
        let parsed = rule_based_parse("transformers since 2020");
        assert_eq!(parsed.years, vec![">2020"]);
        assert_eq!(parsed.keywords, vec!["transformers"]);

        let parsed = rule_based_parse("protein folding 2018-2022");
        assert_eq!(parsed.years, vec!["2018-2022"]);

        let parsed = rule_based_parse("quantum computing before 2015");
        assert_eq!(parsed.years, vec!["<2015"]);

        let parsed = rule_based_parse("climate models 2021");
        assert_eq!(parsed.years, vec!["2021"]);
    }

    #[test]
    fn test_rule_parse_authors() {
        let parsed = rule_based_parse("attention papers by Ashish Vaswani");
        assert_eq!(parsed.authors, vec!["Ashish Vaswani"]);
        assert_eq!(parsed.keywords, vec!["attention"]);
    }

    #[test]
    fn test_rule_parse_institutions() {
        let parsed = rule_based_parse("robotics research at MIT");
        assert_eq!(parsed.institutions, vec!["MIT"]);
        assert!(parsed.keywords.contains(&"robotics".to_string()));
        // "at" survives stopword filtering only if listed; ensure no MIT token
        assert!(!parsed.keywords.iter().any(|k| k.eq_ignore_ascii_case("mit")));
    }

    #[test]
    fn test_rule_parse_plain_keywords() {
        let parsed = rule_based_parse("graph neural networks");
        assert_eq!(parsed.keywords, vec!["graph", "neural", "networks"]);
        assert!(parsed.authors.is_empty());
        assert!(parsed.years.is_empty());
    }

    #[test]
    fn test_empty_query_is_empty() {
        assert!(rule_based_parse("").is_empty());
    }

    #[test]
    fn test_extract_json_plain_and_fenced() {
        let plain = r#"{"keywords": ["a"], "authors": [], "years": [], "institutions": []}"#;
        assert!(extract_json(plain).contains("\"keywords\""));

        let fenced = "```json\n{\"keywords\": [\"a\"]}\n```";
        assert_eq!(extract_json(fenced), "{\"keywords\": [\"a\"]}");

        let prose = "Sure! {\"keywords\": [\"a\"]} hope that helps";
        assert!(extract_json(prose).starts_with('{'));
        assert!(extract_json(prose).ends_with('}'));
    }

    #[tokio::test]
    async fn test_parser_without_llm_uses_rules() {
        let parser = QueryParser::new(None);
        let parsed = parser.parse("diffusion models by Jascha Sohl-Dickstein").await;
        assert_eq!(parsed.authors, vec!["Jascha Sohl-Dickstein"]);
        assert!(parsed.keywords.contains(&"diffusion".to_string()));
    }
}
