//! Entity-extraction prompts for free-text paper queries.
//!
//! Contains system and user prompt templates for LLM-based query parsing.

/// System prompt for search-query entity extraction
pub const SYSTEM_PROMPT: &str = r#"You extract structured search fields from a free-text scholarly-paper query.

Rules you MUST follow:
- Only use information present in the query; never invent names or years.
- Authors are personal names the query asks papers BY; institutions are universities, labs, or companies.
- Year entries are one of: "2020", ">2020", "<2020", "2018-2022".
- Everything that is neither an author, an institution, nor a year constraint belongs in keywords.
- If nothing matches a field, return an empty list for it.
- Output MUST be valid JSON only (no extra text), for machine parsing.

Output format (strict JSON, no markdown):
{
  "keywords": ["term1", "term2"],
  "authors": ["Full Name"],
  "years": [">2020"],
  "institutions": ["MIT"]
}"#;

/// Build the user prompt for one query
pub fn build_user_prompt(query: &str) -> String {
    format!("Query:\n{}\n\nExtract the fields now.", query)
}
