//! Prompt templates for LLM-backed components.

pub mod query_extraction;
