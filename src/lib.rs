//! # scholarfeed
//!
//! Personalized scholarly-paper discovery service over the OpenAlex index.
//!
//! ## Modules
//!
//! - [`openalex`] - OpenAlex API client (search, bulk fetch, entities, related works)
//! - [`search`] - structured and natural-language search engine
//! - [`follows`] - following-feed fan-out engine
//! - [`recommend`] - recommendation engine
//! - [`paper_store`] / [`user_store`] - durable paper cache and per-user state
//! - [`query_parser`] - free-text query parsing (rule-based, optional LLM)
//! - [`auth`] - OAuth login and signed-cookie sessions
//! - [`server`] - HTTP surface
//! - [`error`] - custom error types

pub mod auth;
pub mod config;
pub mod error;
pub mod follows;
pub mod models;
pub mod openalex;
pub mod paper_store;
pub mod prompts;
pub mod query_parser;
pub mod recommend;
pub mod search;
pub mod server;
pub mod user_store;

pub use error::{Result, ScholarError};
