//! Search engine: structured and natural-language paper search.
//!
//! Both entry shapes converge on one plan: resolve author display names to
//! upstream ids (unresolved names degrade to keyword tokens), build a
//! [`WorkFilter`], issue a single upstream call, write the results through
//! the paper cache, and dedupe.
//!
//! Concurrent identical requests coalesce on a fingerprint of
//! (principal, filter, sort, page, per_page); completed responses also feed a
//! short-lived per-fingerprint cache used to degrade when the upstream index
//! rate-limits or fails transiently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::error::{Result, ScholarError};
use crate::models::{EntityType, Paper};
use crate::openalex::{OpenAlexClient, SortBy, WorkFilter, YearFilter};
use crate::paper_store::PaperStore;
use crate::query_parser::QueryParser;

/// Server-side default page size
pub const DEFAULT_PER_PAGE: u32 = 200;

/// Author ids contributed by each resolved display name
const AUTHOR_IDS_PER_NAME: u32 = 3;

/// How long a served fingerprint may back a degraded response
const REQUEST_CACHE_TTL: Duration = Duration::from_secs(300);

/// Structured search input.
#[derive(Debug, Clone, Default)]
pub struct StructuredQuery {
    pub topics: Vec<String>,
    pub authors: Vec<String>,
    pub years: Vec<String>,
    pub institutions: Vec<String>,
    pub sort_by: SortBy,
    pub page: u32,
    pub per_page: u32,
}

/// Failure shape shared between coalesced callers.
#[derive(Debug, Clone)]
enum SharedFailure {
    RateLimited(Option<u64>),
    Upstream(String),
    Timeout(String),
}

impl SharedFailure {
    fn from_error(e: &ScholarError) -> Self {
        match e {
            ScholarError::RateLimited(hint) => SharedFailure::RateLimited(*hint),
            ScholarError::UpstreamTimeout(msg) => SharedFailure::Timeout(msg.clone()),
            other => SharedFailure::Upstream(other.to_string()),
        }
    }

    fn into_error(self) -> ScholarError {
        match self {
            SharedFailure::RateLimited(hint) => ScholarError::RateLimited(hint),
            SharedFailure::Timeout(msg) => ScholarError::UpstreamTimeout(msg),
            SharedFailure::Upstream(msg) => ScholarError::Upstream(msg),
        }
    }
}

type SharedOutcome = std::result::Result<Arc<Vec<Paper>>, SharedFailure>;

struct CachedResponse {
    papers: Arc<Vec<Paper>>,
    served_at: Instant,
}

/// Paper search over the upstream index, with write-through caching.
pub struct SearchEngine {
    openalex: Arc<OpenAlexClient>,
    papers: Arc<PaperStore>,
    parser: Arc<QueryParser>,
    in_flight: Mutex<HashMap<String, Arc<OnceCell<SharedOutcome>>>>,
    request_cache: Mutex<HashMap<String, CachedResponse>>,
}

impl SearchEngine {
    pub fn new(
        openalex: Arc<OpenAlexClient>,
        papers: Arc<PaperStore>,
        parser: Arc<QueryParser>,
    ) -> Self {
        Self {
            openalex,
            papers,
            parser,
            in_flight: Mutex::new(HashMap::new()),
            request_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Structured search. Results are deduped but NOT filtered by the user's
    /// prior feedback, so pagination stays stable across revisits.
    pub async fn search(&self, principal: &str, query: StructuredQuery) -> Result<Vec<Paper>> {
        let page = query.page.max(1);
        let per_page = if query.per_page == 0 {
            DEFAULT_PER_PAGE
        } else {
            query.per_page.min(DEFAULT_PER_PAGE)
        };

        let filter = self.build_filter(&query).await?;
        if filter.is_empty() {
            return Err(ScholarError::Validation(
                "search needs at least one topic, author, or keyword".to_string(),
            ));
        }

        let fingerprint = fingerprint(principal, &filter, query.sort_by, page, per_page);
        debug!(fingerprint = %fingerprint, filter = %filter.summary(), "Search plan ready");

        // Single-flight: one cell per fingerprint, all callers await the same
        // outcome. The map lock is held only to read or insert the cell.
        let cell = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight
                .entry(fingerprint.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let outcome = cell
            .get_or_init(|| self.execute(&filter, query.sort_by, page, per_page))
            .await
            .clone();
        {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.remove(&fingerprint);
        }

        match outcome {
            Ok(papers) => {
                let mut cache = self.request_cache.lock().await;
                cache.retain(|_, c| c.served_at.elapsed() < REQUEST_CACHE_TTL);
                cache.insert(
                    fingerprint,
                    CachedResponse {
                        papers: papers.clone(),
                        served_at: Instant::now(),
                    },
                );
                Ok(papers.as_ref().clone())
            }
            Err(failure) => {
                let cache = self.request_cache.lock().await;
                if let Some(cached) = cache.get(&fingerprint) {
                    if cached.served_at.elapsed() < REQUEST_CACHE_TTL {
                        warn!(
                            fingerprint = %fingerprint,
                            "Upstream unavailable, serving cached fingerprint"
                        );
                        return Ok(cached.papers.as_ref().clone());
                    }
                }
                Err(failure.into_error())
            }
        }
    }

    /// Natural-language search: parse the text, fall back to treating the
    /// whole query as keywords when extraction yields nothing.
    pub async fn search_text(
        &self,
        principal: &str,
        q: &str,
        sort_by: SortBy,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<Paper>> {
        let q = q.trim();
        if q.is_empty() {
            return Err(ScholarError::Validation("query is empty".to_string()));
        }

        let parsed = self.parser.parse(q).await;
        let query = if parsed.is_empty() {
            StructuredQuery {
                topics: vec![q.to_string()],
                sort_by,
                page,
                per_page,
                ..Default::default()
            }
        } else {
            StructuredQuery {
                topics: parsed.keywords,
                authors: parsed.authors,
                years: parsed.years,
                institutions: parsed.institutions,
                sort_by,
                page,
                per_page,
            }
        };
        self.search(principal, query).await
    }

    /// Resolve names and compose the upstream filter.
    async fn build_filter(&self, query: &StructuredQuery) -> Result<WorkFilter> {
        let mut keyword_groups: Vec<Vec<String>> = query
            .topics
            .iter()
            .map(|topic| tokenize(topic))
            .filter(|g| !g.is_empty())
            .collect();

        let mut author_ids = Vec::new();
        if !query.authors.is_empty() {
            let resolution = self
                .openalex
                .resolve_author_ids(&query.authors, AUTHOR_IDS_PER_NAME)
                .await?;
            author_ids = resolution.author_ids;
            for name in resolution.unresolved {
                // Best effort: an unresolvable name still narrows the search
                keyword_groups.push(tokenize(&name));
            }
        }

        let mut institution_ids = Vec::new();
        for name in &query.institutions {
            match self
                .openalex
                .search_entities(EntityType::Institution, name, 1)
                .await
            {
                Ok(entities) if !entities.is_empty() => {
                    institution_ids.extend(entities.into_iter().map(|e| e.id));
                }
                Ok(_) => keyword_groups.push(tokenize(name)),
                Err(e) => {
                    warn!(institution = %name, error = %e, "Institution lookup failed");
                    keyword_groups.push(tokenize(name));
                }
            }
        }

        let year = query.years.iter().find_map(|y| YearFilter::parse(y));

        Ok(WorkFilter {
            keyword_groups,
            author_ids,
            institution_ids,
            year,
            ..Default::default()
        })
    }

    /// The one upstream call behind the single-flight cell.
    async fn execute(
        &self,
        filter: &WorkFilter,
        sort: SortBy,
        page: u32,
        per_page: u32,
    ) -> SharedOutcome {
        let outcome = self
            .openalex
            .search_works(filter, sort, page, per_page)
            .await;

        match outcome {
            Ok(work_page) => {
                let papers = order_results(dedupe_papers(work_page.papers), sort);
                if let Err(e) = self.papers.put_many(papers.clone()).await {
                    warn!(error = %e, "Failed to cache search results");
                }
                info!(count = papers.len(), "Search complete");
                Ok(Arc::new(papers))
            }
            Err(e) => {
                warn!(filter = %filter.summary(), error = %e, "Search failed");
                Err(SharedFailure::from_error(&e))
            }
        }
    }
}

/// Split a phrase into filter tokens.
fn tokenize(phrase: &str) -> Vec<String> {
    phrase
        .split_whitespace()
        .map(|t| t.to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Drop repeated paper ids, keeping the first occurrence.
pub fn dedupe_papers(papers: Vec<Paper>) -> Vec<Paper> {
    let mut seen = HashSet::new();
    papers
        .into_iter()
        .filter(|p| !p.paper_id.is_empty() && seen.insert(p.paper_id.clone()))
        .collect()
}

/// Apply the local ordering contract on top of the upstream ordering.
///
/// Recency responses order by publication year descending with the paper id
/// as the tiebreaker, so same-year papers keep one deterministic order across
/// identical upstream responses. Relevance responses re-rank by score, then
/// citation count, then id.
fn order_results(mut papers: Vec<Paper>, sort: SortBy) -> Vec<Paper> {
    match sort {
        SortBy::Recency => {
            papers.sort_by(|a, b| {
                b.year
                    .unwrap_or(i32::MIN)
                    .cmp(&a.year.unwrap_or(i32::MIN))
                    .then_with(|| a.paper_id.cmp(&b.paper_id))
            });
        }
        SortBy::Relevance => {
            papers.sort_by(|a, b| {
                let score_a = a.relevance_score.unwrap_or(0.0);
                let score_b = b.relevance_score.unwrap_or(0.0);
                score_b
                    .partial_cmp(&score_a)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.citation_count.unwrap_or(0).cmp(&a.citation_count.unwrap_or(0)))
                    .then_with(|| a.paper_id.cmp(&b.paper_id))
            });
        }
    }
    papers
}

/// Deterministic hash over everything that defines a response.
fn fingerprint(principal: &str, filter: &WorkFilter, sort: SortBy, page: u32, per_page: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(principal.as_bytes());
    hasher.update([0u8]);
    hasher.update(filter.to_filter_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(format!("{:?}|{}|{}", sort, page, per_page).as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
