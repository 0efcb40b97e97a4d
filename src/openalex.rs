//! OpenAlex API client.
//!
//! Stateless adapter over the OpenAlex works/entities endpoints. All feed
//! engines go through this client; nothing else in the service talks to the
//! upstream index.
//!
//! API best practices (per OpenAlex docs):
//! - Use `mailto:email` for polite pool (10 req/s vs 1 req/s)
//! - `per-page` caps at 200
//! - Exponential backoff on 429 and transient 5xx

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{Result, ScholarError};
use crate::models::{Entity, EntityType, Paper, PaperAuthor};

/// OpenAlex API base URL
pub const OPENALEX_API_BASE: &str = "https://api.openalex.org";

/// Maximum results per page (OpenAlex limit)
pub const MAX_PER_PAGE: u32 = 200;

/// Maximum ids per bulk works request
const BULK_CHUNK_SIZE: usize = 100;

/// Simultaneous in-flight upstream requests
const MAX_IN_FLIGHT: usize = 8;

/// Per-call timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Work fields requested from the API
const WORK_SELECT: &str = "id,title,display_name,publication_year,publication_date,doi,\
cited_by_count,abstract_inverted_index,authorships,primary_location,relevance_score,\
related_works";

/// Requested sort order for work searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Recency,
    Relevance,
}

impl SortBy {
    fn upstream_param(&self) -> &'static str {
        match self {
            SortBy::Recency => "publication_date:desc",
            SortBy::Relevance => "relevance_score:desc",
        }
    }
}

/// Publication-year constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YearFilter {
    Exact(i32),
    After(i32),
    Before(i32),
    Range(i32, i32),
}

impl YearFilter {
    /// Parse the query-parser year vocabulary: `2020`, `>2020`, `<2020`,
    /// `2019-2023`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix('>') {
            return rest.parse().ok().map(YearFilter::After);
        }
        if let Some(rest) = s.strip_prefix('<') {
            return rest.parse().ok().map(YearFilter::Before);
        }
        if let Some((lo, hi)) = s.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse(), hi.parse()) {
                return Some(YearFilter::Range(lo, hi));
            }
        }
        s.parse().ok().map(YearFilter::Exact)
    }

    fn filter_value(&self) -> String {
        match self {
            YearFilter::Exact(y) => y.to_string(),
            YearFilter::After(y) => format!(">{}", y),
            YearFilter::Before(y) => format!("<{}", y),
            YearFilter::Range(lo, hi) => format!("{}-{}", lo, hi),
        }
    }
}

/// Structured work filter: conjunctions over token groups, resolved entity
/// ids, and a year constraint. Serializes to the OpenAlex `filter=` syntax.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkFilter {
    /// Title/abstract search groups: OR within a group, AND across groups
    pub keyword_groups: Vec<Vec<String>>,
    pub author_ids: Vec<String>,
    pub institution_ids: Vec<String>,
    pub source_ids: Vec<String>,
    pub topic_ids: Vec<String>,
    pub year: Option<YearFilter>,
}

impl WorkFilter {
    pub fn is_empty(&self) -> bool {
        self.keyword_groups.iter().all(|g| g.is_empty())
            && self.author_ids.is_empty()
            && self.institution_ids.is_empty()
            && self.source_ids.is_empty()
            && self.topic_ids.is_empty()
            && self.year.is_none()
    }

    /// Render the `filter=` parameter value. Commas separate conjuncts, pipes
    /// separate alternatives within one conjunct.
    pub fn to_filter_string(&self) -> String {
        let sanitize = |s: &str| s.replace([',', '|'], " ").trim().to_string();
        let mut parts = Vec::new();

        for group in &self.keyword_groups {
            let tokens: Vec<String> = group
                .iter()
                .map(|t| sanitize(t))
                .filter(|t| !t.is_empty())
                .collect();
            if !tokens.is_empty() {
                parts.push(format!("title_and_abstract.search:{}", tokens.join("|")));
            }
        }
        if !self.author_ids.is_empty() {
            parts.push(format!(
                "authorships.author.id:{}",
                self.author_ids.join("|")
            ));
        }
        if !self.institution_ids.is_empty() {
            parts.push(format!(
                "authorships.institutions.id:{}",
                self.institution_ids.join("|")
            ));
        }
        if !self.source_ids.is_empty() {
            parts.push(format!(
                "primary_location.source.id:{}",
                self.source_ids.join("|")
            ));
        }
        if !self.topic_ids.is_empty() {
            parts.push(format!("topics.id:{}", self.topic_ids.join("|")));
        }
        if let Some(year) = &self.year {
            parts.push(format!("publication_year:{}", year.filter_value()));
        }

        parts.join(",")
    }

    /// Short human-readable summary for error messages and logs.
    pub fn summary(&self) -> String {
        let keywords: Vec<String> = self.keyword_groups.iter().map(|g| g.join("|")).collect();
        format!(
            "keywords=[{}] authors={} institutions={} sources={} topics={}",
            keywords.join(", "),
            self.author_ids.len(),
            self.institution_ids.len(),
            self.source_ids.len(),
            self.topic_ids.len()
        )
    }
}

/// One page of works from upstream.
#[derive(Debug, Clone)]
pub struct WorkPage {
    pub papers: Vec<Paper>,
    pub has_more: bool,
}

/// Outcome of resolving author display names to upstream ids.
#[derive(Debug, Clone, Default)]
pub struct AuthorResolution {
    pub author_ids: Vec<String>,
    /// Names with no upstream match; kept as keyword tokens by the engine
    pub unresolved: Vec<String>,
}

/// Client for the OpenAlex HTTP API.
///
/// Cheap to share: wrap in `Arc` and call from any number of tasks. A
/// process-wide semaphore bounds concurrent upstream requests.
pub struct OpenAlexClient {
    client: reqwest::Client,
    base_url: String,
    mailto: Option<String>,
    semaphore: Arc<Semaphore>,
    max_retries: u32,
}

impl OpenAlexClient {
    pub fn new(mailto: Option<String>) -> Result<Self> {
        Self::with_base_url(OPENALEX_API_BASE, mailto)
    }

    /// Build a client against a non-default base URL (fixture servers in
    /// tests).
    pub fn with_base_url(base_url: &str, mailto: Option<String>) -> Result<Self> {
        let ua = match mailto {
            Some(ref e) => format!("scholarfeed/0.1 (mailto:{})", e),
            None => "scholarfeed/0.1".to_string(),
        };
        let client = reqwest::Client::builder()
            .user_agent(ua)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ScholarError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            mailto,
            semaphore: Arc::new(Semaphore::new(MAX_IN_FLIGHT)),
            max_retries: 3,
        })
    }

    /// Search works with a structured filter.
    pub async fn search_works(
        &self,
        filter: &WorkFilter,
        sort: SortBy,
        page: u32,
        per_page: u32,
    ) -> Result<WorkPage> {
        let per_page = per_page.min(MAX_PER_PAGE).max(1);
        let page = page.max(1);
        let mut url = format!(
            "{}/works?filter={}&sort={}&page={}&per-page={}&select={}",
            self.base_url,
            urlencoding::encode(&filter.to_filter_string()),
            sort.upstream_param(),
            page,
            per_page,
            WORK_SELECT,
        );
        self.append_mailto(&mut url);

        let response: WorksResponse = self.get_json(&url).await?;
        let total = response.meta.as_ref().map(|m| m.count).unwrap_or(0);
        let has_more = total > (page as i64) * (per_page as i64);
        let papers = response.results.iter().map(work_to_paper).collect();
        Ok(WorkPage { papers, has_more })
    }

    /// Fetch a single work by id. 404 maps to `None`.
    pub async fn fetch_work_by_id(&self, paper_id: &str) -> Result<Option<Paper>> {
        let mut url = format!(
            "{}/works/{}?select={}",
            self.base_url,
            urlencoding::encode(paper_id),
            WORK_SELECT
        );
        self.append_mailto(&mut url);

        match self.get_json::<OAWork>(&url).await {
            Ok(work) => Ok(Some(work_to_paper(&work))),
            Err(ScholarError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Bulk fetch works by id.
    ///
    /// Input is chunked into requests of at most [`BULK_CHUNK_SIZE`] ids; a
    /// failed chunk is logged and dropped rather than failing the whole call.
    /// Output order is not meaningful; missing ids are silently absent.
    pub async fn fetch_works_by_ids(&self, ids: &[String]) -> Result<Vec<Paper>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let chunks: Vec<Vec<String>> = ids.chunks(BULK_CHUNK_SIZE).map(|c| c.to_vec()).collect();
        let results: Vec<Vec<Paper>> = stream::iter(chunks)
            .map(|chunk| async move {
                let mut url = format!(
                    "{}/works?filter=openalex_id:{}&per-page={}&select={}",
                    self.base_url,
                    chunk.join("|"),
                    BULK_CHUNK_SIZE,
                    WORK_SELECT
                );
                self.append_mailto(&mut url);
                match self.get_json::<WorksResponse>(&url).await {
                    Ok(response) => response.results.iter().map(work_to_paper).collect(),
                    Err(e) => {
                        warn!(chunk_len = chunk.len(), error = %e, "Bulk works chunk failed");
                        Vec::new()
                    }
                }
            })
            .buffer_unordered(4)
            .collect()
            .await;

        Ok(results.into_iter().flatten().collect())
    }

    /// Search authors/institutions/topics/sources by free text.
    pub async fn search_entities(
        &self,
        entity_type: EntityType,
        q: &str,
        limit: u32,
    ) -> Result<Vec<Entity>> {
        let path = entity_type.upstream_path().ok_or_else(|| {
            ScholarError::Validation("custom follows have no upstream entity search".to_string())
        })?;
        let mut url = format!(
            "{}/{}?search={}&per-page={}",
            self.base_url,
            path,
            urlencoding::encode(q),
            limit.min(50).max(1)
        );
        self.append_mailto(&mut url);

        let response: EntitiesResponse = self.get_json(&url).await?;
        Ok(response
            .results
            .iter()
            .filter_map(|e| entity_from_row(entity_type, e))
            .collect())
    }

    /// Latest works for a followed entity, publication date descending.
    pub async fn works_by_entity(
        &self,
        entity_type: EntityType,
        upstream_id: &str,
        limit: u32,
    ) -> Result<Vec<Paper>> {
        let filter_key = match entity_type {
            EntityType::Author => "authorships.author.id",
            EntityType::Institution => "authorships.institutions.id",
            EntityType::Topic => "topics.id",
            EntityType::Source => "primary_location.source.id",
            EntityType::Custom => {
                return Err(ScholarError::Validation(
                    "custom follows are served by the search engine".to_string(),
                ))
            }
        };
        let mut url = format!(
            "{}/works?filter={}:{}&sort=publication_date:desc&per-page={}&select={}",
            self.base_url,
            filter_key,
            urlencoding::encode(upstream_id),
            limit.min(MAX_PER_PAGE).max(1),
            WORK_SELECT
        );
        self.append_mailto(&mut url);

        let response: WorksResponse = self.get_json(&url).await?;
        Ok(response.results.iter().map(work_to_paper).collect())
    }

    /// Works related to a paper, via the record's own related-works list.
    pub async fn related_works(&self, paper_id: &str, limit: u32) -> Result<Vec<Paper>> {
        let mut url = format!(
            "{}/works/{}?select=id,related_works",
            self.base_url,
            urlencoding::encode(paper_id)
        );
        self.append_mailto(&mut url);

        let work = match self.get_json::<OAWork>(&url).await {
            Ok(work) => work,
            Err(ScholarError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let related: Vec<String> = work
            .related_works
            .unwrap_or_default()
            .iter()
            .map(|id| short_id(id))
            .take(limit as usize)
            .collect();
        self.fetch_works_by_ids(&related).await
    }

    /// Resolve author display names to upstream author ids.
    ///
    /// Each name contributes its top `per_name_limit` matches; names with no
    /// match are returned in `unresolved` so the caller can degrade them to
    /// keyword tokens.
    pub async fn resolve_author_ids(
        &self,
        names: &[String],
        per_name_limit: u32,
    ) -> Result<AuthorResolution> {
        let lookups = names.iter().map(|name| async move {
            let found = self
                .search_entities(EntityType::Author, name, per_name_limit)
                .await;
            (name.clone(), found)
        });
        let outcomes = futures::future::join_all(lookups).await;

        let mut resolution = AuthorResolution::default();
        for (name, found) in outcomes {
            match found {
                Ok(entities) if !entities.is_empty() => {
                    resolution.author_ids.extend(entities.into_iter().map(|e| e.id));
                }
                Ok(_) => resolution.unresolved.push(name),
                Err(e) => {
                    warn!(author = %name, error = %e, "Author lookup failed");
                    resolution.unresolved.push(name);
                }
            }
        }
        Ok(resolution)
    }

    fn append_mailto(&self, url: &mut String) {
        if let Some(ref mailto) = self.mailto {
            url.push_str("&mailto=");
            url.push_str(&urlencoding::encode(mailto));
        }
    }

    /// GET with retry. Transient 5xx and network errors back off
    /// exponentially; 429 honors `Retry-After`; other 4xx fail immediately.
    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ScholarError::Internal("request limiter closed".to_string()))?;

        let mut backoff = Duration::from_millis(500);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = self.client.get(url).send().await;

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<T>()
                            .await
                            .map_err(|e| ScholarError::Upstream(format!("bad response body: {}", e)));
                    }
                    if status == reqwest::StatusCode::NOT_FOUND {
                        return Err(ScholarError::NotFound("upstream record".to_string()));
                    }
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        let hint = retry_after_secs(&response);
                        if attempt > self.max_retries {
                            return Err(ScholarError::RateLimited(hint));
                        }
                        let wait = hint
                            .map(Duration::from_secs)
                            .unwrap_or(backoff)
                            .max(backoff);
                        warn!(attempt = attempt, wait_secs = wait.as_secs(), "Rate limited, backing off");
                        tokio::time::sleep(wait).await;
                        backoff *= 2;
                        continue;
                    }
                    if status.is_server_error() {
                        if attempt > self.max_retries {
                            return Err(ScholarError::Upstream(format!(
                                "upstream returned {} after {} attempts",
                                status, attempt
                            )));
                        }
                        debug!(attempt = attempt, status = %status, "Transient upstream error");
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                        continue;
                    }
                    // Remaining 4xx are caller errors, not worth retrying
                    return Err(ScholarError::Upstream(format!(
                        "upstream returned {}",
                        status
                    )));
                }
                Err(e) if e.is_timeout() => {
                    if attempt > self.max_retries {
                        return Err(ScholarError::UpstreamTimeout(e.to_string()));
                    }
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    if attempt > self.max_retries {
                        return Err(ScholarError::Upstream(e.to_string()));
                    }
                    debug!(attempt = attempt, error = %e, "Request failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
}

fn retry_after_secs(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

// === OpenAlex API response types ===

#[derive(Debug, Deserialize)]
struct WorksResponse {
    #[serde(default)]
    meta: Option<OAMeta>,
    #[serde(default)]
    results: Vec<OAWork>,
}

#[derive(Debug, Deserialize)]
struct OAMeta {
    #[serde(default)]
    count: i64,
}

#[derive(Debug, Deserialize)]
struct OAWork {
    id: Option<String>,
    title: Option<String>,
    display_name: Option<String>,
    publication_year: Option<i32>,
    doi: Option<String>,
    cited_by_count: Option<u64>,
    #[serde(rename = "abstract_inverted_index")]
    abstract_index: Option<HashMap<String, Vec<i64>>>,
    authorships: Option<Vec<OAAuthorship>>,
    primary_location: Option<OALocation>,
    relevance_score: Option<f64>,
    related_works: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct OAAuthorship {
    author: Option<OAAuthor>,
}

#[derive(Debug, Deserialize)]
struct OAAuthor {
    id: Option<String>,
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OALocation {
    source: Option<OASource>,
    landing_page_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OASource {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EntitiesResponse {
    #[serde(default)]
    results: Vec<OAEntityRow>,
}

#[derive(Debug, Deserialize)]
struct OAEntityRow {
    id: Option<String>,
    display_name: Option<String>,
    works_count: Option<u64>,
    // Author rows
    last_known_institutions: Option<Vec<OANamed>>,
    // Institution rows
    country_code: Option<String>,
    // Source rows
    host_organization_name: Option<String>,
    // Topic rows
    field: Option<OANamed>,
}

#[derive(Debug, Deserialize)]
struct OANamed {
    display_name: Option<String>,
}

/// Rows without an id or name are dropped; the hint carries the type-specific
/// detail the follow UI shows next to the name.
fn entity_from_row(entity_type: EntityType, row: &OAEntityRow) -> Option<Entity> {
    let upstream_id = row.id.clone()?;
    let name = row.display_name.clone()?;
    let hint = match entity_type {
        EntityType::Author => row
            .last_known_institutions
            .as_ref()
            .and_then(|list| list.first())
            .and_then(|i| i.display_name.clone()),
        EntityType::Institution => row.country_code.clone(),
        EntityType::Source => row.host_organization_name.clone(),
        EntityType::Topic => row.field.as_ref().and_then(|f| f.display_name.clone()),
        EntityType::Custom => None,
    };
    Some(Entity {
        id: short_id(&upstream_id),
        upstream_id,
        name,
        works_count: row.works_count,
        hint,
    })
}

/// Strip the `https://openalex.org/` prefix off an entity URL.
pub fn short_id(id: &str) -> String {
    id.rsplit('/').next().unwrap_or(id).to_string()
}

fn work_to_paper(work: &OAWork) -> Paper {
    let authors = work
        .authorships
        .as_ref()
        .map(|list| {
            list.iter()
                .filter_map(|a| a.author.as_ref())
                .filter_map(|a| {
                    a.display_name.as_ref().map(|name| PaperAuthor {
                        display_name: name.clone(),
                        author_id: a.id.as_deref().map(short_id),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let venue = work
        .primary_location
        .as_ref()
        .and_then(|l| l.source.as_ref())
        .and_then(|s| s.display_name.clone());
    let url = work
        .primary_location
        .as_ref()
        .and_then(|l| l.landing_page_url.clone())
        .or_else(|| work.id.clone());

    Paper {
        paper_id: work.id.as_deref().map(short_id).unwrap_or_default(),
        title: work
            .display_name
            .clone()
            .or_else(|| work.title.clone())
            .unwrap_or_default(),
        abstract_text: work.abstract_index.as_ref().and_then(reconstruct_abstract),
        tldr: None,
        authors,
        year: work.publication_year,
        venue,
        doi: work.doi.as_ref().map(|d| d.replace("https://doi.org/", "")),
        url,
        citation_count: work.cited_by_count,
        relevance_score: work.relevance_score,
    }
}

/// Reconstruct linear abstract text from an inverted index.
///
/// Each token is placed at each of its positions; unfilled slots collapse
/// into single spaces. Positions past the declared end simply extend the
/// buffer, and negative positions are ignored, so malformed indices cannot
/// panic. An empty index yields `None`.
fn reconstruct_abstract(index: &HashMap<String, Vec<i64>>) -> Option<String> {
    let mut slots: Vec<Option<&str>> = Vec::new();
    for (token, positions) in index {
        for &pos in positions {
            if pos < 0 {
                continue;
            }
            let pos = pos as usize;
            if pos >= slots.len() {
                slots.resize(pos + 1, None);
            }
            slots[pos] = Some(token.as_str());
        }
    }

    let text = slots
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
