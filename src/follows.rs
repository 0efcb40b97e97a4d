//! Following feed: fan-out across the user's follow set.
//!
//! Each follow edge fetches its entity's latest works in parallel (bounded
//! concurrency); a custom follow delegates to the search engine with its
//! stored free-text query. Batches merge by publication year descending with
//! the paper id as a stable tiebreaker, dedupe by id, and truncate to the
//! global cap.
//!
//! A task that fails after retries contributes nothing; the feed succeeds as
//! long as one task succeeds. If every task fails, the engine serves the
//! user's last merged feed when one exists.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Result, ScholarError};
use crate::models::{EntityType, Follow, Paper};
use crate::openalex::OpenAlexClient;
use crate::paper_store::PaperStore;
use crate::query_parser::QueryParser;
use crate::search::{SearchEngine, StructuredQuery};
use crate::user_store::UserStore;

/// Works fetched per followed entity unless the caller narrows it
pub const DEFAULT_PER_ENTITY: u32 = 50;

/// Global cap on the merged feed
pub const DEFAULT_TOTAL_LIMIT: usize = 200;

/// Simultaneous per-entity fetch tasks
const FAN_OUT_CONCURRENCY: usize = 8;

/// Follow fan-out engine.
pub struct FollowEngine {
    openalex: Arc<OpenAlexClient>,
    papers: Arc<PaperStore>,
    users: Arc<UserStore>,
    search: Arc<SearchEngine>,
    parser: Arc<QueryParser>,
    /// Last successfully merged feed per user, for the all-failed fallback
    feed_cache: Mutex<HashMap<String, Vec<Paper>>>,
}

impl FollowEngine {
    pub fn new(
        openalex: Arc<OpenAlexClient>,
        papers: Arc<PaperStore>,
        users: Arc<UserStore>,
        search: Arc<SearchEngine>,
        parser: Arc<QueryParser>,
    ) -> Self {
        Self {
            openalex,
            papers,
            users,
            search,
            parser,
            feed_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Build the following feed for one user.
    pub async fn feed(
        &self,
        user_id: &str,
        per_entity_limit: u32,
        total_limit: usize,
    ) -> Result<Vec<Paper>> {
        let follows = self.users.list_follows(user_id).await;
        if follows.is_empty() {
            return Ok(Vec::new());
        }
        let total = follows.len();

        let outcomes: Vec<Result<Vec<Paper>>> = stream::iter(follows)
            .map(|follow| self.fetch_one(user_id, follow, per_entity_limit))
            .buffer_unordered(FAN_OUT_CONCURRENCY)
            .collect()
            .await;

        let mut batches = Vec::new();
        let mut last_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(batch) => batches.push(batch),
                Err(e) => last_error = Some(e),
            }
        }

        if batches.is_empty() {
            let cache = self.feed_cache.lock().await;
            if let Some(cached) = cache.get(user_id) {
                warn!(user = %user_id, "All follow fetches failed, serving cached feed");
                return Ok(cached.clone());
            }
            return Err(last_error.unwrap_or_else(|| {
                ScholarError::Upstream("follow fan-out produced nothing".to_string())
            }));
        }

        let merged = merge_feed(batches, total_limit);
        info!(
            user = %user_id,
            follows = total,
            papers = merged.len(),
            "Following feed merged"
        );

        self.papers.put_many(merged.clone()).await?;
        self.feed_cache
            .lock()
            .await
            .insert(user_id.to_string(), merged.clone());
        Ok(merged)
    }

    /// Fetch the contribution of one follow edge. Failures are logged here
    /// and surfaced to the caller for the all-failed check only.
    async fn fetch_one(
        &self,
        user_id: &str,
        follow: Follow,
        per_entity_limit: u32,
    ) -> Result<Vec<Paper>> {
        let outcome = match follow.entity_type {
            EntityType::Custom => {
                // The stored upstream_id of a custom follow is the query text
                let parsed = self.parser.parse(&follow.upstream_id).await;
                let query = StructuredQuery {
                    topics: if parsed.is_empty() {
                        vec![follow.upstream_id.clone()]
                    } else {
                        parsed.keywords
                    },
                    authors: parsed.authors,
                    years: parsed.years,
                    institutions: parsed.institutions,
                    page: 1,
                    per_page: per_entity_limit,
                    ..Default::default()
                };
                self.search.search(user_id, query).await
            }
            entity_type => {
                self.openalex
                    .works_by_entity(entity_type, &follow.upstream_id, per_entity_limit)
                    .await
            }
        };

        if let Err(ref e) = outcome {
            warn!(
                entity = %follow.entity_id,
                entity_type = %follow.entity_type,
                error = %e,
                "Follow fetch failed"
            );
        }
        outcome
    }
}

/// Merge per-entity batches: dedupe by id keeping the first occurrence, sort
/// by year descending with the paper id as a stable tiebreaker, truncate.
pub fn merge_feed(batches: Vec<Vec<Paper>>, total_limit: usize) -> Vec<Paper> {
    let mut merged = crate::search::dedupe_papers(batches.into_iter().flatten().collect());
    merged.sort_by(|a, b| {
        b.year
            .unwrap_or(i32::MIN)
            .cmp(&a.year.unwrap_or(i32::MIN))
            .then_with(|| a.paper_id.cmp(&b.paper_id))
    });
    merged.truncate(total_limit);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn paper(id: &str, year: i32) -> Paper {
        Paper {
            year: Some(year),
            ..Paper::stub(id)
        }
    }

    #[test]
    fn test_merge_feed_dedupes_and_sorts() {
        // Author batch: 2020, 2022, 2023; topic batch: 2021 plus a duplicate
        // of the author's 2023 paper
        let author_batch = vec![paper("W20", 2020), paper("W22", 2022), paper("W23", 2023)];
        let topic_batch = vec![paper("W21", 2021), paper("W23", 2023)];

        let merged = merge_feed(vec![author_batch, topic_batch], 10);
        let years: Vec<i32> = merged.iter().filter_map(|p| p.year).collect();
        assert_eq!(years, vec![2023, 2022, 2021, 2020]);
        let ids: Vec<&str> = merged.iter().map(|p| p.paper_id.as_str()).collect();
        assert_eq!(ids.len(), 4);
        assert_eq!(
            ids.iter().collect::<std::collections::HashSet<_>>().len(),
            4
        );
    }

    #[test]
    fn test_merge_feed_ties_break_on_id() {
        let merged = merge_feed(
            vec![vec![paper("Wb", 2023)], vec![paper("Wa", 2023)]],
            10,
        );
        let ids: Vec<&str> = merged.iter().map(|p| p.paper_id.as_str()).collect();
        assert_eq!(ids, vec!["Wa", "Wb"]);
    }

    #[test]
    fn test_merge_feed_truncates_to_total_limit() {
        let batch: Vec<Paper> = (0..50).map(|i| paper(&format!("W{}", i), 2000 + i)).collect();
        let merged = merge_feed(vec![batch], 10);
        assert_eq!(merged.len(), 10);
        assert_eq!(merged[0].year, Some(2049));
    }

    /// Fixture answering works-by-entity calls with per-entity batches.
    async fn spawn_fixture(hits: Arc<AtomicUsize>) -> String {
        use axum::extract::RawQuery;
        use axum::routing::get;

        let app = axum::Router::new().route(
            "/works",
            get(move |RawQuery(query): RawQuery| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let query = query.unwrap_or_default();
                    let results = if query.contains("authorships.author.id") {
                        serde_json::json!([
                            {"id": "https://openalex.org/W23", "display_name": "A-2023",
                             "publication_year": 2023},
                            {"id": "https://openalex.org/W22", "display_name": "A-2022",
                             "publication_year": 2022},
                            {"id": "https://openalex.org/W20", "display_name": "A-2020",
                             "publication_year": 2020}
                        ])
                    } else {
                        serde_json::json!([
                            {"id": "https://openalex.org/W23", "display_name": "T-dup",
                             "publication_year": 2023},
                            {"id": "https://openalex.org/W21", "display_name": "T-2021",
                             "publication_year": 2021}
                        ])
                    };
                    axum::Json(serde_json::json!({
                        "meta": {"count": 3},
                        "results": results
                    }))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}", addr)
    }

    fn follow(entity_type: EntityType, id: &str) -> Follow {
        Follow {
            entity_type,
            entity_id: id.to_string(),
            entity_name: id.to_string(),
            upstream_id: id.to_string(),
            followed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_feed_fans_out_and_merges() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base_url = spawn_fixture(hits.clone()).await;

        let openalex = Arc::new(OpenAlexClient::with_base_url(&base_url, None).unwrap());
        let papers = Arc::new(PaperStore::in_memory());
        let users = Arc::new(UserStore::in_memory());
        let parser = Arc::new(QueryParser::new(None));
        let search = Arc::new(SearchEngine::new(
            openalex.clone(),
            papers.clone(),
            parser.clone(),
        ));
        let engine = FollowEngine::new(openalex, papers.clone(), users.clone(), search, parser);

        users
            .follow("u1", follow(EntityType::Author, "A1"))
            .await
            .unwrap();
        users
            .follow("u1", follow(EntityType::Topic, "T1"))
            .await
            .unwrap();

        let feed = engine.feed("u1", 10, 10).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let years: Vec<i32> = feed.iter().filter_map(|p| p.year).collect();
        assert_eq!(years, vec![2023, 2022, 2021, 2020]);
        let ids: Vec<&str> = feed.iter().map(|p| p.paper_id.as_str()).collect();
        assert_eq!(
            ids.iter().collect::<std::collections::HashSet<_>>().len(),
            ids.len()
        );

        // Feed papers land in the shared cache
        assert!(papers.get("W21").await.is_some());
    }

    #[tokio::test]
    async fn test_feed_without_follows_is_empty() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base_url = spawn_fixture(hits).await;

        let openalex = Arc::new(OpenAlexClient::with_base_url(&base_url, None).unwrap());
        let papers = Arc::new(PaperStore::in_memory());
        let users = Arc::new(UserStore::in_memory());
        let parser = Arc::new(QueryParser::new(None));
        let search = Arc::new(SearchEngine::new(
            openalex.clone(),
            papers.clone(),
            parser.clone(),
        ));
        let engine = FollowEngine::new(openalex, papers, users, search, parser);

        let feed = engine.feed("u1", 10, 10).await.unwrap();
        assert!(feed.is_empty());
    }
}
