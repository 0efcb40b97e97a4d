//! "For you" feed: recommendations from profile interests and recent likes.
//!
//! Candidates come from a profile-driven structured search plus the related
//! works of the most recent likes. Papers the user has already acted on are
//! filtered out (against a feedback snapshot taken at request start), the
//! remainder is scored by topic match, author match, and recency, and the top
//! slice is returned. An empty profile with no likes yields an empty list,
//! not an error.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Datelike, Utc};
use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::error::Result;
use crate::models::{Paper, Profile};
use crate::openalex::{OpenAlexClient, SortBy};
use crate::paper_store::PaperStore;
use crate::search::{dedupe_papers, SearchEngine, StructuredQuery};
use crate::user_store::UserStore;

/// Default and maximum feed sizes
pub const DEFAULT_LIMIT: usize = 20;
pub const MAX_LIMIT: usize = 100;

/// Likes considered for related-works expansion
const MAX_RECENT_LIKES: usize = 10;

/// Related works fetched per liked paper
const RELATED_PER_LIKE: u32 = 5;

/// Ranking weights
const W_TOPIC: f64 = 2.0;
const W_AUTHOR: f64 = 1.5;
const W_YEAR: f64 = 1.0;

/// Recommendation engine.
pub struct RecommendEngine {
    openalex: Arc<OpenAlexClient>,
    papers: Arc<PaperStore>,
    users: Arc<UserStore>,
    search: Arc<SearchEngine>,
}

impl RecommendEngine {
    pub fn new(
        openalex: Arc<OpenAlexClient>,
        papers: Arc<PaperStore>,
        users: Arc<UserStore>,
        search: Arc<SearchEngine>,
    ) -> Self {
        Self {
            openalex,
            papers,
            users,
            search,
        }
    }

    /// Build the recommendation feed for one user.
    pub async fn recommend(&self, user_id: &str, limit: usize) -> Result<Vec<Paper>> {
        let limit = limit.clamp(1, MAX_LIMIT);
        let profile = self.users.get_profile(user_id).await;
        let recent_likes = self.users.recent_likes(user_id, MAX_RECENT_LIKES).await;

        if profile.is_empty() && recent_likes.is_empty() {
            info!(user = %user_id, "No profile and no likes, nothing to recommend");
            return Ok(Vec::new());
        }

        // Snapshot the feedback sets before any fan-out so the filter below
        // is stable for the whole request.
        let feedback = self.users.get_feedback(user_id).await;
        let seen: HashSet<String> = feedback
            .liked
            .iter()
            .chain(feedback.disliked.iter())
            .cloned()
            .collect();

        let mut candidates: Vec<Paper> = Vec::new();
        let mut last_error = None;

        if !profile.is_empty() {
            let query = StructuredQuery {
                topics: profile.topics.clone(),
                authors: profile.authors.clone(),
                sort_by: SortBy::Recency,
                page: 1,
                per_page: MAX_LIMIT as u32,
                ..Default::default()
            };
            match self.search.search(user_id, query).await {
                Ok(papers) => candidates.extend(papers),
                Err(e) => {
                    warn!(user = %user_id, error = %e, "Profile search failed");
                    last_error = Some(e);
                }
            }
        }

        let related: Vec<Vec<Paper>> = stream::iter(recent_likes)
            .map(|paper_id| {
                let openalex = self.openalex.clone();
                async move {
                    match openalex.related_works(&paper_id, RELATED_PER_LIKE).await {
                        Ok(papers) => papers,
                        Err(e) => {
                            warn!(paper = %paper_id, error = %e, "Related works fetch failed");
                            Vec::new()
                        }
                    }
                }
            })
            .buffer_unordered(4)
            .collect()
            .await;
        candidates.extend(related.into_iter().flatten());

        if candidates.is_empty() {
            if let Some(e) = last_error {
                return Err(e);
            }
            return Ok(Vec::new());
        }

        let mut feed: Vec<Paper> = dedupe_papers(candidates)
            .into_iter()
            .filter(|p| !seen.contains(&p.paper_id))
            .collect();
        rank(&mut feed, &profile);
        feed.truncate(limit);

        self.papers.put_many(feed.clone()).await?;
        info!(user = %user_id, count = feed.len(), "Recommendations ready");
        Ok(feed)
    }
}

/// Sort candidates by the ranking score, citation count, then id.
fn rank(papers: &mut [Paper], profile: &Profile) {
    let current_year = Utc::now().year();
    papers.sort_by(|a, b| {
        let score_a = score(a, profile, current_year);
        let score_b = score(b, profile, current_year);
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.citation_count
                    .unwrap_or(0)
                    .cmp(&a.citation_count.unwrap_or(0))
            })
            .then_with(|| a.paper_id.cmp(&b.paper_id))
    });
}

/// Ranking score for one candidate.
fn score(paper: &Paper, profile: &Profile, current_year: i32) -> f64 {
    let haystack = format!(
        "{} {}",
        paper.title,
        paper.abstract_text.as_deref().unwrap_or("")
    )
    .to_lowercase();
    let topic_match = profile
        .topics
        .iter()
        .any(|t| haystack.contains(&t.to_lowercase()));

    let author_match = profile.authors.iter().any(|name| {
        let name = name.to_lowercase();
        paper
            .authors
            .iter()
            .any(|a| a.display_name.to_lowercase() == name)
    });

    let recency = paper
        .year
        .map(|y| {
            let age = (current_year - y).max(0) as f64;
            (1.0 - age / 10.0).max(0.0)
        })
        .unwrap_or(0.0);

    W_TOPIC * f64::from(topic_match as u8)
        + W_AUTHOR * f64::from(author_match as u8)
        + W_YEAR * recency
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PaperAuthor;
    use crate::query_parser::QueryParser;

    fn paper(id: &str, title: &str, year: i32) -> Paper {
        Paper {
            title: title.to_string(),
            year: Some(year),
            ..Paper::stub(id)
        }
    }

    fn profile() -> Profile {
        Profile {
            topics: vec!["graph learning".to_string()],
            authors: vec!["Ada Lovelace".to_string()],
        }
    }

    #[test]
    fn test_score_prefers_topic_and_author_matches() {
        let current_year = Utc::now().year();
        let plain = paper("W1", "Unrelated work", current_year);
        let topical = paper("W2", "Advances in graph learning", current_year);
        let mut authored = paper("W3", "Another unrelated work", current_year);
        authored.authors = vec![PaperAuthor {
            display_name: "Ada Lovelace".to_string(),
            author_id: None,
        }];

        let p = profile();
        assert!(score(&topical, &p, current_year) > score(&plain, &p, current_year));
        assert!(score(&authored, &p, current_year) > score(&plain, &p, current_year));
        assert!(score(&topical, &p, current_year) > score(&authored, &p, current_year));
    }

    #[test]
    fn test_score_recency_decays_over_a_decade() {
        let current_year = 2026;
        let p = Profile::default();
        let new = paper("W1", "x", 2026);
        let mid = paper("W2", "x", 2021);
        let old = paper("W3", "x", 2010);
        assert!((score(&new, &p, current_year) - 1.0).abs() < 1e-9);
        assert!((score(&mid, &p, current_year) - 0.5).abs() < 1e-9);
        assert!((score(&old, &p, current_year) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_rank_ties_break_on_citations_then_id() {
        let current_year = Utc::now().year();
        let mut a = paper("Wb", "same", current_year);
        a.citation_count = Some(5);
        let mut b = paper("Wa", "same", current_year);
        b.citation_count = Some(5);
        let mut c = paper("Wc", "same", current_year);
        c.citation_count = Some(50);

        let mut feed = vec![a, b, c];
        rank(&mut feed, &Profile::default());
        let ids: Vec<&str> = feed.iter().map(|p| p.paper_id.as_str()).collect();
        assert_eq!(ids, vec!["Wc", "Wa", "Wb"]);
    }

    /// Fixture serving a profile search that includes already-seen papers.
    async fn spawn_fixture() -> String {
        use axum::routing::get;

        let app = axum::Router::new()
            .route(
                "/works",
                get(|| async {
                    axum::Json(serde_json::json!({
                        "meta": {"count": 3},
                        "results": [
                            {"id": "https://openalex.org/W10", "display_name": "Seen liked",
                             "publication_year": 2024},
                            {"id": "https://openalex.org/W11", "display_name": "Seen disliked",
                             "publication_year": 2024},
                            {"id": "https://openalex.org/W12", "display_name": "Fresh candidate",
                             "publication_year": 2024}
                        ]
                    }))
                }),
            )
            .route(
                "/works/{id}",
                get(|| async {
                    axum::Json(serde_json::json!({
                        "id": "https://openalex.org/W10",
                        "related_works": []
                    }))
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_recommendations_filter_seen_papers() {
        let base_url = spawn_fixture().await;
        let openalex = Arc::new(OpenAlexClient::with_base_url(&base_url, None).unwrap());
        let papers = Arc::new(PaperStore::in_memory());
        let users = Arc::new(UserStore::in_memory());
        let search = Arc::new(SearchEngine::new(
            openalex.clone(),
            papers.clone(),
            Arc::new(QueryParser::new(None)),
        ));
        let engine = RecommendEngine::new(openalex, papers, users.clone(), search);

        users
            .put_profile("u1", vec!["ml".to_string()], Vec::new())
            .await
            .unwrap();
        users.like("u1", "W10").await.unwrap();
        users.dislike("u1", "W11").await.unwrap();

        let feed = engine.recommend("u1", 20).await.unwrap();
        let ids: Vec<&str> = feed.iter().map(|p| p.paper_id.as_str()).collect();
        assert!(ids.contains(&"W12"));
        assert!(!ids.contains(&"W10"));
        assert!(!ids.contains(&"W11"));
    }

    #[tokio::test]
    async fn test_empty_profile_and_no_likes_is_empty_feed() {
        let engine = RecommendEngine::new(
            Arc::new(OpenAlexClient::with_base_url("http://127.0.0.1:9", None).unwrap()),
            Arc::new(PaperStore::in_memory()),
            Arc::new(UserStore::in_memory()),
            Arc::new(SearchEngine::new(
                Arc::new(OpenAlexClient::with_base_url("http://127.0.0.1:9", None).unwrap()),
                Arc::new(PaperStore::in_memory()),
                Arc::new(QueryParser::new(None)),
            )),
        );
        let feed = engine.recommend("u1", 20).await.unwrap();
        assert!(feed.is_empty());
    }
}
