//! Durable cache of paper metadata, keyed by paper id.
//!
//! Shared across users; the feed engines write through it so every paper id
//! referenced from user-side state resolves here. Writes are last-writer-wins
//! per paper id and upserts merge fields rather than deleting them.
//!
//! Backed by an in-memory map with an optional JSON snapshot file. Eviction
//! is left to an external sweeper; the store is append-heavy.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::Paper;

/// How long a cached paper counts as fresh. Stale entries are still served.
pub const TTL_FRESH_HOURS: i64 = 24;

/// Store envelope around a paper snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPaper {
    pub paper: Paper,
    pub cached_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u64,
}

impl CachedPaper {
    pub fn is_fresh(&self) -> bool {
        Utc::now() - self.updated_at < Duration::hours(TTL_FRESH_HOURS)
    }
}

/// In-process paper cache with optional snapshot persistence.
pub struct PaperStore {
    papers: RwLock<HashMap<String, CachedPaper>>,
    path: Option<PathBuf>,
}

impl PaperStore {
    /// Purely in-memory store (tests, dev).
    pub fn in_memory() -> Self {
        Self {
            papers: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Store backed by a JSON snapshot file, loaded eagerly.
    pub fn with_path(path: PathBuf) -> Self {
        let papers = load_snapshot(&path);
        info!(count = papers.len(), path = ?path, "Loaded paper store");
        Self {
            papers: RwLock::new(papers),
            path: Some(path),
        }
    }

    /// Upsert one paper.
    pub async fn put(&self, paper: Paper) -> Result<()> {
        self.put_many(vec![paper]).await
    }

    /// Idempotent bulk upsert. Existing entries merge fields and bump
    /// `updated_at`; ids never disappear.
    pub async fn put_many(&self, papers: Vec<Paper>) -> Result<()> {
        if papers.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        {
            let mut map = self.papers.write().await;
            for paper in papers {
                if paper.paper_id.is_empty() {
                    continue;
                }
                match map.get_mut(&paper.paper_id) {
                    Some(existing) => {
                        existing.paper.merge_from(&paper);
                        existing.updated_at = now;
                    }
                    None => {
                        map.insert(
                            paper.paper_id.clone(),
                            CachedPaper {
                                paper,
                                cached_at: now,
                                updated_at: now,
                                access_count: 0,
                            },
                        );
                    }
                }
            }
        }
        self.persist().await;
        Ok(())
    }

    /// Fetch one paper if cached.
    pub async fn get(&self, paper_id: &str) -> Option<Paper> {
        self.papers
            .read()
            .await
            .get(paper_id)
            .map(|c| c.paper.clone())
    }

    /// Fetch the cache envelope, including freshness metadata.
    pub async fn get_cached(&self, paper_id: &str) -> Option<CachedPaper> {
        self.papers.read().await.get(paper_id).cloned()
    }

    /// Bulk fetch; missing ids are silently dropped. Output follows input
    /// order for the ids that resolve.
    pub async fn get_many(&self, ids: &[String]) -> Vec<Paper> {
        let map = self.papers.read().await;
        ids.iter()
            .filter_map(|id| map.get(id).map(|c| c.paper.clone()))
            .collect()
    }

    /// Bump `updated_at` and the access counter for a served paper.
    pub async fn touch(&self, paper_id: &str) {
        let mut map = self.papers.write().await;
        if let Some(cached) = map.get_mut(paper_id) {
            cached.access_count += 1;
            cached.updated_at = Utc::now();
        }
    }

    pub async fn len(&self) -> usize {
        self.papers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.papers.read().await.is_empty()
    }

    async fn persist(&self) {
        let Some(ref path) = self.path else {
            return;
        };
        let map = self.papers.read().await;
        match serde_json::to_string(&*map) {
            Ok(content) => {
                if let Err(e) = std::fs::write(path, content) {
                    warn!(path = ?path, error = %e, "Failed to write paper store snapshot");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize paper store"),
        }
    }
}

fn load_snapshot(path: &PathBuf) -> HashMap<String, CachedPaper> {
    if !path.exists() {
        debug!(path = ?path, "Paper store snapshot not found, starting empty");
        return HashMap::new();
    }
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to parse paper store snapshot");
                HashMap::new()
            }
        },
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to read paper store snapshot");
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PaperAuthor;

    fn paper(id: &str, title: &str) -> Paper {
        Paper {
            title: title.to_string(),
            ..Paper::stub(id)
        }
    }

    #[tokio::test]
    async fn test_put_many_then_get_many_roundtrip() {
        let store = PaperStore::in_memory();
        let papers = vec![paper("W1", "one"), paper("W2", "two"), paper("W3", "three")];
        store.put_many(papers.clone()).await.unwrap();

        // Input order of ids does not matter
        let fetched = store
            .get_many(&["W3".to_string(), "W1".to_string(), "W2".to_string()])
            .await;
        assert_eq!(fetched.len(), 3);
        assert_eq!(fetched[0].title, "three");
        assert_eq!(fetched[1].title, "one");
    }

    #[tokio::test]
    async fn test_get_many_drops_missing_ids() {
        let store = PaperStore::in_memory();
        store.put(paper("W1", "one")).await.unwrap();
        let fetched = store
            .get_many(&["W1".to_string(), "W404".to_string()])
            .await;
        assert_eq!(fetched.len(), 1);
    }

    #[tokio::test]
    async fn test_reingest_replaces_fields_but_never_deletes() {
        let store = PaperStore::in_memory();
        let mut first = paper("W1", "title");
        first.abstract_text = Some("an abstract".to_string());
        first.authors = vec![PaperAuthor {
            display_name: "Ada".to_string(),
            author_id: None,
        }];
        store.put(first).await.unwrap();

        // Second ingest has no abstract; the cached one must survive
        let mut second = paper("W1", "newer title");
        second.year = Some(2024);
        store.put(second).await.unwrap();

        let merged = store.get("W1").await.unwrap();
        assert_eq!(merged.title, "newer title");
        assert_eq!(merged.year, Some(2024));
        assert_eq!(merged.abstract_text.as_deref(), Some("an abstract"));
        assert_eq!(merged.authors.len(), 1);
    }

    #[tokio::test]
    async fn test_touch_bumps_access_count() {
        let store = PaperStore::in_memory();
        store.put(paper("W1", "one")).await.unwrap();
        store.touch("W1").await;
        store.touch("W1").await;
        let cached = store.get_cached("W1").await.unwrap();
        assert_eq!(cached.access_count, 2);
        assert!(cached.is_fresh());
    }

    #[tokio::test]
    async fn test_snapshot_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("papers.json");

        let store = PaperStore::with_path(path.clone());
        store.put(paper("W1", "persisted")).await.unwrap();
        drop(store);

        let reloaded = PaperStore::with_path(path);
        assert_eq!(reloaded.get("W1").await.unwrap().title, "persisted");
    }
}
