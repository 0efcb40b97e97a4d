//! Core data model: papers, users, profiles, feedback, folders, and follows.
//!
//! All timestamps are UTC (`chrono::DateTime<Utc>`) and serialize as ISO-8601.
//! A `Paper` is an immutable snapshot of a bibliographic record; the user-side
//! documents are owned exclusively by one user and mutated through the user
//! store only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Maximum entries in each profile list (topics, authors)
pub const MAX_PROFILE_ENTRIES: usize = 64;

/// Maximum folder name length
pub const MAX_FOLDER_NAME_LEN: usize = 120;

/// Identifier of the protected likes folder
pub const LIKES_FOLDER_ID: &str = "likes";

/// One author of a paper, in the order received from upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperAuthor {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
}

/// Snapshot of a bibliographic record, keyed by the upstream work id.
///
/// Any field that may be absent upstream is an explicit `Option`; `authors`
/// defaults to the empty list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    pub paper_id: String,
    pub title: String,
    #[serde(default, rename = "abstract", skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tldr: Option<String>,
    #[serde(default)]
    pub authors: Vec<PaperAuthor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_count: Option<u64>,
    /// Upstream relevance score, present only on relevance-sorted responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<f64>,
}

impl Paper {
    /// Minimal paper carrying only an id; used when a mutation references a
    /// paper without a snapshot.
    pub fn stub(paper_id: &str) -> Self {
        Self {
            paper_id: paper_id.to_string(),
            title: String::new(),
            abstract_text: None,
            tldr: None,
            authors: Vec::new(),
            year: None,
            venue: None,
            doi: None,
            url: None,
            citation_count: None,
            relevance_score: None,
        }
    }

    /// Fold a newer copy of the same record into this one.
    ///
    /// Present fields replace, absent fields never delete what is already
    /// cached. Author order follows the newer copy when it carries any.
    pub fn merge_from(&mut self, newer: &Paper) {
        if !newer.title.is_empty() {
            self.title = newer.title.clone();
        }
        if newer.abstract_text.is_some() {
            self.abstract_text = newer.abstract_text.clone();
        }
        if newer.tldr.is_some() {
            self.tldr = newer.tldr.clone();
        }
        if !newer.authors.is_empty() {
            self.authors = newer.authors.clone();
        }
        if newer.year.is_some() {
            self.year = newer.year;
        }
        if newer.venue.is_some() {
            self.venue = newer.venue.clone();
        }
        if newer.doi.is_some() {
            self.doi = newer.doi.clone();
        }
        if newer.url.is_some() {
            self.url = newer.url.clone();
        }
        if newer.citation_count.is_some() {
            self.citation_count = newer.citation_count;
        }
        if newer.relevance_score.is_some() {
            self.relevance_score = newer.relevance_score;
        }
    }
}

/// Authenticated user identity plus login bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_login_at: DateTime<Utc>,
}

/// Declared interests: ordered topic and author lists, unique
/// case-insensitively, capped at [`MAX_PROFILE_ENTRIES`] each.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub authors: Vec<String>,
}

impl Profile {
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty() && self.authors.is_empty()
    }
}

/// Feedback action on a paper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackAction {
    Liked,
    Disliked,
}

/// One feedback record per (user, paper) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub action: FeedbackAction,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// User-owned ordered collection of paper references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub folder_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub paper_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Folder {
    pub fn new(folder_id: String, name: String, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            folder_id,
            name,
            description,
            paper_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_likes(&self) -> bool {
        self.folder_id == LIKES_FOLDER_ID
    }

    pub fn paper_count(&self) -> usize {
        self.paper_ids.len()
    }
}

/// Kind of entity a user can follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Author,
    Institution,
    Topic,
    Source,
    Custom,
}

impl EntityType {
    /// Path segment used by the upstream entity-search endpoints.
    pub fn upstream_path(&self) -> Option<&'static str> {
        match self {
            EntityType::Author => Some("authors"),
            EntityType::Institution => Some("institutions"),
            EntityType::Topic => Some("topics"),
            EntityType::Source => Some("sources"),
            EntityType::Custom => None,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "author" | "authors" => Some(EntityType::Author),
            "institution" | "institutions" => Some(EntityType::Institution),
            "topic" | "topics" => Some(EntityType::Topic),
            "source" | "sources" => Some(EntityType::Source),
            "custom" => Some(EntityType::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityType::Author => "author",
            EntityType::Institution => "institution",
            EntityType::Topic => "topic",
            EntityType::Source => "source",
            EntityType::Custom => "custom",
        };
        write!(f, "{}", s)
    }
}

/// Durable subscription from a user to an upstream entity.
///
/// For a `custom` follow the entity is a free-text query: `entity_id` is a
/// stable hash of the query and `upstream_id` carries the query text itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Follow {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub entity_name: String,
    pub upstream_id: String,
    pub followed_at: DateTime<Utc>,
}

/// Stable id for a custom (free-text) follow.
pub fn custom_follow_id(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.trim().to_lowercase().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("custom:{}", hex)
}

/// Entity-search result row for the follow UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub upstream_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub works_count: Option<u64>,
    /// Type-specific detail: affiliation, country, publisher, or field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paper(id: &str) -> Paper {
        Paper {
            paper_id: id.to_string(),
            title: "Old title".to_string(),
            abstract_text: Some("old abstract".to_string()),
            tldr: None,
            authors: vec![PaperAuthor {
                display_name: "A. Author".to_string(),
                author_id: Some("A1".to_string()),
            }],
            year: Some(2020),
            venue: Some("Old venue".to_string()),
            doi: None,
            url: None,
            citation_count: Some(3),
            relevance_score: None,
        }
    }

    #[test]
    fn test_merge_replaces_but_never_deletes() {
        let mut base = paper("W1");
        let newer = Paper {
            title: "New title".to_string(),
            year: Some(2021),
            ..Paper::stub("W1")
        };
        base.merge_from(&newer);
        assert_eq!(base.title, "New title");
        assert_eq!(base.year, Some(2021));
        // Absent fields in the newer copy keep the cached values
        assert_eq!(base.abstract_text.as_deref(), Some("old abstract"));
        assert_eq!(base.authors.len(), 1);
        assert_eq!(base.citation_count, Some(3));
    }

    #[test]
    fn test_merge_preserves_author_order_from_newer() {
        let mut base = paper("W1");
        let newer = Paper {
            authors: vec![
                PaperAuthor {
                    display_name: "B. Second".to_string(),
                    author_id: None,
                },
                PaperAuthor {
                    display_name: "A. Author".to_string(),
                    author_id: Some("A1".to_string()),
                },
            ],
            ..Paper::stub("W1")
        };
        base.merge_from(&newer);
        assert_eq!(base.authors[0].display_name, "B. Second");
        assert_eq!(base.authors[1].display_name, "A. Author");
    }

    #[test]
    fn test_custom_follow_id_is_stable_and_case_insensitive() {
        let a = custom_follow_id("graph neural networks");
        let b = custom_follow_id("  Graph Neural Networks ");
        assert_eq!(a, b);
        assert!(a.starts_with("custom:"));
        assert_ne!(a, custom_follow_id("something else"));
    }

    #[test]
    fn test_entity_type_parse_roundtrip() {
        for t in [
            EntityType::Author,
            EntityType::Institution,
            EntityType::Topic,
            EntityType::Source,
            EntityType::Custom,
        ] {
            assert_eq!(EntityType::parse(&t.to_string()), Some(t));
        }
        assert_eq!(EntityType::parse("journal"), None);
    }
}
