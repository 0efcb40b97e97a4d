//! Durable per-user state: profile, feedback, folders, and follows.
//!
//! The store is partitioned by user id; every mutation runs through
//! [`UserStore::transact`], which applies the closure to a draft copy of the
//! user aggregate and swaps it in only on success, so a failed mutation never
//! leaks partial writes. The critical section does no I/O; snapshots to
//! persist are prepared first.
//!
//! The likes folder is a real folder kept bidirectionally consistent with the
//! liked feedback set:
//! - liking inserts the paper at the head of the likes folder;
//! - disliking a liked paper removes it from the folder;
//! - adding to / removing from the likes folder implies like / unlike;
//! - the folder itself can never be deleted or renamed.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, ScholarError};
use crate::models::{
    EntityType, FeedbackAction, FeedbackRecord, Folder, Follow, Profile, User,
    LIKES_FOLDER_ID, MAX_FOLDER_NAME_LEN, MAX_PROFILE_ENTRIES,
};

/// Which feedback lists a clear operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearFeedback {
    Liked,
    Disliked,
    All,
}

/// Liked/disliked paper id lists, as served by the feedback endpoints.
///
/// `liked` follows the likes-folder order (most recent first); `disliked` is
/// ordered by most recent action.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedbackSummary {
    pub liked: Vec<String>,
    pub disliked: Vec<String>,
}

/// Everything the service knows about one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub user: User,
    #[serde(default)]
    pub profile: Profile,
    #[serde(default)]
    pub feedback: HashMap<String, FeedbackRecord>,
    #[serde(default)]
    pub folders: Vec<Folder>,
    #[serde(default)]
    pub follows: Vec<Follow>,
    #[serde(default)]
    pub version: u64,
}

impl UserAccount {
    fn new(user: User) -> Self {
        Self {
            user,
            profile: Profile::default(),
            feedback: HashMap::new(),
            folders: vec![Folder::new(
                LIKES_FOLDER_ID.to_string(),
                "Likes".to_string(),
                None,
            )],
            follows: Vec::new(),
            version: 0,
        }
    }

    fn folder_mut(&mut self, folder_id: &str) -> Option<&mut Folder> {
        self.folders.iter_mut().find(|f| f.folder_id == folder_id)
    }

    fn likes_folder_mut(&mut self) -> &mut Folder {
        // The likes folder is created with the account; recreate it if a bad
        // snapshot lost it.
        if !self.folders.iter().any(|f| f.is_likes()) {
            self.folders.insert(
                0,
                Folder::new(LIKES_FOLDER_ID.to_string(), "Likes".to_string(), None),
            );
        }
        #[allow(clippy::unwrap_used)]
        self.folders
            .iter_mut()
            .find(|f| f.is_likes())
            .unwrap()
    }

    /// Record a like and sync the likes folder. Idempotent.
    fn apply_like(&mut self, paper_id: &str) {
        let now = Utc::now();
        match self.feedback.get_mut(paper_id) {
            Some(record) if record.action == FeedbackAction::Liked => {}
            Some(record) => {
                record.action = FeedbackAction::Liked;
                record.updated_at = now;
            }
            None => {
                self.feedback.insert(
                    paper_id.to_string(),
                    FeedbackRecord {
                        action: FeedbackAction::Liked,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        let likes = self.likes_folder_mut();
        if !likes.paper_ids.iter().any(|id| id == paper_id) {
            likes.paper_ids.insert(0, paper_id.to_string());
            likes.updated_at = now;
        }
    }

    /// Remove a like (if any) and sync the likes folder. Idempotent.
    fn apply_unlike(&mut self, paper_id: &str) {
        if let Some(record) = self.feedback.get(paper_id) {
            if record.action == FeedbackAction::Liked {
                self.feedback.remove(paper_id);
            }
        }
        let now = Utc::now();
        let likes = self.likes_folder_mut();
        if let Some(pos) = likes.paper_ids.iter().position(|id| id == paper_id) {
            likes.paper_ids.remove(pos);
            likes.updated_at = now;
        }
    }
}

/// In-process user store with optional snapshot persistence.
pub struct UserStore {
    accounts: RwLock<HashMap<String, UserAccount>>,
    path: Option<PathBuf>,
}

impl UserStore {
    pub fn in_memory() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    pub fn with_path(path: PathBuf) -> Self {
        let accounts = load_snapshot(&path);
        info!(count = accounts.len(), path = ?path, "Loaded user store");
        Self {
            accounts: RwLock::new(accounts),
            path: Some(path),
        }
    }

    /// Run one atomic mutation against a user aggregate.
    ///
    /// The closure sees a draft copy; only a successful return commits it
    /// (with a version bump). The account is created on first touch so a
    /// valid session always has somewhere to write.
    pub async fn transact<T>(
        &self,
        user_id: &str,
        f: impl FnOnce(&mut UserAccount) -> Result<T>,
    ) -> Result<T> {
        let out = {
            let mut accounts = self.accounts.write().await;
            let account = accounts
                .entry(user_id.to_string())
                .or_insert_with(|| UserAccount::new(skeleton_user(user_id)));
            let mut draft = account.clone();
            let out = f(&mut draft)?;
            draft.version = account.version + 1;
            *account = draft;
            out
        };
        self.persist().await;
        Ok(out)
    }

    /// Read-only view of a user aggregate.
    pub async fn account(&self, user_id: &str) -> Option<UserAccount> {
        self.accounts.read().await.get(user_id).cloned()
    }

    // === Users ===

    /// Create or refresh a user record at login time.
    pub async fn upsert_user(&self, user: User) -> Result<User> {
        let user_id = user.user_id.clone();
        self.transact(&user_id, move |account| {
            if account.user.email.is_empty() {
                let created_at = account.user.created_at.min(user.created_at);
                account.user = user.clone();
                account.user.created_at = created_at;
            } else {
                account.user.email = user.email.clone();
                account.user.display_name = user.display_name.clone();
                account.user.picture_url = user.picture_url.clone();
                account.user.last_login_at = user.last_login_at;
            }
            Ok(account.user.clone())
        })
        .await
    }

    pub async fn get_user(&self, user_id: &str) -> Option<User> {
        self.account(user_id).await.map(|a| a.user)
    }

    // === Profile ===

    pub async fn get_profile(&self, user_id: &str) -> Profile {
        self.account(user_id)
            .await
            .map(|a| a.profile)
            .unwrap_or_default()
    }

    /// Replace the profile. Entries are trimmed, deduplicated
    /// case-insensitively with order preserved, and capped.
    pub async fn put_profile(
        &self,
        user_id: &str,
        topics: Vec<String>,
        authors: Vec<String>,
    ) -> Result<Profile> {
        let topics = normalize_list(topics, "topics")?;
        let authors = normalize_list(authors, "authors")?;
        self.transact(user_id, move |account| {
            account.profile = Profile { topics, authors };
            Ok(account.profile.clone())
        })
        .await
    }

    pub async fn clear_profile(&self, user_id: &str) -> Result<()> {
        self.transact(user_id, |account| {
            account.profile = Profile::default();
            Ok(())
        })
        .await
    }

    // === Feedback ===

    pub async fn get_feedback(&self, user_id: &str) -> FeedbackSummary {
        let Some(account) = self.account(user_id).await else {
            return FeedbackSummary::default();
        };
        summarize_feedback(&account)
    }

    /// Most recently acted-on liked paper ids, newest first.
    pub async fn recent_likes(&self, user_id: &str, limit: usize) -> Vec<String> {
        let Some(account) = self.account(user_id).await else {
            return Vec::new();
        };
        let mut liked: Vec<(&String, &FeedbackRecord)> = account
            .feedback
            .iter()
            .filter(|(_, r)| r.action == FeedbackAction::Liked)
            .collect();
        liked.sort_by(|a, b| b.1.updated_at.cmp(&a.1.updated_at).then(a.0.cmp(b.0)));
        liked.into_iter().take(limit).map(|(id, _)| id.clone()).collect()
    }

    pub async fn like(&self, user_id: &str, paper_id: &str) -> Result<()> {
        let paper_id = paper_id.to_string();
        self.transact(user_id, move |account| {
            account.apply_like(&paper_id);
            Ok(())
        })
        .await
    }

    pub async fn dislike(&self, user_id: &str, paper_id: &str) -> Result<()> {
        let paper_id = paper_id.to_string();
        self.transact(user_id, move |account| {
            // A dislike on a liked paper first withdraws the like, which also
            // drops it from the likes folder.
            account.apply_unlike(&paper_id);
            let now = Utc::now();
            match account.feedback.get_mut(&paper_id) {
                Some(record) => {
                    record.action = FeedbackAction::Disliked;
                    record.updated_at = now;
                }
                None => {
                    account.feedback.insert(
                        paper_id.clone(),
                        FeedbackRecord {
                            action: FeedbackAction::Disliked,
                            created_at: now,
                            updated_at: now,
                        },
                    );
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn unlike(&self, user_id: &str, paper_id: &str) -> Result<()> {
        let paper_id = paper_id.to_string();
        self.transact(user_id, move |account| {
            account.apply_unlike(&paper_id);
            Ok(())
        })
        .await
    }

    pub async fn undislike(&self, user_id: &str, paper_id: &str) -> Result<()> {
        let paper_id = paper_id.to_string();
        self.transact(user_id, move |account| {
            if let Some(record) = account.feedback.get(&paper_id) {
                if record.action == FeedbackAction::Disliked {
                    account.feedback.remove(&paper_id);
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn clear_feedback(&self, user_id: &str, which: ClearFeedback) -> Result<()> {
        self.transact(user_id, move |account| {
            let drop_liked = matches!(which, ClearFeedback::Liked | ClearFeedback::All);
            let drop_disliked = matches!(which, ClearFeedback::Disliked | ClearFeedback::All);
            account.feedback.retain(|_, r| match r.action {
                FeedbackAction::Liked => !drop_liked,
                FeedbackAction::Disliked => !drop_disliked,
            });
            if drop_liked {
                let likes = account.likes_folder_mut();
                likes.paper_ids.clear();
                likes.updated_at = Utc::now();
            }
            Ok(())
        })
        .await
    }

    // === Folders ===

    pub async fn list_folders(&self, user_id: &str) -> Vec<Folder> {
        self.account(user_id)
            .await
            .map(|a| a.folders)
            .unwrap_or_default()
    }

    pub async fn get_folder(&self, user_id: &str, folder_id: &str) -> Result<Folder> {
        self.account(user_id)
            .await
            .and_then(|a| a.folders.into_iter().find(|f| f.folder_id == folder_id))
            .ok_or_else(|| ScholarError::NotFound(format!("folder {}", folder_id)))
    }

    pub async fn create_folder(
        &self,
        user_id: &str,
        name: &str,
        description: Option<String>,
    ) -> Result<Folder> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ScholarError::Validation("folder name is empty".to_string()));
        }
        if name.len() > MAX_FOLDER_NAME_LEN {
            return Err(ScholarError::Validation(format!(
                "folder name exceeds {} characters",
                MAX_FOLDER_NAME_LEN
            )));
        }
        self.transact(user_id, move |account| {
            if account
                .folders
                .iter()
                .any(|f| f.name.eq_ignore_ascii_case(&name))
            {
                return Err(ScholarError::Conflict(format!(
                    "folder named {:?} already exists",
                    name
                )));
            }
            let folder = Folder::new(uuid::Uuid::new_v4().to_string(), name, description);
            account.folders.push(folder.clone());
            Ok(folder)
        })
        .await
    }

    pub async fn delete_folder(&self, user_id: &str, folder_id: &str) -> Result<()> {
        let folder_id = folder_id.to_string();
        self.transact(user_id, move |account| {
            if folder_id == LIKES_FOLDER_ID {
                return Err(ScholarError::Forbidden(
                    "the likes folder cannot be deleted".to_string(),
                ));
            }
            let before = account.folders.len();
            account.folders.retain(|f| f.folder_id != folder_id);
            if account.folders.len() == before {
                return Err(ScholarError::NotFound(format!("folder {}", folder_id)));
            }
            Ok(())
        })
        .await
    }

    /// Add a paper reference to a folder. Idempotent: re-adding keeps the
    /// original position. Adding to the likes folder implies a like.
    pub async fn add_paper(&self, user_id: &str, folder_id: &str, paper_id: &str) -> Result<()> {
        let folder_id = folder_id.to_string();
        let paper_id = paper_id.to_string();
        self.transact(user_id, move |account| {
            if folder_id == LIKES_FOLDER_ID {
                account.apply_like(&paper_id);
                return Ok(());
            }
            let folder = account
                .folder_mut(&folder_id)
                .ok_or_else(|| ScholarError::NotFound(format!("folder {}", folder_id)))?;
            if !folder.paper_ids.iter().any(|id| *id == paper_id) {
                folder.paper_ids.push(paper_id.clone());
                folder.updated_at = Utc::now();
            }
            Ok(())
        })
        .await
    }

    /// Remove a paper reference from a folder. Removing from the likes
    /// folder implies an unlike.
    pub async fn remove_paper(&self, user_id: &str, folder_id: &str, paper_id: &str) -> Result<()> {
        let folder_id = folder_id.to_string();
        let paper_id = paper_id.to_string();
        self.transact(user_id, move |account| {
            if folder_id == LIKES_FOLDER_ID {
                account.apply_unlike(&paper_id);
                return Ok(());
            }
            let folder = account
                .folder_mut(&folder_id)
                .ok_or_else(|| ScholarError::NotFound(format!("folder {}", folder_id)))?;
            let before = folder.paper_ids.len();
            folder.paper_ids.retain(|id| *id != paper_id);
            if folder.paper_ids.len() == before {
                return Err(ScholarError::NotFound(format!(
                    "paper {} in folder {}",
                    paper_id, folder_id
                )));
            }
            folder.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    // === Follows ===

    pub async fn list_follows(&self, user_id: &str) -> Vec<Follow> {
        self.account(user_id)
            .await
            .map(|a| a.follows)
            .unwrap_or_default()
    }

    /// Record a follow edge. A duplicate (type, entity id) pair is a no-op
    /// that returns the existing edge; `created` reports which happened.
    pub async fn follow(&self, user_id: &str, follow: Follow) -> Result<(Follow, bool)> {
        self.transact(user_id, move |account| {
            if let Some(existing) = account
                .follows
                .iter()
                .find(|f| f.entity_type == follow.entity_type && f.entity_id == follow.entity_id)
            {
                debug!(entity = %existing.entity_id, "Follow already exists");
                return Ok((existing.clone(), false));
            }
            account.follows.push(follow.clone());
            Ok((follow, true))
        })
        .await
    }

    pub async fn unfollow(
        &self,
        user_id: &str,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<()> {
        let entity_id = entity_id.to_string();
        self.transact(user_id, move |account| {
            let before = account.follows.len();
            account
                .follows
                .retain(|f| !(f.entity_type == entity_type && f.entity_id == entity_id));
            if account.follows.len() == before {
                return Err(ScholarError::NotFound(format!(
                    "follow {}/{}",
                    entity_type, entity_id
                )));
            }
            Ok(())
        })
        .await
    }

    async fn persist(&self) {
        let Some(ref path) = self.path else {
            return;
        };
        let accounts = self.accounts.read().await;
        match serde_json::to_string(&*accounts) {
            Ok(content) => {
                if let Err(e) = std::fs::write(path, content) {
                    warn!(path = ?path, error = %e, "Failed to write user store snapshot");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize user store"),
        }
    }
}

fn summarize_feedback(account: &UserAccount) -> FeedbackSummary {
    let liked: Vec<String> = account
        .folders
        .iter()
        .find(|f| f.is_likes())
        .map(|f| f.paper_ids.clone())
        .unwrap_or_default();

    let mut disliked: Vec<(&String, &FeedbackRecord)> = account
        .feedback
        .iter()
        .filter(|(_, r)| r.action == FeedbackAction::Disliked)
        .collect();
    disliked.sort_by(|a, b| b.1.updated_at.cmp(&a.1.updated_at).then(a.0.cmp(b.0)));

    FeedbackSummary {
        liked,
        disliked: disliked.into_iter().map(|(id, _)| id.clone()).collect(),
    }
}

fn normalize_list(entries: Vec<String>, what: &str) -> Result<Vec<String>> {
    let mut seen: Vec<String> = Vec::new();
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.trim().to_string();
        if entry.is_empty() {
            continue;
        }
        let key = entry.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        out.push(entry);
    }
    if out.len() > MAX_PROFILE_ENTRIES {
        return Err(ScholarError::Validation(format!(
            "too many {} (max {})",
            what, MAX_PROFILE_ENTRIES
        )));
    }
    Ok(out)
}

fn skeleton_user(user_id: &str) -> User {
    let now = Utc::now();
    User {
        user_id: user_id.to_string(),
        email: String::new(),
        display_name: None,
        picture_url: None,
        created_at: now,
        last_login_at: now,
    }
}

fn load_snapshot(path: &PathBuf) -> HashMap<String, UserAccount> {
    if !path.exists() {
        debug!(path = ?path, "User store snapshot not found, starting empty");
        return HashMap::new();
    }
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to parse user store snapshot");
                HashMap::new()
            }
        },
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to read user store snapshot");
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const U: &str = "u-test";

    #[tokio::test]
    async fn test_like_then_unlike_syncs_likes_folder() {
        let store = UserStore::in_memory();
        store.like(U, "W1").await.unwrap();

        let feedback = store.get_feedback(U).await;
        assert_eq!(feedback.liked, vec!["W1"]);
        assert!(feedback.disliked.is_empty());
        let likes = store.get_folder(U, LIKES_FOLDER_ID).await.unwrap();
        assert_eq!(likes.paper_ids, vec!["W1"]);

        store.unlike(U, "W1").await.unwrap();
        let feedback = store.get_feedback(U).await;
        assert!(feedback.liked.is_empty());
        let likes = store.get_folder(U, LIKES_FOLDER_ID).await.unwrap();
        assert!(likes.paper_ids.is_empty());
    }

    #[tokio::test]
    async fn test_like_flips_existing_dislike() {
        let store = UserStore::in_memory();
        store.dislike(U, "W2").await.unwrap();
        store.like(U, "W2").await.unwrap();

        let feedback = store.get_feedback(U).await;
        assert_eq!(feedback.liked, vec!["W2"]);
        assert!(feedback.disliked.is_empty());
        let likes = store.get_folder(U, LIKES_FOLDER_ID).await.unwrap();
        assert_eq!(likes.paper_ids, vec!["W2"]);
    }

    #[tokio::test]
    async fn test_dislike_removes_like_and_folder_entry() {
        let store = UserStore::in_memory();
        store.like(U, "W3").await.unwrap();
        store.dislike(U, "W3").await.unwrap();

        let feedback = store.get_feedback(U).await;
        assert!(feedback.liked.is_empty());
        assert_eq!(feedback.disliked, vec!["W3"]);
        let likes = store.get_folder(U, LIKES_FOLDER_ID).await.unwrap();
        assert!(likes.paper_ids.is_empty());
    }

    #[tokio::test]
    async fn test_unlike_does_not_touch_dislike() {
        let store = UserStore::in_memory();
        store.dislike(U, "W4").await.unwrap();
        store.unlike(U, "W4").await.unwrap();
        let feedback = store.get_feedback(U).await;
        assert_eq!(feedback.disliked, vec!["W4"]);
    }

    #[tokio::test]
    async fn test_likes_insert_at_head() {
        let store = UserStore::in_memory();
        store.like(U, "W1").await.unwrap();
        store.like(U, "W2").await.unwrap();
        let likes = store.get_folder(U, LIKES_FOLDER_ID).await.unwrap();
        assert_eq!(likes.paper_ids, vec!["W2", "W1"]);
    }

    #[tokio::test]
    async fn test_add_paper_is_idempotent_and_ordered() {
        let store = UserStore::in_memory();
        let folder = store.create_folder(U, "Reading list", None).await.unwrap();
        store.add_paper(U, &folder.folder_id, "W1").await.unwrap();
        store.add_paper(U, &folder.folder_id, "W2").await.unwrap();
        store.add_paper(U, &folder.folder_id, "W1").await.unwrap();

        let folder = store.get_folder(U, &folder.folder_id).await.unwrap();
        assert_eq!(folder.paper_ids, vec!["W1", "W2"]);
    }

    #[tokio::test]
    async fn test_add_to_likes_folder_implies_like() {
        let store = UserStore::in_memory();
        store.add_paper(U, LIKES_FOLDER_ID, "W9").await.unwrap();
        let feedback = store.get_feedback(U).await;
        assert_eq!(feedback.liked, vec!["W9"]);

        store.remove_paper(U, LIKES_FOLDER_ID, "W9").await.unwrap();
        let feedback = store.get_feedback(U).await;
        assert!(feedback.liked.is_empty());
    }

    #[tokio::test]
    async fn test_likes_folder_is_protected() {
        let store = UserStore::in_memory();
        store.like(U, "W1").await.unwrap();
        let err = store.delete_folder(U, LIKES_FOLDER_ID).await.unwrap_err();
        assert!(matches!(err, ScholarError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_delete_unknown_folder_is_not_found() {
        let store = UserStore::in_memory();
        store.like(U, "W1").await.unwrap();
        let err = store.delete_folder(U, "nope").await.unwrap_err();
        assert!(matches!(err, ScholarError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_folder_name_conflicts() {
        let store = UserStore::in_memory();
        store.create_folder(U, "ML", None).await.unwrap();
        let err = store.create_folder(U, "ml", None).await.unwrap_err();
        assert!(matches!(err, ScholarError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_failed_mutation_commits_nothing() {
        let store = UserStore::in_memory();
        let folder = store.create_folder(U, "A", None).await.unwrap();
        // remove_paper fails (paper absent) after a hypothetical partial edit;
        // the aggregate must be unchanged.
        let err = store
            .remove_paper(U, &folder.folder_id, "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, ScholarError::NotFound(_)));
        let reloaded = store.get_folder(U, &folder.folder_id).await.unwrap();
        assert!(reloaded.paper_ids.is_empty());
    }

    #[tokio::test]
    async fn test_clear_feedback_liked_only() {
        let store = UserStore::in_memory();
        store.like(U, "W1").await.unwrap();
        store.dislike(U, "W2").await.unwrap();
        store.clear_feedback(U, ClearFeedback::Liked).await.unwrap();

        let feedback = store.get_feedback(U).await;
        assert!(feedback.liked.is_empty());
        assert_eq!(feedback.disliked, vec!["W2"]);
        let likes = store.get_folder(U, LIKES_FOLDER_ID).await.unwrap();
        assert!(likes.paper_ids.is_empty());
    }

    #[tokio::test]
    async fn test_follow_is_unique_per_entity() {
        let store = UserStore::in_memory();
        let edge = Follow {
            entity_type: EntityType::Author,
            entity_id: "A1".to_string(),
            entity_name: "Ada".to_string(),
            upstream_id: "A1".to_string(),
            followed_at: Utc::now(),
        };
        let (_, created) = store.follow(U, edge.clone()).await.unwrap();
        assert!(created);
        let (existing, created) = store.follow(U, edge).await.unwrap();
        assert!(!created);
        assert_eq!(existing.entity_id, "A1");
        assert_eq!(store.list_follows(U).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unfollow_unknown_is_not_found() {
        let store = UserStore::in_memory();
        store.like(U, "W1").await.unwrap();
        let err = store
            .unfollow(U, EntityType::Topic, "T1")
            .await
            .unwrap_err();
        assert!(matches!(err, ScholarError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_profile_normalization() {
        let store = UserStore::in_memory();
        let profile = store
            .put_profile(
                U,
                vec![
                    " Machine Learning ".to_string(),
                    "machine learning".to_string(),
                    "".to_string(),
                    "Graphs".to_string(),
                ],
                vec!["Ada Lovelace".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(profile.topics, vec!["Machine Learning", "Graphs"]);
        assert_eq!(profile.authors, vec!["Ada Lovelace"]);

        store.clear_profile(U).await.unwrap();
        assert!(store.get_profile(U).await.is_empty());
    }

    #[tokio::test]
    async fn test_profile_caps_at_max_entries() {
        let store = UserStore::in_memory();
        let topics: Vec<String> = (0..65).map(|i| format!("topic-{}", i)).collect();
        let err = store.put_profile(U, topics, Vec::new()).await.unwrap_err();
        assert!(matches!(err, ScholarError::Validation(_)));
    }

    #[tokio::test]
    async fn test_concurrent_likes_are_idempotent() {
        let store = Arc::new(UserStore::in_memory());
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.like(U, "W7").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let account = store.account(U).await.unwrap();
        assert_eq!(account.feedback.len(), 1);
        let likes = store.get_folder(U, LIKES_FOLDER_ID).await.unwrap();
        assert_eq!(likes.paper_ids, vec!["W7"]);
    }

    #[tokio::test]
    async fn test_recent_likes_ordering() {
        let store = UserStore::in_memory();
        store.like(U, "W1").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.like(U, "W2").await.unwrap();
        let recent = store.recent_likes(U, 10).await;
        assert_eq!(recent, vec!["W2", "W1"]);
    }

    #[tokio::test]
    async fn test_snapshot_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");

        let store = UserStore::with_path(path.clone());
        store.like(U, "W1").await.unwrap();
        drop(store);

        let reloaded = UserStore::with_path(path);
        let feedback = reloaded.get_feedback(U).await;
        assert_eq!(feedback.liked, vec!["W1"]);
    }
}
