//! HTTP surface: axum router, handlers, and input validation.
//!
//! Thin layer binding the API contract to the engines. Responsibilities end
//! at input validation, pagination clamping, session extraction, and JSON
//! shaping; every feed and mutation lives in the engines and stores.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::{header, request::Parts, HeaderMap, StatusCode};
use axum::response::{AppendHeaders, IntoResponse, Redirect, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{session_from_cookie_header, AuthGateway, SessionClaims};
use crate::config::AppConfig;
use crate::error::{Result, ScholarError};
use crate::follows::{FollowEngine, DEFAULT_PER_ENTITY, DEFAULT_TOTAL_LIMIT};
use crate::models::{custom_follow_id, Entity, EntityType, Follow, Paper};
use crate::openalex::{OpenAlexClient, SortBy, OPENALEX_API_BASE};
use crate::paper_store::PaperStore;
use crate::query_parser::QueryParser;
use crate::recommend::{RecommendEngine, DEFAULT_LIMIT, MAX_LIMIT};
use crate::search::{SearchEngine, StructuredQuery, DEFAULT_PER_PAGE};
use crate::user_store::{ClearFeedback, UserStore};

/// Whole-request deadline; in-flight upstream work is dropped when it passes.
const REQUEST_DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);

/// Shared application state, wired once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub openalex: Arc<OpenAlexClient>,
    pub papers: Arc<PaperStore>,
    pub users: Arc<UserStore>,
    pub parser: Arc<QueryParser>,
    pub search: Arc<SearchEngine>,
    pub follows: Arc<FollowEngine>,
    pub recommend: Arc<RecommendEngine>,
    pub auth: Arc<AuthGateway>,
}

impl AppState {
    /// Wire the full dependency graph against the real upstream index.
    pub fn new(config: AppConfig) -> Result<Self> {
        Self::with_upstream(config, OPENALEX_API_BASE)
    }

    /// Wire against an explicit upstream base URL (fixture servers in tests).
    pub fn with_upstream(config: AppConfig, upstream_base: &str) -> Result<Self> {
        let openalex = Arc::new(OpenAlexClient::with_base_url(
            upstream_base,
            config.mailto.clone(),
        )?);

        let (papers, users) = match config.data_dir {
            Some(ref dir) => {
                std::fs::create_dir_all(dir)?;
                (
                    Arc::new(PaperStore::with_path(dir.join("papers.json"))),
                    Arc::new(UserStore::with_path(dir.join("users.json"))),
                )
            }
            None => (
                Arc::new(PaperStore::in_memory()),
                Arc::new(UserStore::in_memory()),
            ),
        };

        let parser = Arc::new(QueryParser::new(config.llm.clone()));
        let search = Arc::new(SearchEngine::new(
            openalex.clone(),
            papers.clone(),
            parser.clone(),
        ));
        let follows = Arc::new(FollowEngine::new(
            openalex.clone(),
            papers.clone(),
            users.clone(),
            search.clone(),
            parser.clone(),
        ));
        let recommend = Arc::new(RecommendEngine::new(
            openalex.clone(),
            papers.clone(),
            users.clone(),
            search.clone(),
        ));
        let auth = Arc::new(AuthGateway::new(&config, users.clone())?);

        Ok(Self {
            config: Arc::new(config),
            openalex,
            papers,
            users,
            parser,
            search,
            follows,
            recommend,
            auth,
        })
    }
}

/// Authenticated principal, extracted from the session cookie.
///
/// Absence or an invalid signature rejects with 401 before the handler runs.
pub struct Principal(pub SessionClaims);

impl FromRequestParts<AppState> for Principal {
    type Rejection = ScholarError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let claims =
            claims_from_headers(&parts.headers, state).ok_or(ScholarError::Unauthenticated)?;
        Ok(Principal(claims))
    }
}

fn claims_from_headers(headers: &HeaderMap, state: &AppState) -> Option<SessionClaims> {
    let header = headers.get(header::COOKIE)?.to_str().ok()?;
    let token = session_from_cookie_header(header)?;
    state.auth.verify_session(&token).ok()
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/api/auth/login", get(auth_login))
        .route("/api/auth/callback", get(auth_callback))
        .route("/api/auth/logout", get(auth_logout))
        .route("/api/auth/status", get(auth_status))
        .route("/api/auth/me", get(auth_me))
        .route("/api/papers/search", get(papers_search))
        .route("/api/papers/search/query", get(papers_search_query))
        .route("/api/papers/bulk/by-ids", get(papers_bulk_by_ids))
        .route("/api/papers/recommendations", get(papers_recommendations))
        .route("/api/papers/parse-query", get(papers_parse_query))
        .route("/api/papers/{paper_id}", get(paper_by_id))
        .route("/api/papers/{paper_id}/similar", get(paper_similar))
        .route(
            "/api/profile",
            get(profile_get).put(profile_put).delete(profile_delete),
        )
        .route("/api/feedback", get(feedback_get).delete(feedback_clear_all))
        .route("/api/feedback/like", post(feedback_like))
        .route("/api/feedback/like/{paper_id}", delete(feedback_unlike))
        .route("/api/feedback/dislike", post(feedback_dislike))
        .route("/api/feedback/dislike/{paper_id}", delete(feedback_undislike))
        .route("/api/feedback/liked", delete(feedback_clear_liked))
        .route("/api/feedback/disliked", delete(feedback_clear_disliked))
        .route("/api/folders", get(folders_list).post(folders_create))
        .route(
            "/api/folders/{folder_id}",
            get(folder_get).delete(folder_delete),
        )
        .route("/api/folders/{folder_id}/papers", post(folder_add_paper))
        .route(
            "/api/folders/{folder_id}/papers/{paper_id}",
            delete(folder_remove_paper),
        )
        .route("/api/follows", get(follows_list).post(follows_create))
        .route("/api/follows/papers", get(follows_papers))
        .route("/api/follows/{entity_type}/{entity_id}", delete(follows_delete))
        .route("/api/entity-search/{entity_type}", get(entity_search))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(REQUEST_DEADLINE))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

// === Auth ===

async fn auth_login(State(state): State<AppState>) -> Result<Redirect> {
    let url = state.auth.login_url().await?;
    Ok(Redirect::to(&url))
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
}

async fn auth_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<Response> {
    let code = params
        .code
        .ok_or_else(|| ScholarError::Validation("missing code".to_string()))?;
    let oauth_state = params
        .state
        .ok_or_else(|| ScholarError::Validation("missing state".to_string()))?;

    let (_user, token) = state.auth.handle_callback(&code, &oauth_state).await?;
    let cookie = state.auth.session_cookie(&token);
    Ok((
        AppendHeaders([(header::SET_COOKIE, cookie)]),
        Redirect::to(&state.auth.spa_url),
    )
        .into_response())
}

async fn auth_logout(State(state): State<AppState>) -> Response {
    (
        AppendHeaders([(header::SET_COOKIE, state.auth.clear_cookie())]),
        Redirect::to(&state.auth.spa_url),
    )
        .into_response()
}

async fn auth_status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match claims_from_headers(&headers, &state) {
        Some(claims) => {
            let user = state.users.get_user(&claims.user_id).await;
            let body = Json(serde_json::json!({
                "authenticated": true,
                "user": user,
            }));
            // Sliding lifetime: reissue the cookie past its half-life
            if claims.needs_renewal() {
                if let Ok(token) = state.auth.renew_session(&claims) {
                    let cookie = state.auth.session_cookie(&token);
                    return (AppendHeaders([(header::SET_COOKIE, cookie)]), body)
                        .into_response();
                }
            }
            body.into_response()
        }
        None => Json(serde_json::json!({"authenticated": false})).into_response(),
    }
}

async fn auth_me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match claims_from_headers(&headers, &state) {
        Some(claims) => Json(state.users.get_user(&claims.user_id).await).into_response(),
        None => Json(serde_json::Value::Null).into_response(),
    }
}

// === Papers ===

#[derive(Debug, Deserialize)]
struct SearchParams {
    topics: Option<String>,
    authors: Option<String>,
    sort_by: Option<String>,
    page: Option<u32>,
    per_page: Option<u32>,
}

async fn papers_search(
    State(state): State<AppState>,
    principal: Principal,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<Paper>>> {
    let query = StructuredQuery {
        topics: split_csv(params.topics.as_deref()),
        authors: split_csv(params.authors.as_deref()),
        sort_by: parse_sort(params.sort_by.as_deref())?,
        page: params.page.unwrap_or(1).max(1),
        per_page: validate_per_page(params.per_page)?,
        ..Default::default()
    };
    let papers = state.search.search(&principal.0.user_id, query).await?;
    Ok(Json(papers))
}

#[derive(Debug, Deserialize)]
struct TextSearchParams {
    q: Option<String>,
    sort_by: Option<String>,
    page: Option<u32>,
    per_page: Option<u32>,
}

async fn papers_search_query(
    State(state): State<AppState>,
    principal: Principal,
    Query(params): Query<TextSearchParams>,
) -> Result<Json<Vec<Paper>>> {
    let q = params
        .q
        .ok_or_else(|| ScholarError::Validation("missing q".to_string()))?;
    let papers = state
        .search
        .search_text(
            &principal.0.user_id,
            &q,
            parse_sort(params.sort_by.as_deref())?,
            params.page.unwrap_or(1).max(1),
            validate_per_page(params.per_page)?,
        )
        .await?;
    Ok(Json(papers))
}

async fn paper_by_id(
    State(state): State<AppState>,
    _principal: Principal,
    Path(paper_id): Path<String>,
) -> Result<Json<Paper>> {
    if let Some(paper) = state.papers.get(&paper_id).await {
        state.papers.touch(&paper_id).await;
        return Ok(Json(paper));
    }
    match state.openalex.fetch_work_by_id(&paper_id).await? {
        Some(paper) => {
            state.papers.put(paper.clone()).await?;
            Ok(Json(paper))
        }
        None => Err(ScholarError::NotFound(format!("paper {}", paper_id))),
    }
}

#[derive(Debug, Deserialize)]
struct BulkParams {
    paper_ids: Option<String>,
}

async fn papers_bulk_by_ids(
    State(state): State<AppState>,
    _principal: Principal,
    Query(params): Query<BulkParams>,
) -> Result<Json<Vec<Paper>>> {
    let ids = split_csv(params.paper_ids.as_deref());
    if ids.is_empty() {
        return Err(ScholarError::Validation("missing paper_ids".to_string()));
    }

    let cached = state.papers.get_many(&ids).await;
    let missing: Vec<String> = {
        let have: std::collections::HashSet<&str> =
            cached.iter().map(|p| p.paper_id.as_str()).collect();
        ids.iter()
            .filter(|id| !have.contains(id.as_str()))
            .cloned()
            .collect()
    };

    let mut by_id: std::collections::HashMap<String, Paper> = cached
        .into_iter()
        .map(|p| (p.paper_id.clone(), p))
        .collect();
    if !missing.is_empty() {
        let fetched = state.openalex.fetch_works_by_ids(&missing).await?;
        state.papers.put_many(fetched.clone()).await?;
        by_id.extend(fetched.into_iter().map(|p| (p.paper_id.clone(), p)));
    }

    // Input order, missing ids omitted
    let papers: Vec<Paper> = ids.iter().filter_map(|id| by_id.remove(id)).collect();
    Ok(Json(papers))
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

async fn paper_similar(
    State(state): State<AppState>,
    _principal: Principal,
    Path(paper_id): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<Paper>>> {
    let limit = validate_limit(params.limit, DEFAULT_LIMIT)?;
    let papers = state.openalex.related_works(&paper_id, limit as u32).await?;
    state.papers.put_many(papers.clone()).await?;
    Ok(Json(papers))
}

async fn papers_recommendations(
    State(state): State<AppState>,
    principal: Principal,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<Paper>>> {
    let limit = validate_limit(params.limit, DEFAULT_LIMIT)?;
    let papers = state.recommend.recommend(&principal.0.user_id, limit).await?;
    Ok(Json(papers))
}

#[derive(Debug, Deserialize)]
struct ParseParams {
    q: Option<String>,
}

async fn papers_parse_query(
    State(state): State<AppState>,
    _principal: Principal,
    Query(params): Query<ParseParams>,
) -> Result<Json<crate::query_parser::ParsedQuery>> {
    let q = params
        .q
        .ok_or_else(|| ScholarError::Validation("missing q".to_string()))?;
    Ok(Json(state.parser.parse(&q).await))
}

// === Profile ===

async fn profile_get(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<serde_json::Value>> {
    let profile = state.users.get_profile(&principal.0.user_id).await;
    let folders = folder_summaries(&state, &principal.0.user_id).await;
    Ok(Json(serde_json::json!({
        "topics": profile.topics,
        "authors": profile.authors,
        "folders": folders,
    })))
}

#[derive(Debug, Deserialize)]
struct ProfileBody {
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    authors: Vec<String>,
}

async fn profile_put(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<ProfileBody>,
) -> Result<Json<serde_json::Value>> {
    state
        .users
        .put_profile(&principal.0.user_id, body.topics, body.authors)
        .await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn profile_delete(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<serde_json::Value>> {
    state.users.clear_profile(&principal.0.user_id).await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

// === Feedback ===

async fn feedback_get(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<crate::user_store::FeedbackSummary>> {
    Ok(Json(state.users.get_feedback(&principal.0.user_id).await))
}

#[derive(Debug, Deserialize)]
struct FeedbackBody {
    paper_id: String,
    #[serde(default)]
    paper_data: Option<Paper>,
}

/// Upsert the snapshot (if any) into the paper cache before the user-side
/// mutation, so the stored reference always resolves.
async fn cache_snapshot(
    state: &AppState,
    paper_id: &str,
    snapshot: Option<Paper>,
) -> Result<()> {
    if let Some(paper) = snapshot {
        if paper.paper_id != paper_id {
            return Err(ScholarError::Validation(
                "paper_data id does not match paper_id".to_string(),
            ));
        }
        state.papers.put(paper).await?;
    }
    Ok(())
}

async fn feedback_like(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<FeedbackBody>,
) -> Result<Json<serde_json::Value>> {
    if body.paper_id.is_empty() {
        return Err(ScholarError::Validation("missing paper_id".to_string()));
    }
    cache_snapshot(&state, &body.paper_id, body.paper_data).await?;
    state.users.like(&principal.0.user_id, &body.paper_id).await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn feedback_dislike(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<FeedbackBody>,
) -> Result<Json<serde_json::Value>> {
    if body.paper_id.is_empty() {
        return Err(ScholarError::Validation("missing paper_id".to_string()));
    }
    cache_snapshot(&state, &body.paper_id, body.paper_data).await?;
    state
        .users
        .dislike(&principal.0.user_id, &body.paper_id)
        .await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn feedback_unlike(
    State(state): State<AppState>,
    principal: Principal,
    Path(paper_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.users.unlike(&principal.0.user_id, &paper_id).await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn feedback_undislike(
    State(state): State<AppState>,
    principal: Principal,
    Path(paper_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state
        .users
        .undislike(&principal.0.user_id, &paper_id)
        .await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn feedback_clear_all(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<StatusCode> {
    state
        .users
        .clear_feedback(&principal.0.user_id, ClearFeedback::All)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn feedback_clear_liked(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<StatusCode> {
    state
        .users
        .clear_feedback(&principal.0.user_id, ClearFeedback::Liked)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn feedback_clear_disliked(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<StatusCode> {
    state
        .users
        .clear_feedback(&principal.0.user_id, ClearFeedback::Disliked)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Folders ===

async fn folder_summaries(state: &AppState, user_id: &str) -> Vec<serde_json::Value> {
    state
        .users
        .list_folders(user_id)
        .await
        .into_iter()
        .map(|f| {
            serde_json::json!({
                "folder_id": f.folder_id,
                "name": f.name,
                "description": f.description,
                "paper_count": f.paper_count(),
                "created_at": f.created_at,
                "updated_at": f.updated_at,
            })
        })
        .collect()
}

async fn folders_list(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<Vec<serde_json::Value>>> {
    Ok(Json(folder_summaries(&state, &principal.0.user_id).await))
}

#[derive(Debug, Deserialize)]
struct FolderBody {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

async fn folders_create(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<FolderBody>,
) -> Result<Response> {
    let folder = state
        .users
        .create_folder(&principal.0.user_id, &body.name, body.description)
        .await?;
    Ok((StatusCode::CREATED, Json(folder)).into_response())
}

async fn folder_get(
    State(state): State<AppState>,
    principal: Principal,
    Path(folder_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let folder = state
        .users
        .get_folder(&principal.0.user_id, &folder_id)
        .await?;
    let papers = state.papers.get_many(&folder.paper_ids).await;
    Ok(Json(serde_json::json!({
        "folder_id": folder.folder_id,
        "name": folder.name,
        "description": folder.description,
        "paper_ids": folder.paper_ids,
        "paper_count": folder.paper_count(),
        "papers": papers,
        "created_at": folder.created_at,
        "updated_at": folder.updated_at,
    })))
}

async fn folder_delete(
    State(state): State<AppState>,
    principal: Principal,
    Path(folder_id): Path<String>,
) -> Result<StatusCode> {
    state
        .users
        .delete_folder(&principal.0.user_id, &folder_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn folder_add_paper(
    State(state): State<AppState>,
    principal: Principal,
    Path(folder_id): Path<String>,
    Json(body): Json<FeedbackBody>,
) -> Result<Json<serde_json::Value>> {
    if body.paper_id.is_empty() {
        return Err(ScholarError::Validation("missing paper_id".to_string()));
    }
    cache_snapshot(&state, &body.paper_id, body.paper_data).await?;
    state
        .users
        .add_paper(&principal.0.user_id, &folder_id, &body.paper_id)
        .await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn folder_remove_paper(
    State(state): State<AppState>,
    principal: Principal,
    Path((folder_id, paper_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>> {
    state
        .users
        .remove_paper(&principal.0.user_id, &folder_id, &paper_id)
        .await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

// === Follows ===

async fn follows_list(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<serde_json::Value>> {
    let follows = state.users.list_follows(&principal.0.user_id).await;
    Ok(Json(serde_json::json!({"follows": follows})))
}

#[derive(Debug, Deserialize)]
struct FollowBody {
    #[serde(rename = "type")]
    entity_type: String,
    #[serde(rename = "entityId", default)]
    entity_id: Option<String>,
    #[serde(rename = "entityName")]
    entity_name: String,
    #[serde(rename = "openalexId", default)]
    openalex_id: Option<String>,
}

async fn follows_create(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<FollowBody>,
) -> Result<Response> {
    let entity_type = EntityType::parse(&body.entity_type)
        .ok_or_else(|| ScholarError::Validation(format!("unknown type {:?}", body.entity_type)))?;
    if body.entity_name.trim().is_empty() {
        return Err(ScholarError::Validation("missing entityName".to_string()));
    }

    let follow = match entity_type {
        EntityType::Custom => {
            // A custom follow is a saved query; its id is a hash of the text
            let query = body.entity_name.trim().to_string();
            Follow {
                entity_type,
                entity_id: custom_follow_id(&query),
                entity_name: query.clone(),
                upstream_id: query,
                followed_at: Utc::now(),
            }
        }
        _ => {
            let entity_id = body
                .entity_id
                .filter(|id| !id.is_empty())
                .ok_or_else(|| ScholarError::Validation("missing entityId".to_string()))?;
            Follow {
                entity_type,
                upstream_id: body.openalex_id.filter(|id| !id.is_empty()).unwrap_or_else(|| entity_id.clone()),
                entity_id,
                entity_name: body.entity_name,
                followed_at: Utc::now(),
            }
        }
    };

    let (edge, created) = state.users.follow(&principal.0.user_id, follow).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(serde_json::json!({"success": true, "follow": edge})),
    )
        .into_response())
}

async fn follows_delete(
    State(state): State<AppState>,
    principal: Principal,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>> {
    let entity_type = EntityType::parse(&entity_type)
        .ok_or_else(|| ScholarError::Validation(format!("unknown type {:?}", entity_type)))?;
    state
        .users
        .unfollow(&principal.0.user_id, entity_type, &entity_id)
        .await?;
    Ok(Json(serde_json::json!({"success": true})))
}

#[derive(Debug, Deserialize)]
struct FollowFeedParams {
    limit_per_entity: Option<u32>,
    total_limit: Option<usize>,
}

async fn follows_papers(
    State(state): State<AppState>,
    principal: Principal,
    Query(params): Query<FollowFeedParams>,
) -> Result<Json<serde_json::Value>> {
    let per_entity = params
        .limit_per_entity
        .unwrap_or(DEFAULT_PER_ENTITY)
        .clamp(1, DEFAULT_PER_PAGE);
    let total = params
        .total_limit
        .unwrap_or(DEFAULT_TOTAL_LIMIT)
        .clamp(1, 1000);

    let papers = state
        .follows
        .feed(&principal.0.user_id, per_entity, total)
        .await?;
    info!(user = %principal.0.user_id, count = papers.len(), "Following feed served");
    Ok(Json(serde_json::json!({
        "count": papers.len(),
        "papers": papers,
    })))
}

// === Entity search ===

#[derive(Debug, Deserialize)]
struct EntitySearchParams {
    q: Option<String>,
    limit: Option<u32>,
}

async fn entity_search(
    State(state): State<AppState>,
    _principal: Principal,
    Path(entity_type): Path<String>,
    Query(params): Query<EntitySearchParams>,
) -> Result<Json<serde_json::Value>> {
    let entity_type = EntityType::parse(&entity_type)
        .ok_or_else(|| ScholarError::Validation(format!("unknown type {:?}", entity_type)))?;
    if entity_type == EntityType::Custom {
        return Err(ScholarError::Validation(
            "custom follows are not searchable upstream".to_string(),
        ));
    }
    let q = params
        .q
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| ScholarError::Validation("missing q".to_string()))?;
    let limit = params.limit.unwrap_or(10).clamp(1, 50);

    let results: Vec<Entity> = state.openalex.search_entities(entity_type, &q, limit).await?;
    Ok(Json(serde_json::json!({"results": results})))
}

// === Validation helpers ===

fn split_csv(input: Option<&str>) -> Vec<String> {
    input
        .map(|s| {
            s.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_sort(input: Option<&str>) -> Result<SortBy> {
    match input {
        None | Some("") | Some("recency") => Ok(SortBy::Recency),
        Some("relevance") => Ok(SortBy::Relevance),
        Some(other) => Err(ScholarError::Validation(format!(
            "unknown sort_by {:?}",
            other
        ))),
    }
}

fn validate_per_page(input: Option<u32>) -> Result<u32> {
    match input {
        None => Ok(DEFAULT_PER_PAGE),
        Some(n) if (1..=DEFAULT_PER_PAGE).contains(&n) => Ok(n),
        Some(n) => Err(ScholarError::Validation(format!(
            "per_page must be between 1 and {}, got {}",
            DEFAULT_PER_PAGE, n
        ))),
    }
}

fn validate_limit(input: Option<usize>, default: usize) -> Result<usize> {
    match input {
        None => Ok(default),
        Some(n) if (1..=MAX_LIMIT).contains(&n) => Ok(n),
        Some(n) => Err(ScholarError::Validation(format!(
            "limit must be between 1 and {}, got {}",
            MAX_LIMIT, n
        ))),
    }
}
