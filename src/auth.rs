//! Session and OAuth gateway.
//!
//! OAuth 2.0 authorization-code flow against an external identity provider
//! (Google-shaped endpoints, overridable for tests). Sessions are stateless
//! signed cookies: a base64url JSON payload plus an HMAC-SHA256 signature
//! over it, verified on every request. The CSRF `state` parameter lives in a
//! process-local pending map with a short expiry.
//!
//! Session lifecycle: anonymous -> (login) -> pending (state stored) ->
//! (callback OK) -> authenticated -> (logout or expiry) -> anonymous.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{AppConfig, OAuthConfig};
use crate::error::{Result, ScholarError};
use crate::models::User;
use crate::user_store::UserStore;

type HmacSha256 = Hmac<Sha256>;

/// Session cookie name
pub const SESSION_COOKIE: &str = "sf_session";

/// Session lifetime (sliding)
const SESSION_TTL_SECS: i64 = 30 * 24 * 3600;

/// How long a login `state` stays redeemable
const STATE_TTL: Duration = Duration::from_secs(600);

/// Signed session contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub user_id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture_url: Option<String>,
    /// Unix timestamp past which the session is invalid
    pub expires_at: i64,
}

impl SessionClaims {
    fn for_user(user: &User) -> Self {
        Self {
            user_id: user.user_id.clone(),
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            picture_url: user.picture_url.clone(),
            expires_at: Utc::now().timestamp() + SESSION_TTL_SECS,
        }
    }

    /// Sliding renewal: reissue once the session is past its half-life.
    pub fn needs_renewal(&self) -> bool {
        Utc::now().timestamp() > self.expires_at - SESSION_TTL_SECS / 2
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
    email: Option<String>,
    name: Option<String>,
    picture: Option<String>,
}

/// OAuth + session gateway.
pub struct AuthGateway {
    secret: Vec<u8>,
    oauth: Option<OAuthConfig>,
    redirect_uri: String,
    pub spa_url: String,
    users: Arc<UserStore>,
    client: reqwest::Client,
    pending_states: Mutex<HashMap<String, Instant>>,
}

impl AuthGateway {
    pub fn new(config: &AppConfig, users: Arc<UserStore>) -> Result<Self> {
        if config.session_secret.len() < 16 {
            return Err(ScholarError::Config(
                "SESSION_SECRET must be at least 16 bytes".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ScholarError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            secret: config.session_secret.as_bytes().to_vec(),
            oauth: config.oauth.clone(),
            redirect_uri: config.redirect_uri(),
            spa_url: config.spa_url.clone(),
            users,
            client,
            pending_states: Mutex::new(HashMap::new()),
        })
    }

    /// Build the provider authorization URL and remember the CSRF state.
    pub async fn login_url(&self) -> Result<String> {
        let oauth = self.oauth()?;
        let state = generate_state();
        {
            let mut pending = self.pending_states.lock().await;
            pending.retain(|_, stored| stored.elapsed() < STATE_TTL);
            pending.insert(state.clone(), Instant::now());
        }

        let mut authorize = url::Url::parse(&oauth.authorization_url)
            .map_err(|e| ScholarError::Config(format!("bad authorization URL: {}", e)))?;
        authorize
            .query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &oauth.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", "openid email profile")
            .append_pair("state", &state);
        Ok(authorize.to_string())
    }

    /// Exchange the callback code, upsert the user, and mint a session token.
    pub async fn handle_callback(&self, code: &str, state: &str) -> Result<(User, String)> {
        let oauth = self.oauth()?;

        let known = {
            let mut pending = self.pending_states.lock().await;
            match pending.remove(state) {
                Some(stored) => stored.elapsed() < STATE_TTL,
                None => false,
            }
        };
        if !known {
            return Err(ScholarError::Validation(
                "unknown or expired OAuth state".to_string(),
            ));
        }

        let token: TokenResponse = self
            .client
            .post(&oauth.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", oauth.client_id.as_str()),
                ("client_secret", oauth.client_secret.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .send()
            .await?
            .error_for_status()
            .map_err(|e| ScholarError::Upstream(format!("token exchange failed: {}", e)))?
            .json()
            .await
            .map_err(|e| ScholarError::Upstream(format!("bad token response: {}", e)))?;

        let info: UserInfo = self
            .client
            .get(&oauth.userinfo_url)
            .bearer_auth(&token.access_token)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| ScholarError::Upstream(format!("userinfo failed: {}", e)))?
            .json()
            .await
            .map_err(|e| ScholarError::Upstream(format!("bad userinfo response: {}", e)))?;

        let now = Utc::now();
        let user = User {
            // Stable principal id derived from the OAuth subject
            user_id: format!("g:{}", info.sub),
            email: info.email.unwrap_or_default(),
            display_name: info.name,
            picture_url: info.picture,
            created_at: now,
            last_login_at: now,
        };
        let user = self.users.upsert_user(user).await?;
        info!(user = %user.user_id, "Login complete");

        let token = self.mint_session(&SessionClaims::for_user(&user))?;
        Ok((user, token))
    }

    /// Sign a session payload into a cookie value.
    pub fn mint_session(&self, claims: &SessionClaims) -> Result<String> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| ScholarError::Internal(format!("bad session secret: {}", e)))?;
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{}.{}", payload, signature))
    }

    /// Verify a session token; bad signatures and expired payloads reject.
    pub fn verify_session(&self, token: &str) -> Result<SessionClaims> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or(ScholarError::Unauthenticated)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| ScholarError::Internal(format!("bad session secret: {}", e)))?;
        mac.update(payload.as_bytes());
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| ScholarError::Unauthenticated)?;
        mac.verify_slice(&signature_bytes)
            .map_err(|_| ScholarError::Unauthenticated)?;

        let claims: SessionClaims = serde_json::from_slice(
            &URL_SAFE_NO_PAD
                .decode(payload)
                .map_err(|_| ScholarError::Unauthenticated)?,
        )
        .map_err(|_| ScholarError::Unauthenticated)?;

        if claims.expires_at <= Utc::now().timestamp() {
            warn!(user = %claims.user_id, "Session expired");
            return Err(ScholarError::Unauthenticated);
        }
        Ok(claims)
    }

    /// Reissue a token for a still-valid session past its half-life.
    pub fn renew_session(&self, claims: &SessionClaims) -> Result<String> {
        let mut renewed = claims.clone();
        renewed.expires_at = Utc::now().timestamp() + SESSION_TTL_SECS;
        self.mint_session(&renewed)
    }

    /// `Set-Cookie` value binding a session token.
    pub fn session_cookie(&self, token: &str) -> String {
        format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            SESSION_COOKIE, token, SESSION_TTL_SECS
        )
    }

    /// `Set-Cookie` value clearing the session.
    pub fn clear_cookie(&self) -> String {
        format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", SESSION_COOKIE)
    }

    fn oauth(&self) -> Result<&OAuthConfig> {
        self.oauth.as_ref().ok_or_else(|| {
            ScholarError::Config("OAuth client is not configured".to_string())
        })
    }
}

/// Random CSRF state parameter.
fn generate_state() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Pull the session token out of a `Cookie` request header.
pub fn session_from_cookie_header(header: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        if name == SESSION_COOKIE && !value.is_empty() {
            Some(value.to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn config(oauth: Option<OAuthConfig>) -> AppConfig {
        AppConfig {
            mailto: None,
            base_url: "http://localhost:3000".to_string(),
            spa_url: "/".to_string(),
            session_secret: "a-very-long-test-secret".to_string(),
            oauth,
            llm: None,
            data_dir: None,
        }
    }

    fn gateway() -> AuthGateway {
        AuthGateway::new(&config(None), Arc::new(UserStore::in_memory())).unwrap()
    }

    fn claims(user_id: &str) -> SessionClaims {
        SessionClaims {
            user_id: user_id.to_string(),
            email: "u@example.org".to_string(),
            display_name: None,
            picture_url: None,
            expires_at: Utc::now().timestamp() + 1000,
        }
    }

    #[test]
    fn test_session_roundtrip() {
        let gateway = gateway();
        let token = gateway.mint_session(&claims("u1")).unwrap();
        let verified = gateway.verify_session(&token).unwrap();
        assert_eq!(verified.user_id, "u1");
        assert_eq!(verified.email, "u@example.org");
    }

    #[test]
    fn test_tampered_session_rejects() {
        let gateway = gateway();
        let token = gateway.mint_session(&claims("u1")).unwrap();
        let mut tampered = token.clone();
        tampered.replace_range(0..2, "zz");
        assert!(matches!(
            gateway.verify_session(&tampered),
            Err(ScholarError::Unauthenticated)
        ));
        assert!(matches!(
            gateway.verify_session("not-a-token"),
            Err(ScholarError::Unauthenticated)
        ));
    }

    #[test]
    fn test_expired_session_rejects() {
        let gateway = gateway();
        let mut expired = claims("u1");
        expired.expires_at = Utc::now().timestamp() - 1;
        let token = gateway.mint_session(&expired).unwrap();
        assert!(matches!(
            gateway.verify_session(&token),
            Err(ScholarError::Unauthenticated)
        ));
    }

    #[test]
    fn test_needs_renewal_past_half_life() {
        let mut fresh = claims("u1");
        fresh.expires_at = Utc::now().timestamp() + SESSION_TTL_SECS;
        assert!(!fresh.needs_renewal());

        let mut aging = claims("u1");
        aging.expires_at = Utc::now().timestamp() + SESSION_TTL_SECS / 4;
        assert!(aging.needs_renewal());
    }

    #[test]
    fn test_cookie_header_parsing() {
        assert_eq!(
            session_from_cookie_header("sf_session=abc.def; other=1"),
            Some("abc.def".to_string())
        );
        assert_eq!(
            session_from_cookie_header("other=1; sf_session=xyz"),
            Some("xyz".to_string())
        );
        assert_eq!(session_from_cookie_header("other=1"), None);
        assert_eq!(session_from_cookie_header("sf_session="), None);
    }

    #[tokio::test]
    async fn test_state_is_single_use() {
        let oauth = OAuthConfig {
            client_id: "cid".to_string(),
            client_secret: "cs".to_string(),
            authorization_url: "http://127.0.0.1:9/auth".to_string(),
            token_url: "http://127.0.0.1:9/token".to_string(),
            userinfo_url: "http://127.0.0.1:9/userinfo".to_string(),
        };
        let gateway =
            AuthGateway::new(&config(Some(oauth)), Arc::new(UserStore::in_memory())).unwrap();

        let url = gateway.login_url().await.unwrap();
        assert!(url.contains("state="));
        assert!(url.contains("redirect_uri="));

        // A state the gateway never issued is rejected before any network I/O
        let err = gateway.handle_callback("code", "bogus-state").await.unwrap_err();
        assert!(matches!(err, ScholarError::Validation(_)));
    }

    #[tokio::test]
    async fn test_callback_exchanges_code_and_upserts_user() {
        use axum::routing::{get, post};

        let app = axum::Router::new()
            .route(
                "/token",
                post(|| async {
                    axum::Json(serde_json::json!({
                        "access_token": "at-1",
                        "token_type": "Bearer"
                    }))
                }),
            )
            .route(
                "/userinfo",
                get(|| async {
                    axum::Json(serde_json::json!({
                        "sub": "subject-7",
                        "email": "ada@example.org",
                        "name": "Ada",
                        "picture": "https://example.org/p.png"
                    }))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let oauth = OAuthConfig {
            client_id: "cid".to_string(),
            client_secret: "cs".to_string(),
            authorization_url: format!("http://{}/auth", addr),
            token_url: format!("http://{}/token", addr),
            userinfo_url: format!("http://{}/userinfo", addr),
        };
        let users = Arc::new(UserStore::in_memory());
        let gateway = AuthGateway::new(&config(Some(oauth)), users.clone()).unwrap();

        let login = gateway.login_url().await.unwrap();
        let state = login
            .split("state=")
            .nth(1)
            .unwrap()
            .split('&')
            .next()
            .unwrap()
            .to_string();

        let (user, token) = gateway.handle_callback("code-1", &state).await.unwrap();
        assert_eq!(user.user_id, "g:subject-7");
        assert_eq!(user.email, "ada@example.org");
        assert!(users.get_user("g:subject-7").await.is_some());

        let verified = gateway.verify_session(&token).unwrap();
        assert_eq!(verified.user_id, "g:subject-7");

        // Second login with the same subject keeps the same user id
        let login2 = gateway.login_url().await.unwrap();
        let state2 = login2
            .split("state=")
            .nth(1)
            .unwrap()
            .split('&')
            .next()
            .unwrap()
            .to_string();
        let (user2, _) = gateway.handle_callback("code-2", &state2).await.unwrap();
        assert_eq!(user2.user_id, user.user_id);
    }
}
