//! Service configuration loaded from environment variables.
//!
//! Host and port come from the CLI; everything else (upstream identity, OAuth
//! client, session secret, store paths, optional LLM parser) is read once at
//! startup into [`AppConfig`].

use std::path::PathBuf;

use crate::error::{Result, ScholarError};

/// OAuth provider endpoints. Defaults target Google; overridable for tests.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub authorization_url: String,
    pub token_url: String,
    pub userinfo_url: String,
}

/// Optional LLM-backed query parser configuration (OpenAI-compatible API).
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Email advertised to OpenAlex for polite-pool access
    pub mailto: Option<String>,
    /// Public base URL of this service, used to build the OAuth redirect_uri
    pub base_url: String,
    /// Where the browser is sent after a successful login
    pub spa_url: String,
    /// Secret for signing session cookies
    pub session_secret: String,
    pub oauth: Option<OAuthConfig>,
    pub llm: Option<LlmConfig>,
    /// Directory for the JSON store snapshots; None keeps everything in memory
    pub data_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// `SESSION_SECRET` is required; a missing OAuth client pair disables the
    /// login flow (useful for tests, which mint sessions directly).
    pub fn from_env() -> Result<Self> {
        let session_secret = std::env::var("SESSION_SECRET")
            .map_err(|_| ScholarError::Config("SESSION_SECRET is not set".to_string()))?;

        let base_url = std::env::var("SCHOLARFEED_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:3000".to_string());
        url::Url::parse(&base_url)
            .map_err(|e| ScholarError::Config(format!("invalid SCHOLARFEED_BASE_URL: {}", e)))?;
        let spa_url = std::env::var("SCHOLARFEED_SPA_URL").unwrap_or_else(|_| "/".to_string());

        let oauth = match (
            std::env::var("OAUTH_CLIENT_ID").ok(),
            std::env::var("OAUTH_CLIENT_SECRET").ok(),
        ) {
            (Some(client_id), Some(client_secret)) => Some(OAuthConfig {
                client_id,
                client_secret,
                authorization_url: std::env::var("OAUTH_AUTHORIZATION_URL").unwrap_or_else(|_| {
                    "https://accounts.google.com/o/oauth2/v2/auth".to_string()
                }),
                token_url: std::env::var("OAUTH_TOKEN_URL")
                    .unwrap_or_else(|_| "https://oauth2.googleapis.com/token".to_string()),
                userinfo_url: std::env::var("OAUTH_USERINFO_URL").unwrap_or_else(|_| {
                    "https://openidconnect.googleapis.com/v1/userinfo".to_string()
                }),
            }),
            _ => {
                tracing::warn!("OAuth disabled: OAUTH_CLIENT_ID / OAUTH_CLIENT_SECRET not set");
                None
            }
        };

        let llm = match (
            std::env::var("LLM_BASE_URL").ok(),
            std::env::var("LLM_API_KEY").ok(),
        ) {
            (Some(base_url), Some(api_key)) => Some(LlmConfig {
                base_url,
                api_key,
                model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            }),
            _ => None,
        };

        let data_dir = match std::env::var("SCHOLARFEED_DATA_DIR") {
            Ok(dir) if dir.eq_ignore_ascii_case("none") => None,
            Ok(dir) => Some(PathBuf::from(dir)),
            Err(_) => dirs::home_dir().map(|p| p.join(".scholarfeed")),
        };

        Ok(Self {
            mailto: std::env::var("SCHOLARFEED_MAILTO").ok(),
            base_url,
            spa_url,
            session_secret,
            oauth,
            llm,
            data_dir,
        })
    }

    /// Redirect URI registered with the OAuth provider.
    pub fn redirect_uri(&self) -> String {
        format!("{}/api/auth/callback", self.base_url.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_uri_trims_trailing_slash() {
        let config = AppConfig {
            mailto: None,
            base_url: "https://feed.example.org/".to_string(),
            spa_url: "/".to_string(),
            session_secret: "secret".to_string(),
            oauth: None,
            llm: None,
            data_dir: None,
        };
        assert_eq!(
            config.redirect_uri(),
            "https://feed.example.org/api/auth/callback"
        );
    }
}
