use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No GitHub API token available for {user} (set GITHUB_TOKEN or api.token)")]
    MissingToken { user: String },

    #[error("No GitHub browser session available for {user} (set GITHUB_SESSION or scrape.session)")]
    MissingSession { user: String },
}

/// Value of a signed-in GitHub web session (the `user_session` cookie).
#[derive(Clone)]
pub struct SessionHandle(String);

impl SessionHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn cookie_value(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionHandle(<redacted>)")
    }
}

/// Supplies whichever credential a fetch source needs.
pub trait CredentialProvider: Send + Sync {
    fn token(&self, user: &str) -> Result<String, AuthError>;
    fn session(&self, user: &str) -> Result<SessionHandle, AuthError>;
}

/// Credentials from configuration, falling back to `GITHUB_TOKEN` / `GITHUB_SESSION`.
#[derive(Clone, Default)]
pub struct EnvCredentials {
    token: Option<String>,
    session: Option<String>,
}

impl EnvCredentials {
    pub fn new(token: Option<String>, session: Option<String>) -> Self {
        Self {
            token: token.or_else(|| std::env::var("GITHUB_TOKEN").ok()),
            session: session.or_else(|| std::env::var("GITHUB_SESSION").ok()),
        }
    }
}

impl fmt::Debug for EnvCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvCredentials")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("session", &self.session.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl CredentialProvider for EnvCredentials {
    fn token(&self, user: &str) -> Result<String, AuthError> {
        self.token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| AuthError::MissingToken { user: user.to_string() })
    }

    fn session(&self, user: &str) -> Result<SessionHandle, AuthError> {
        self.session
            .clone()
            .filter(|s| !s.trim().is_empty())
            .map(SessionHandle::new)
            .ok_or_else(|| AuthError::MissingSession { user: user.to_string() })
    }
}

/// Fixed credentials, for wiring fetchers without touching the environment.
#[derive(Clone, Default)]
pub struct StaticCredentials {
    pub token: Option<String>,
    pub session: Option<String>,
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticCredentials(<redacted>)")
    }
}

impl CredentialProvider for StaticCredentials {
    fn token(&self, user: &str) -> Result<String, AuthError> {
        self.token
            .clone()
            .ok_or_else(|| AuthError::MissingToken { user: user.to_string() })
    }

    fn session(&self, user: &str) -> Result<SessionHandle, AuthError> {
        self.session
            .clone()
            .map(SessionHandle::new)
            .ok_or_else(|| AuthError::MissingSession { user: user.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_values_are_returned() {
        let creds = EnvCredentials {
            token: Some("ghp_test".to_string()),
            session: Some("cookie".to_string()),
        };
        assert_eq!(creds.token("octocat").unwrap(), "ghp_test");
        assert_eq!(creds.session("octocat").unwrap().cookie_value(), "cookie");
    }

    #[test]
    fn test_missing_values_are_auth_errors() {
        let creds = EnvCredentials::default();
        assert!(matches!(creds.token("octocat"), Err(AuthError::MissingToken { .. })));
        assert!(matches!(creds.session("octocat"), Err(AuthError::MissingSession { .. })));
    }

    #[test]
    fn test_blank_token_is_missing() {
        let creds = EnvCredentials {
            token: Some("  ".to_string()),
            session: None,
        };
        assert!(creds.token("octocat").is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = EnvCredentials {
            token: Some("ghp_secret".to_string()),
            session: Some("cookie-secret".to_string()),
        };
        let printed = format!("{creds:?} {:?}", SessionHandle::new("cookie-secret"));
        assert!(!printed.contains("secret"));
    }

    #[test]
    fn test_static_credentials() {
        let creds = StaticCredentials {
            token: Some("ghp_fixed".to_string()),
            session: None,
        };
        assert_eq!(creds.token("octocat").unwrap(), "ghp_fixed");
        assert!(matches!(creds.session("octocat"), Err(AuthError::MissingSession { .. })));
    }
}
