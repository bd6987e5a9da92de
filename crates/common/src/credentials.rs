use std::sync::{PoisonError, RwLock};

/// Source of the bearer token attached to REST requests and socket handshakes.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;

    /// Forget the current token, e.g. after the server rejected it.
    fn clear(&self) {}
}

/// A token fixed at construction time.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }

    pub fn from_option(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.trim().is_empty()))
    }
}

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Token obtained at login and dropped when the session expires.
#[derive(Debug, Default)]
pub struct SessionCredentials {
    token: RwLock<Option<String>>,
}

impl SessionCredentials {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    pub fn is_authenticated(&self) -> bool {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl CredentialProvider for SessionCredentials {
    fn bearer_token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn clear(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// `Authorization` header value for the provider's current token, if any.
pub fn authorization_header(provider: &dyn CredentialProvider) -> Option<String> {
    provider
        .bearer_token()
        .map(|token| format!("Bearer {}", token.trim()))
}
