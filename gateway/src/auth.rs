use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    /// Unknown user, credentials were stored and accepted.
    Enrolled,
    Rejected,
}

impl Verdict {
    pub fn is_success(self) -> bool {
        matches!(self, Verdict::Accepted | Verdict::Enrolled)
    }
}

/// Credential check behind `POST /api/login`.
///
/// Both arguments are the client side SHA-512 hex digests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, username: &str, password: &str) -> anyhow::Result<Verdict>;
}

/// In-memory store enrolling a user on first login.
#[derive(Debug, Default)]
pub struct FirstUseAuthenticator {
    known: RwLock<HashMap<String, String>>,
}

impl FirstUseAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Authenticator for FirstUseAuthenticator {
    async fn authenticate(&self, username: &str, password: &str) -> anyhow::Result<Verdict> {
        let mut known = self.known.write().await;
        let verdict = match known.get(username) {
            Some(stored) if stored == password => Verdict::Accepted,
            Some(_) => Verdict::Rejected,
            None => {
                known.insert(username.to_owned(), password.to_owned());
                Verdict::Enrolled
            }
        };
        Ok(verdict)
    }
}
