//! Access-token lookup used whenever a job is started or recovered.

use std::path::PathBuf;

use crate::credentials::load_credentials;

/// Synchronous source of the current access token.
///
/// Implementations are consulted at dispatch time, so a token refreshed on
/// disk between two jobs is picked up without restarting anything.
pub trait TokenStore: Send + Sync + 'static {
    fn access_token(&self) -> Option<String>;
}

/// A fixed token (or none), e.g. from `--token`.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenStore(Option<String>);

impl StaticTokenStore {
    pub fn new(token: Option<String>) -> Self {
        Self(token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()))
    }
}

impl TokenStore for StaticTokenStore {
    fn access_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Reads the credentials file on every lookup.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl TokenStore for FileTokenStore {
    fn access_token(&self) -> Option<String> {
        // A corrupt file reads as "logged out".
        load_credentials(&self.path)
            .ok()
            .flatten()
            .and_then(|c| c.access_token)
    }
}
