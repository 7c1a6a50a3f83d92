//! Ordered, identified, lazily read units of SQL.

use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex_lite::Regex;
use tokio_util::sync::CancellationToken;

use crate::cancel;
use crate::error::{DbkitError, Result};

/// Deferred access to a source's text.
#[async_trait]
pub trait SourceContents: Send + Sync {
    async fn load(&self, cancel: &CancellationToken) -> Result<String>;
}

/// Contents already held in memory.
pub struct InlineContents(pub String);

#[async_trait]
impl SourceContents for InlineContents {
    async fn load(&self, _cancel: &CancellationToken) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// A listed source. Its contents are only read when asked for.
#[derive(Clone)]
pub struct Source {
    id: String,
    contents: Arc<dyn SourceContents>,
}

impl Source {
    pub fn new(id: impl Into<String>, contents: Arc<dyn SourceContents>) -> Self {
        Self {
            id: id.into(),
            contents,
        }
    }

    pub fn inline(id: impl Into<String>, contents: impl Into<String>) -> Self {
        Self::new(id, Arc::new(InlineContents(contents.into())))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fetch the contents.
    pub async fn contents(&self, cancel: &CancellationToken) -> Result<String> {
        cancel::check(cancel)?;
        self.contents.load(cancel).await
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source").field("id", &self.id).finish_non_exhaustive()
    }
}

/// A backend holding sources, e.g. a directory of `.sql` files.
#[async_trait]
pub trait Store: Send + Sync {
    /// All sources sorted by id.
    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<Source>>;

    /// Create a source. Fails if the id is invalid or already exists.
    /// Readers never observe partially written contents.
    async fn create(&self, cancel: &CancellationToken, id: &str, contents: &str) -> Result<()>;

    /// Remove a source. Fails if it does not exist.
    async fn remove(&self, cancel: &CancellationToken, id: &str) -> Result<()>;
}

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9_-]+$").expect("id pattern is valid"))
}

/// Source ids are lowercase alphanumerics, underscores and hyphens.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(DbkitError::InvalidArgument("id cannot be empty".to_string()));
    }
    if !id_pattern().is_match(id) {
        return Err(DbkitError::InvalidArgument(format!(
            "invalid id (must contain only lowercase alphanumeric characters, underscores, and hyphens): {}",
            id
        )));
    }
    Ok(())
}
