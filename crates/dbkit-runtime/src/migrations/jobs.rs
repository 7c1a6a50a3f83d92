use std::sync::Arc;

use async_trait::async_trait;
use dbkit_core::error::{Result, ResultExt};
use dbkit_core::source::Store;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::jobs::{Job, ReversibleJob};

/// Creates one side of a migration pair; rollback removes it again.
pub(crate) struct CreateMigrationJob {
    store: Arc<dyn Store>,
    label: &'static str,
    id: String,
    contents: String,
}

impl CreateMigrationJob {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        label: &'static str,
        id: impl Into<String>,
        contents: impl Into<String>,
    ) -> Self {
        Self {
            store,
            label,
            id: id.into(),
            contents: contents.into(),
        }
    }
}

#[async_trait]
impl Job for CreateMigrationJob {
    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        self.store
            .create(cancel, &self.id, &self.contents)
            .await
            .with_context(|| format!("failed to create {} migration {}", self.label, self.id))?;
        info!(id = %self.id, side = self.label, "Migration source created");
        Ok(())
    }
}

#[async_trait]
impl ReversibleJob for CreateMigrationJob {
    async fn rollback(&self, cancel: &CancellationToken) -> Result<()> {
        warn!(id = %self.id, side = self.label, "Removing migration source");
        self.store
            .remove(cancel, &self.id)
            .await
            .with_context(|| format!("failed to remove {} migration {}", self.label, self.id))
    }
}
