use chrono::{DateTime, Utc};

/// A row of the migration history table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub id: String,
    pub checksum: String,
    pub started_at: DateTime<Utc>,
    /// `None` while the up migration is running, or after it crashed.
    pub finished_at: Option<DateTime<Utc>>,
    /// Set while a rollback is running, or after it crashed.
    pub rollback_started_at: Option<DateTime<Utc>>,
}

impl AppliedMigration {
    /// A freshly started row.
    pub fn started(id: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            checksum: checksum.into(),
            started_at: Utc::now(),
            finished_at: None,
            rollback_started_at: None,
        }
    }

    /// A completed row, as left behind by a successful up migration.
    pub fn finished(id: impl Into<String>, checksum: impl Into<String>) -> Self {
        let mut row = Self::started(id, checksum);
        row.finished_at = Some(row.started_at);
        row
    }

    /// Neither an up migration nor a rollback is outstanding.
    pub fn is_clean(&self) -> bool {
        self.finished_at.is_some() && self.rollback_started_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_started_row_is_dirty() {
        let row = AppliedMigration::started("0001_init", "abc");
        assert!(row.finished_at.is_none());
        assert!(!row.is_clean());
    }

    #[test]
    fn test_finished_row_is_clean() {
        let mut row = AppliedMigration::finished("0001_init", "abc");
        assert!(row.is_clean());

        row.rollback_started_at = Some(Utc::now());
        assert!(!row.is_clean());
    }
}
