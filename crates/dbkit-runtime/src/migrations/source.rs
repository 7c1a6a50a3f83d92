use dbkit_core::driver::AppliedMigration;
use dbkit_core::error::{DbkitError, Result};
use dbkit_core::source::Source;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

/// Loaded contents of a migration pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationContents {
    pub up: String,
    pub down: String,
    pub checksum: String,
}

/// An up source and the down source that reverts it.
#[derive(Debug, Clone)]
pub struct MigrationSource {
    id: String,
    up: Source,
    down: Source,
}

impl MigrationSource {
    /// Pair two sources. Their ids must match.
    pub fn new(up: Source, down: Source) -> Result<Self> {
        if up.id() != down.id() {
            return Err(DbkitError::Integrity(format!(
                "up/down source id mismatch: up id = {}, down id = {}",
                up.id(),
                down.id()
            )));
        }
        Ok(Self {
            id: up.id().to_string(),
            up,
            down,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Read both sides and checksum them.
    pub async fn contents(&self, cancel: &CancellationToken) -> Result<MigrationContents> {
        let up = self.up.contents(cancel).await?;
        let down = self.down.contents(cancel).await?;
        let checksum = compute_checksum(&up, &down);
        Ok(MigrationContents { up, down, checksum })
    }

    /// Check that `applied` records this exact pair.
    pub async fn validate_application(
        &self,
        cancel: &CancellationToken,
        applied: &AppliedMigration,
    ) -> Result<()> {
        let contents = self.contents(cancel).await?;
        if self.up.id() != applied.id || self.down.id() != applied.id {
            return Err(DbkitError::Integrity(format!(
                "applied migration id does not match source id: applied id = {}, up id = {}, down id = {}",
                applied.id,
                self.up.id(),
                self.down.id()
            )));
        }
        if contents.checksum != applied.checksum {
            return Err(DbkitError::Integrity(format!(
                "{} has been altered since it was last applied",
                applied.id
            )));
        }
        Ok(())
    }
}

/// Lowercase hex SHA-256 of the up contents followed by the down contents.
pub fn compute_checksum(up: &str, down: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(up.as_bytes());
    hasher.update(down.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_requires_matching_ids() {
        let pair = MigrationSource::new(Source::inline("0001_a", ""), Source::inline("0001_a", ""));
        assert_eq!(pair.unwrap().id(), "0001_a");

        let err = MigrationSource::new(Source::inline("0001_a", ""), Source::inline("0002_b", ""))
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_checksum_is_order_sensitive() {
        // sha256("")
        assert_eq!(
            compute_checksum("", ""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(compute_checksum("ab", "c"), compute_checksum("a", "bc"));
        assert_ne!(compute_checksum("up", "down"), compute_checksum("down", "up"));
    }

    #[tokio::test]
    async fn test_validate_application() {
        let cancel = CancellationToken::new();
        let pair =
            MigrationSource::new(Source::inline("0001_a", "CREATE"), Source::inline("0001_a", "DROP"))
                .unwrap();
        let contents = pair.contents(&cancel).await.unwrap();

        let applied = AppliedMigration::finished("0001_a", contents.checksum.clone());
        pair.validate_application(&cancel, &applied).await.unwrap();

        let tampered = AppliedMigration::finished("0001_a", "0000");
        let err = pair.validate_application(&cancel, &tampered).await.unwrap_err();
        assert!(err.to_string().contains("altered since it was last applied"));

        let other = AppliedMigration::finished("0002_b", contents.checksum);
        let err = pair.validate_application(&cancel, &other).await.unwrap_err();
        assert!(err.is_integrity());
    }
}
