//! Registries populated with the built-in drivers.

use dbkit_core::error::Result;
use dbkit_core::registry::{DatabaseRegistry, SourceRegistry};

use crate::db::PostgresDatabase;
use crate::source::FsStore;

/// Database registry with `pg`.
pub fn default_databases() -> Result<DatabaseRegistry> {
    let mut registry = DatabaseRegistry::databases();
    PostgresDatabase::register(&mut registry)?;
    Ok(registry)
}

/// Source registry with `fs`.
pub fn default_sources() -> Result<SourceRegistry> {
    let mut registry = SourceRegistry::sources();
    FsStore::register(&mut registry)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registries() {
        assert_eq!(default_databases().unwrap().names(), vec!["pg"]);
        assert_eq!(default_sources().unwrap().names(), vec!["fs"]);
    }
}
