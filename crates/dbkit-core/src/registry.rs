//! Driver registries mapping configured driver names to factories.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cancel;
use crate::config::{DbkitConfig, DriverConfig, GlobalConfig};
use crate::driver::Database;
use crate::error::{DbkitError, Result};
use crate::source::Store;

/// Type alias for a boxed driver factory.
pub type DriverFactory<T> = Arc<
    dyn Fn(DriverConfig, GlobalConfig, CancellationToken) -> BoxFuture<'static, Result<Arc<T>>>
        + Send
        + Sync,
>;

/// Registry of drivers producing `T`.
pub struct DriverRegistry<T: ?Sized> {
    kind: &'static str,
    drivers: HashMap<String, DriverFactory<T>>,
}

/// Database drivers, e.g. `pg`.
pub type DatabaseRegistry = DriverRegistry<dyn Database>;

/// Source drivers, e.g. `fs`.
pub type SourceRegistry = DriverRegistry<dyn Store>;

impl<T: ?Sized + Send + Sync + 'static> DriverRegistry<T> {
    /// Create an empty registry. `kind` names the driver family in errors.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            drivers: HashMap::new(),
        }
    }

    /// Register a driver factory under `name`.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(DriverConfig, GlobalConfig, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<T>>> + Send + 'static,
    {
        let name = name.into();
        if self.drivers.contains_key(&name) {
            return Err(DbkitError::DriverAlreadyRegistered {
                kind: self.kind,
                name,
            });
        }

        let factory: DriverFactory<T> = Arc::new(
            move |driver: DriverConfig,
                  global: GlobalConfig,
                  cancel: CancellationToken|
                  -> BoxFuture<'static, Result<Arc<T>>> {
                Box::pin(factory(driver, global, cancel))
            },
        );
        debug!(kind = self.kind, driver = %name, "Driver registered");
        self.drivers.insert(name, factory);
        Ok(())
    }

    /// Check whether a driver is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.drivers.contains_key(name)
    }

    /// Registered driver names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Instantiate the driver a definition names.
    pub async fn open(
        &self,
        cancel: &CancellationToken,
        driver: &DriverConfig,
        global: &GlobalConfig,
    ) -> Result<Arc<T>> {
        cancel::check(cancel)?;
        let factory = self
            .drivers
            .get(&driver.driver)
            .ok_or_else(|| DbkitError::UnknownDriver {
                kind: self.kind,
                name: driver.driver.clone(),
            })?;
        factory(driver.clone(), global.clone(), cancel.clone()).await
    }

    /// Look `target` up in `definitions` and instantiate it.
    pub async fn open_target(
        &self,
        cancel: &CancellationToken,
        definitions: &HashMap<String, DriverConfig>,
        target: &str,
        global: &GlobalConfig,
    ) -> Result<Arc<T>> {
        let definition = definitions.get(target).ok_or_else(|| {
            DbkitError::Config(format!("{} definition missing: '{}'", self.kind, target))
        })?;
        self.open(cancel, definition, global).await
    }
}

impl DriverRegistry<dyn Database> {
    pub fn databases() -> Self {
        Self::new("database")
    }

    /// Open the database definition named `target`.
    pub async fn open_database(
        &self,
        cancel: &CancellationToken,
        config: &DbkitConfig,
        target: &str,
    ) -> Result<Arc<dyn Database>> {
        self.open_target(cancel, &config.databases, target, &config.global)
            .await
    }
}

impl DriverRegistry<dyn Store> {
    pub fn sources() -> Self {
        Self::new("source")
    }

    /// Open the source definition named `target`.
    pub async fn open_store(
        &self,
        cancel: &CancellationToken,
        config: &DbkitConfig,
        target: &str,
    ) -> Result<Arc<dyn Store>> {
        self.open_target(cancel, &config.sources, target, &config.global)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Named: Send + Sync {
        fn name(&self) -> String;
    }

    struct Fixed(String);

    impl Named for Fixed {
        fn name(&self) -> String {
            self.0.clone()
        }
    }

    fn registry() -> DriverRegistry<dyn Named> {
        let mut registry = DriverRegistry::<dyn Named>::new("test");
        registry
            .register("fixed", |cfg: DriverConfig, _global, _cancel| async move {
                let name = cfg.string("name")?.to_string();
                Ok::<_, DbkitError>(Arc::new(Fixed(name)) as Arc<dyn Named>)
            })
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_open_registered_driver() {
        let registry = registry();
        let cancel = CancellationToken::new();
        let cfg = DriverConfig::new("fixed").with("name", "alpha");

        let driver = registry
            .open(&cancel, &cfg, &GlobalConfig::default())
            .await
            .unwrap();
        assert_eq!(driver.name(), "alpha");
        assert_eq!(registry.names(), vec!["fixed"]);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = registry();
        let err = registry
            .register("fixed", |_cfg, _global, _cancel| async move {
                Ok::<_, DbkitError>(Arc::new(Fixed("other".into())) as Arc<dyn Named>)
            })
            .unwrap_err();
        assert!(matches!(err, DbkitError::DriverAlreadyRegistered { .. }));
    }

    #[tokio::test]
    async fn test_unknown_driver() {
        let registry = registry();
        let cancel = CancellationToken::new();
        let err = registry
            .open(&cancel, &DriverConfig::new("nope"), &GlobalConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DbkitError::UnknownDriver { .. }));
    }

    #[tokio::test]
    async fn test_missing_target_definition() {
        let registry = registry();
        let cancel = CancellationToken::new();
        let err = registry
            .open_target(&cancel, &HashMap::new(), "local", &GlobalConfig::default())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("definition missing: 'local'"));
    }

    #[tokio::test]
    async fn test_open_respects_cancellation() {
        let registry = registry();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let cfg = DriverConfig::new("fixed").with("name", "alpha");
        let err = registry
            .open(&cancel, &cfg, &GlobalConfig::default())
            .await
            .err()
            .unwrap();
        assert!(err.is_cancelled());
    }
}
