//! Schema provisioning command.

use anyhow::{Context, Result};
use ticksink_core::store::{open_factory, ComponentRegistry};
use ticksink_core::Config;
use tracing::info;

/// Create every missing table in the configured store.
pub async fn init(config: Config) -> Result<()> {
    let factory = open_factory(&config.store);
    let target = factory.describe();
    info!(store = %target, "Provisioning schema");

    println!("Provisioning schema...");
    println!("  Store: {}", target);

    let (created, tables) = tokio::task::spawn_blocking(move || -> ticksink_core::Result<_> {
        let registry = ComponentRegistry::standard();
        let mut conn = factory.connect()?;
        let created = conn.provision_schema(&registry)?;
        conn.verify_schema(&registry)?;
        Ok((created, registry.tables().len()))
    })
    .await
    .context("schema task failed")??;

    println!();
    println!("Schema ready:");
    println!("  Tables created: {}", created);
    println!("  Component tables: {}", tables);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ticksink_core::config::StoreBackend;

    #[tokio::test]
    async fn test_init_provisions_sqlite_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.store.backend = StoreBackend::Sqlite;
        config.store.path = dir.path().join("ticks.db");

        init(config.clone()).await.unwrap();

        let mut conn = open_factory(&config.store).connect().unwrap();
        assert!(conn
            .missing_tables(&ComponentRegistry::standard())
            .unwrap()
            .is_empty());
        // Second run is a no-op
        init(config).await.unwrap();
    }
}
