//! Wiring of concrete ports: a YAML fixture in memory, or Postgres.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use parcel_core::fixture::{FixtureParcel, FixtureSet};
use parcel_core::ports::{Clock, SystemClock};
use parcel_core::service::ParcelAnalyzer;

use crate::config::AppConfig;
#[cfg(feature = "database")]
use crate::config::ContextCacheBackend;

/// A ready analyzer plus any parcels the backend knows by id.
pub struct Backend {
    pub analyzer: ParcelAnalyzer,
    pub fixture: Option<FixtureSet>,
}

impl Backend {
    /// Parcel geometry and area known to the fixture, if any.
    pub fn known_parcel(&self, parcel_id: &str) -> Option<&FixtureParcel> {
        self.fixture.as_ref().and_then(|f| f.parcel(parcel_id))
    }
}

/// In-memory stores seeded from a fixture file.
pub async fn from_fixture(path: &Path, config: &AppConfig) -> Result<Backend> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading fixture {}", path.display()))?;
    let fixture = FixtureSet::from_yaml_str(&raw)?;
    let stores = fixture
        .seed(config.engine.memory_cache_capacity)
        .await
        .context("seeding fixture stores")?;
    info!(
        fixture = %path.display(),
        zones = fixture.zones.len(),
        rules = fixture.rules.len(),
        parcels = fixture.parcels.len(),
        "fixture backend ready"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let analyzer = ParcelAnalyzer::new(stores.ports(clock), config.engine.clone());
    Ok(Backend {
        analyzer,
        fixture: Some(fixture),
    })
}

/// Postgres-backed stores.
#[cfg(feature = "database")]
pub async fn from_database(config: &AppConfig) -> Result<Backend> {
    use parcel_core::memory::InMemoryContextCache;
    use parcel_postgres::{DatabaseManager, PgStores};

    let manager = DatabaseManager::new(&config.database)
        .await
        .with_context(|| format!("connecting to {}", config.database.masked_url()))?;
    let stores = PgStores::new(manager.pool().clone());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let ports = match config.context_cache {
        ContextCacheBackend::Postgres => stores.ports(clock),
        ContextCacheBackend::Memory => stores.ports_with_cache(
            clock,
            Arc::new(InMemoryContextCache::new(config.engine.memory_cache_capacity)),
        ),
    };
    info!(stats = %manager.connection_stats(), cache = ?config.context_cache, "database backend ready");

    Ok(Backend {
        analyzer: ParcelAnalyzer::new(ports, config.engine.clone()),
        fixture: None,
    })
}

/// Fixture when given, else the database.
pub async fn connect(fixture: Option<&Path>, config: &AppConfig) -> Result<Backend> {
    match fixture {
        Some(path) => from_fixture(path, config).await,
        #[cfg(feature = "database")]
        None => from_database(config).await,
        #[cfg(not(feature = "database"))]
        None => anyhow::bail!("no --fixture given and the `database` feature is not enabled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FIXTURE: &str = r#"
zones:
  - id: Z1
    boundary: "POLYGON((0 0, 100 0, 100 100, 0 100, 0 0))"
rules:
  - zone_id: Z1
    field: indice_u
    value: 0.6
    level: LEVEL3
parcels:
  - id: P1
    geometry: "POLYGON((10 10, 30 10, 30 40, 10 40, 10 10))"
"#;

    #[tokio::test]
    async fn test_fixture_backend_analyzes_known_parcel() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FIXTURE.as_bytes()).unwrap();

        let backend = from_fixture(file.path(), &AppConfig::default()).await.unwrap();
        let parcel = backend.known_parcel("P1").unwrap().clone();
        let report = backend
            .analyzer
            .analyze(parcel_core::AnalysisRequest::new(parcel.id, parcel.geometry))
            .await
            .unwrap();
        assert_eq!(report.zone_id.as_deref(), Some("Z1"));
        assert_eq!(report.calc.su_m2, Some(360.0));
    }

    #[tokio::test]
    async fn test_missing_fixture_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = from_fixture(&dir.path().join("nope.yaml"), &AppConfig::default()).await;
        assert!(result.is_err());
    }
}
