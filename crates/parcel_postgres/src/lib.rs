//! parcel_postgres: PostgreSQL/PostGIS adapters for the parcel_core ports.

use std::sync::Arc;

use sqlx::PgPool;

use parcel_core::ports::{Clock, ContextCache};
use parcel_core::service::AnalyzerPorts;

pub mod pool;
mod rows;
pub mod store;

pub use pool::{mask_database_url, ConnectionStats, DatabaseConfig, DatabaseManager};
pub use store::{PgContextCache, PgEvidenceStore, PgLayerProbe, PgQualityStore, PgRuleStore};

/// Every Postgres adapter over one pool.
#[derive(Clone)]
pub struct PgStores {
    pub rules: Arc<PgRuleStore>,
    pub layers: Arc<PgLayerProbe>,
    pub context_cache: Arc<PgContextCache>,
    pub evidence: Arc<PgEvidenceStore>,
    pub quality: Arc<PgQualityStore>,
}

impl PgStores {
    pub fn new(pool: PgPool) -> Self {
        Self {
            rules: Arc::new(PgRuleStore::new(pool.clone())),
            layers: Arc::new(PgLayerProbe::new(pool.clone())),
            context_cache: Arc::new(PgContextCache::new(pool.clone())),
            evidence: Arc::new(PgEvidenceStore::new(pool.clone())),
            quality: Arc::new(PgQualityStore::new(pool)),
        }
    }

    /// Ports backed entirely by Postgres.
    pub fn ports(&self, clock: Arc<dyn Clock>) -> AnalyzerPorts {
        self.ports_with_cache(clock, self.context_cache.clone())
    }

    /// Ports with a caller-supplied context cache (e.g. the in-memory one).
    pub fn ports_with_cache(
        &self,
        clock: Arc<dyn Clock>,
        context_cache: Arc<dyn ContextCache>,
    ) -> AnalyzerPorts {
        AnalyzerPorts {
            rules: self.rules.clone(),
            layers: self.layers.clone(),
            context_cache,
            evidence: self.evidence.clone(),
            quality: self.quality.clone(),
            clock,
        }
    }
}
