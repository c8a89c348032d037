//! Storage and lookup port traits.
//! Implemented by parcel_postgres and by `memory`. Core logic depends only on these traits.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::context::{CachedLayer, CheckKind, LayerName, LayerObservation};
use crate::error::ParcelError;
use crate::evidence::EvidenceItem;
use crate::geometry::Geometry;
use crate::quality::QualityScore;
use crate::types::RuleDefinition;

pub type Result<T> = std::result::Result<T, ParcelError>;

/// Run a port call under a timeout; elapsed maps to [`ParcelError::Timeout`].
pub async fn bounded<T, F>(operation: &str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(ParcelError::timeout(operation, after)),
    }
}

// ── Rules ─────────────────────────────────────────────────────

/// Read model of regulation definitions, plus the ingestion write path.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Every definition recorded for the zone, regardless of validity.
    async fn rules_for_zone(&self, zone_id: &str) -> Result<Vec<RuleDefinition>>;

    /// Zone ids whose boundary intersects the geometry, in any order.
    async fn zones_intersecting(&self, geometry: &Geometry) -> Result<Vec<String>>;

    /// Insert a batch of definitions. Returns the number inserted.
    async fn insert_rules(&self, rules: &[RuleDefinition]) -> Result<usize>;

    /// Close a definition's validity window at `to` (inclusive).
    async fn close_validity(&self, rule_id: Uuid, to: NaiveDate) -> Result<()>;
}

// ── Context layers ────────────────────────────────────────────

/// Spatial lookup against one external constraint layer.
#[async_trait]
pub trait LayerProbe: Send + Sync {
    /// `Ok(None)` means the layer holds no feature worth reporting
    /// (no nearby feature, no raster coverage).
    async fn probe(
        &self,
        layer: LayerName,
        check: CheckKind,
        geometry: &Geometry,
    ) -> Result<Option<LayerObservation>>;
}

/// Per-(parcel, layer) cache of evaluated flags.
#[async_trait]
pub trait ContextCache: Send + Sync {
    async fn get(&self, parcel_id: &str, layer: LayerName) -> Result<Option<CachedLayer>>;

    async fn put(&self, parcel_id: &str, entry: CachedLayer) -> Result<()>;

    /// Drop entries computed before `cutoff`. Returns the number removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

// ── Evidence and quality ──────────────────────────────────────

#[async_trait]
pub trait EvidenceStore: Send + Sync {
    /// Upsert on `(ref_type, ref_id, field, parcel_id)`. Returns rows written.
    async fn upsert_batch(&self, items: &[EvidenceItem]) -> Result<usize>;

    /// Replace a parcel's evidence with `items` in one step, so rows from an
    /// earlier analysis that this one no longer derives do not linger.
    /// Returns rows written.
    async fn replace_parcel(&self, parcel_id: &str, items: &[EvidenceItem]) -> Result<usize>;

    async fn evidence_for_parcel(&self, parcel_id: &str) -> Result<Vec<EvidenceItem>>;

    /// Remove all evidence for a parcel. Returns the number removed.
    async fn purge_parcel(&self, parcel_id: &str) -> Result<u64>;

    /// Field names of `missing` evidence recorded since `since`, one entry per item.
    async fn missing_fields_since(&self, since: DateTime<Utc>) -> Result<Vec<String>>;
}

#[async_trait]
pub trait QualityStore: Send + Sync {
    /// Upsert on `(parcel_id, calc_date)`.
    async fn upsert_score(&self, score: &QualityScore) -> Result<()>;

    /// All scores for a parcel, oldest first.
    async fn history(&self, parcel_id: &str) -> Result<Vec<QualityScore>>;

    async fn scores_since(&self, since: NaiveDate) -> Result<Vec<QualityScore>>;
}

// ── Clock ─────────────────────────────────────────────────────

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
