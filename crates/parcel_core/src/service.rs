//! ParcelAnalyzer: the pipeline entry points.
//!
//! Takes port traits via `Arc<dyn Port>` so the same logic runs against
//! Postgres or the in-memory stores. Rule and context resolution run
//! concurrently; the calculator follows the rules; the tracker runs last.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::calculator::{BuildCalculator, CalcOutput};
use crate::config::EngineConfig;
use crate::context::{ContextFlag, ContextResolution, ContextResolver, LayerName, LayerOutcome};
use crate::conversion::IbusConversion;
use crate::error::ParcelError;
use crate::geometry::Geometry;
use crate::ports::{
    bounded, Clock, ContextCache, EvidenceStore, LayerProbe, QualityStore, Result, RuleStore,
};
use crate::quality::{QualityReport, QualityScore};
use crate::rules::{RuleQuery, RuleResolver, ZoneResolution};
use crate::tracker::{AnalysisInputs, EvidenceTracker, PersistenceStatus, TrackOutcome};
use crate::types::ConsolidatedRule;

/// Every port the pipeline needs.
#[derive(Clone)]
pub struct AnalyzerPorts {
    pub rules: Arc<dyn RuleStore>,
    pub layers: Arc<dyn LayerProbe>,
    pub context_cache: Arc<dyn ContextCache>,
    pub evidence: Arc<dyn EvidenceStore>,
    pub quality: Arc<dyn QualityStore>,
    pub clock: Arc<dyn Clock>,
}

// ── Request / report ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub parcel_id: String,
    pub geometry_wkt: String,
    /// Known zone; when absent the zone is found from the geometry.
    #[serde(default)]
    pub zone_id: Option<String>,
    /// Parcel area; defaults to the planar area of the geometry.
    #[serde(default)]
    pub area_m2: Option<f64>,
    /// Budget for the context fan-out, measured from the start of the run.
    #[serde(default)]
    pub context_budget_ms: Option<u64>,
}

impl AnalysisRequest {
    pub fn new(parcel_id: impl Into<String>, geometry_wkt: impl Into<String>) -> Self {
        Self {
            parcel_id: parcel_id.into(),
            geometry_wkt: geometry_wkt.into(),
            zone_id: None,
            area_m2: None,
            context_budget_ms: None,
        }
    }

    pub fn with_zone(mut self, zone_id: impl Into<String>) -> Self {
        self.zone_id = Some(zone_id.into());
        self
    }

    pub fn with_area(mut self, area_m2: f64) -> Self {
        self.area_m2 = Some(area_m2);
        self
    }

    pub fn with_context_budget(mut self, budget: Duration) -> Self {
        self.context_budget_ms = Some(budget.as_millis() as u64);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaSource {
    Supplied,
    Geometry,
    /// No usable area; the calculator reports `INVALID_AREA`.
    Unavailable,
}

/// Parts of the run that fell back to partial results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DegradedSignals {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<LayerName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_persistence: Option<String>,
}

impl DegradedSignals {
    pub fn any(&self) -> bool {
        self.rules.is_some() || !self.context.is_empty() || self.evidence_persistence.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub parcel_id: String,
    pub zone_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tied_zones: Vec<String>,
    pub area_m2: Option<f64>,
    pub area_source: AreaSource,
    pub rules: Vec<ConsolidatedRule>,
    pub calc: CalcOutput,
    pub context: Vec<ContextFlag>,
    pub context_layers: Vec<LayerOutcome>,
    pub quality: QualityScore,
    pub evidence_count: usize,
    pub persistence: PersistenceStatus,
    pub degraded: DegradedSignals,
}

// ── Analyzer ──────────────────────────────────────────────────

pub struct ParcelAnalyzer {
    rules: RuleResolver,
    calculator: BuildCalculator,
    context: ContextResolver,
    tracker: EvidenceTracker,
    ports: AnalyzerPorts,
    config: EngineConfig,
}

impl ParcelAnalyzer {
    pub fn new(ports: AnalyzerPorts, config: EngineConfig) -> Self {
        Self {
            rules: RuleResolver::new(
                ports.rules.clone(),
                ports.clock.clone(),
                config.store_timeout(),
            ),
            calculator: BuildCalculator::default(),
            context: ContextResolver::new(
                ports.layers.clone(),
                ports.context_cache.clone(),
                ports.clock.clone(),
                &config,
            ),
            tracker: EvidenceTracker::new(
                ports.evidence.clone(),
                ports.quality.clone(),
                ports.clock.clone(),
                &config,
            ),
            ports,
            config,
        }
    }

    /// Swap the jurisdiction conversion table.
    pub fn with_conversion(mut self, conversion: Arc<dyn IbusConversion>) -> Self {
        self.calculator = BuildCalculator::new(conversion);
        self
    }

    pub fn with_inserted_by(mut self, inserted_by: impl Into<String>) -> Self {
        self.tracker = self.tracker.with_inserted_by(inserted_by);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Entry points ──────────────────────────────────────────

    pub async fn resolve_rules(&self, query: &RuleQuery) -> Result<ZoneResolution> {
        self.rules.resolve(query).await
    }

    pub fn compute_build_indicators(
        &self,
        parcel_area_m2: f64,
        rules: &[ConsolidatedRule],
    ) -> CalcOutput {
        self.calculator.compute(parcel_area_m2, rules)
    }

    pub async fn resolve_context(&self, parcel_id: &str, wkt: &str) -> Vec<ContextFlag> {
        self.context.resolve(parcel_id, wkt).await.flags
    }

    /// Like [`Self::resolve_context`], with per-layer outcomes.
    pub async fn resolve_context_detailed(
        &self,
        parcel_id: &str,
        wkt: &str,
        deadline: Option<tokio::time::Instant>,
    ) -> ContextResolution {
        self.context.resolve_until(parcel_id, wkt, deadline).await
    }

    pub async fn track_evidence_and_score(
        &self,
        parcel_id: &str,
        inputs: AnalysisInputs<'_>,
    ) -> TrackOutcome {
        self.tracker.track(parcel_id, inputs).await
    }

    /// Full pipeline. Upstream failures degrade the report; only invalid
    /// requests and non-recoverable store errors are returned as `Err`.
    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisReport> {
        let parcel_id = request.parcel_id.trim();
        if parcel_id.is_empty() {
            return Err(ParcelError::InvalidInput("parcel id is empty".into()));
        }

        let geometry_area = Geometry::parse_wkt(&request.geometry_wkt)
            .map(|g| g.area())
            .ok();
        let (area_m2, area_source) = match (request.area_m2, geometry_area) {
            (Some(area), _) => (Some(area), AreaSource::Supplied),
            (None, Some(area)) => (Some(area), AreaSource::Geometry),
            (None, None) => (None, AreaSource::Unavailable),
        };

        let query = match &request.zone_id {
            Some(zone_id) => RuleQuery::Zone(zone_id.clone()),
            None => RuleQuery::GeometryWkt(request.geometry_wkt.clone()),
        };
        let deadline = request
            .context_budget_ms
            .map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));

        let (rules, context) = tokio::join!(
            self.rules.resolve(&query),
            self.context
                .resolve_until(parcel_id, &request.geometry_wkt, deadline)
        );

        let mut degraded = DegradedSignals::default();
        let resolution = match rules {
            Ok(resolution) => resolution,
            Err(e) if e.is_degradable() => {
                warn!(parcel_id, error = %e, "rule resolution degraded");
                degraded.rules = Some(e.to_string());
                ZoneResolution {
                    zone_id: request.zone_id.clone(),
                    ..ZoneResolution::empty()
                }
            }
            Err(e) => return Err(e),
        };
        degraded.context = context.degraded_layers();

        let calc = self
            .calculator
            .compute(area_m2.unwrap_or(0.0), &resolution.rules);

        let tracked = self
            .tracker
            .track(
                parcel_id,
                AnalysisInputs {
                    zone_id: resolution.zone_id.as_deref(),
                    rules: &resolution.rules,
                    calc: &calc,
                    context: &context.flags,
                },
            )
            .await;
        degraded.evidence_persistence = tracked.persistence.error_summary();

        info!(
            parcel_id,
            zone_id = resolution.zone_id.as_deref().unwrap_or("-"),
            rules = resolution.rules.len(),
            flags = context.flags.len(),
            score = tracked.score.score_global,
            degraded = degraded.any(),
            "parcel analyzed"
        );

        Ok(AnalysisReport {
            parcel_id: parcel_id.to_string(),
            zone_id: resolution.zone_id,
            tied_zones: resolution.tied_zones,
            area_m2,
            area_source,
            rules: resolution.rules,
            calc,
            context: context.flags,
            context_layers: context.outcomes,
            quality: tracked.score,
            evidence_count: tracked.evidence.len(),
            persistence: tracked.persistence,
            degraded,
        })
    }

    // ── Maintenance and reporting ─────────────────────────────

    /// Drop cached context older than `days` (the configured TTL when `None`).
    pub async fn purge_context_cache(&self, days: Option<i64>) -> Result<u64> {
        let days = days.unwrap_or(self.config.context_cache_ttl_days);
        let cutoff = self.ports.clock.now() - chrono::Duration::days(days);
        let purged = bounded(
            "context_cache.purge_older_than",
            self.config.store_timeout(),
            self.ports.context_cache.purge_older_than(cutoff),
        )
        .await?;
        info!(purged, days, "context cache purged");
        Ok(purged)
    }

    pub async fn purge_evidence(&self, parcel_id: &str) -> Result<u64> {
        bounded(
            "evidence_store.purge_parcel",
            self.config.store_timeout(),
            self.ports.evidence.purge_parcel(parcel_id),
        )
        .await
    }

    pub async fn quality_history(&self, parcel_id: &str) -> Result<Vec<QualityScore>> {
        bounded(
            "quality_store.history",
            self.config.store_timeout(),
            self.ports.quality.history(parcel_id),
        )
        .await
    }

    /// Quality report over the last `days` days.
    pub async fn quality_report(&self, days: i64) -> Result<QualityReport> {
        let now = self.ports.clock.now();
        let since = now - chrono::Duration::days(days);
        let timeout = self.config.store_timeout();
        let (scores, missing) = tokio::try_join!(
            bounded(
                "quality_store.scores_since",
                timeout,
                self.ports.quality.scores_since(since.date_naive()),
            ),
            bounded(
                "evidence_store.missing_fields_since",
                timeout,
                self.ports.evidence.missing_fields_since(since),
            ),
        )?;
        Ok(QualityReport::build(&scores, &missing))
    }
}
