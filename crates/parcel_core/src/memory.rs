//! In-memory implementations of every port.
//!
//! Used by tests and by the fixture backend of the CLI. Each store can be
//! told to fail so degraded paths can be exercised.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::context::{CachedLayer, CheckKind, LayerName, LayerObservation};
use crate::error::ParcelError;
use crate::evidence::{EvidenceItem, EvidenceLedger, Reliability};
use crate::geometry::Geometry;
use crate::ports::{
    Clock, ContextCache, EvidenceStore, LayerProbe, QualityStore, Result, RuleStore,
};
use crate::quality::QualityScore;
use crate::types::RuleDefinition;

fn unavailable(store: &str) -> ParcelError {
    ParcelError::Unavailable(format!("{store} is offline"))
}

// ── Clock ─────────────────────────────────────────────────────

/// Clock pinned to an instant; can be moved forward.
#[derive(Debug)]
pub struct FixedClock {
    millis: AtomicI64,
}

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(now.timestamp_millis()),
        }
    }

    /// Noon UTC on `date`.
    pub fn on(date: NaiveDate) -> Self {
        let noon = date.and_hms_opt(12, 0, 0).unwrap_or_default().and_utc();
        Self::at(noon)
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

// ── Rules ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryRuleStore {
    zones: Arc<RwLock<BTreeMap<String, Geometry>>>,
    rules: Arc<RwLock<Vec<RuleDefinition>>>,
    failing: AtomicBool,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_zone(&self, zone_id: impl Into<String>, boundary: Geometry) {
        self.zones.write().await.insert(zone_id.into(), boundary);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable("rule store"));
        }
        Ok(())
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn rules_for_zone(&self, zone_id: &str) -> Result<Vec<RuleDefinition>> {
        self.check()?;
        let rules = self.rules.read().await;
        Ok(rules.iter().filter(|r| r.zone_id == zone_id).cloned().collect())
    }

    async fn zones_intersecting(&self, geometry: &Geometry) -> Result<Vec<String>> {
        self.check()?;
        let zones = self.zones.read().await;
        Ok(zones
            .iter()
            .filter(|(_, boundary)| boundary.intersects(geometry))
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn insert_rules(&self, rules: &[RuleDefinition]) -> Result<usize> {
        self.check()?;
        let mut stored = self.rules.write().await;
        let existing: HashSet<Uuid> = stored.iter().map(|r| r.id).collect();
        if let Some(dup) = rules.iter().find(|r| existing.contains(&r.id)) {
            return Err(ParcelError::Conflict(format!("rule {} already exists", dup.id)));
        }
        stored.extend(rules.iter().cloned());
        Ok(rules.len())
    }

    async fn close_validity(&self, rule_id: Uuid, to: NaiveDate) -> Result<()> {
        self.check()?;
        let mut stored = self.rules.write().await;
        let rule = stored
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| ParcelError::NotFound(format!("rule {rule_id}")))?;
        if let Some(from) = rule.validity.from {
            if to < from {
                return Err(ParcelError::InvalidInput(format!(
                    "validity end {to} precedes start {from}"
                )));
            }
        }
        rule.validity.to = Some(to);
        Ok(())
    }
}

// ── Layers ────────────────────────────────────────────────────

/// One vector feature or raster cell of a context layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerFeature {
    pub geometry: Geometry,
    pub value_text: Option<String>,
    pub value_num: Option<f64>,
    pub metadata: serde_json::Value,
}

impl LayerFeature {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            value_text: None,
            value_num: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_text(mut self, value: impl Into<String>) -> Self {
        self.value_text = Some(value.into());
        self
    }

    pub fn with_num(mut self, value: f64) -> Self {
        self.value_num = Some(value);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    fn observe(&self, intersects: bool, distance_m: Option<f64>) -> LayerObservation {
        LayerObservation {
            intersects,
            value_text: self.value_text.clone(),
            value_num: self.value_num,
            distance_m,
            metadata: self.metadata.clone(),
        }
    }
}

/// Planar evaluation of layer features, with per-layer fault injection.
#[derive(Default)]
pub struct InMemoryLayerProbe {
    features: Arc<RwLock<HashMap<LayerName, Vec<LayerFeature>>>>,
    failing: Arc<RwLock<HashSet<LayerName>>>,
    delays: Arc<RwLock<HashMap<LayerName, Duration>>>,
}

impl InMemoryLayerProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_feature(&self, layer: LayerName, feature: LayerFeature) {
        self.features
            .write()
            .await
            .entry(layer)
            .or_default()
            .push(feature);
    }

    pub async fn fail_layer(&self, layer: LayerName) {
        self.failing.write().await.insert(layer);
    }

    pub async fn delay_layer(&self, layer: LayerName, delay: Duration) {
        self.delays.write().await.insert(layer, delay);
    }

    fn nearest<'a>(
        features: &'a [LayerFeature],
        geometry: &Geometry,
    ) -> Option<(&'a LayerFeature, f64)> {
        features
            .iter()
            .map(|f| (f, f.geometry.distance(geometry)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

#[async_trait]
impl LayerProbe for InMemoryLayerProbe {
    async fn probe(
        &self,
        layer: LayerName,
        check: CheckKind,
        geometry: &Geometry,
    ) -> Result<Option<LayerObservation>> {
        let delay = self.delays.read().await.get(&layer).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.read().await.contains(&layer) {
            return Err(unavailable(layer.as_str()));
        }

        let all = self.features.read().await;
        let Some(features) = all.get(&layer).filter(|f| !f.is_empty()) else {
            return Ok(None);
        };

        let observation = match check {
            // A zone the parcel does not touch is not a finding.
            CheckKind::Intersect => features
                .iter()
                .find(|f| f.geometry.intersects(geometry))
                .map(|hit| hit.observe(true, None)),
            CheckKind::Distance { .. } => Self::nearest(features, geometry)
                .map(|(f, d)| f.observe(d == 0.0, Some(d))),
            CheckKind::Raster => {
                let centroid = geometry.centroid();
                features
                    .iter()
                    .find(|f| f.geometry.contains_point(&centroid))
                    .map(|cell| cell.observe(true, None))
            }
        };
        Ok(observation)
    }
}

// ── Context cache ─────────────────────────────────────────────

/// Bounded cache; the oldest entry is evicted when full.
pub struct InMemoryContextCache {
    entries: Arc<RwLock<HashMap<(String, LayerName), CachedLayer>>>,
    capacity: usize,
    failing: AtomicBool,
}

impl InMemoryContextCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
            failing: AtomicBool::new(false),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable("context cache"));
        }
        Ok(())
    }
}

#[async_trait]
impl ContextCache for InMemoryContextCache {
    async fn get(&self, parcel_id: &str, layer: LayerName) -> Result<Option<CachedLayer>> {
        self.check()?;
        let entries = self.entries.read().await;
        Ok(entries.get(&(parcel_id.to_string(), layer)).cloned())
    }

    async fn put(&self, parcel_id: &str, entry: CachedLayer) -> Result<()> {
        self.check()?;
        let mut entries = self.entries.write().await;
        let key = (parcel_id.to_string(), entry.layer);
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.computed_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(key, entry);
        Ok(())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check()?;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.computed_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }
}

// ── Evidence and quality ──────────────────────────────────────

#[derive(Default)]
pub struct InMemoryEvidenceStore {
    ledger: Arc<RwLock<EvidenceLedger>>,
    failing: AtomicBool,
}

impl InMemoryEvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable("evidence store"));
        }
        Ok(())
    }
}

#[async_trait]
impl EvidenceStore for InMemoryEvidenceStore {
    async fn upsert_batch(&self, items: &[EvidenceItem]) -> Result<usize> {
        self.check()?;
        let mut ledger = self.ledger.write().await;
        ledger.extend(items.iter().cloned());
        Ok(items.len())
    }

    async fn replace_parcel(&self, parcel_id: &str, items: &[EvidenceItem]) -> Result<usize> {
        self.check()?;
        let mut ledger = self.ledger.write().await;
        ledger.remove_parcel(parcel_id);
        ledger.extend(items.iter().filter(|i| i.parcel_id == parcel_id).cloned());
        Ok(ledger.for_parcel(parcel_id).count())
    }

    async fn evidence_for_parcel(&self, parcel_id: &str) -> Result<Vec<EvidenceItem>> {
        self.check()?;
        let ledger = self.ledger.read().await;
        Ok(ledger.for_parcel(parcel_id).cloned().collect())
    }

    async fn purge_parcel(&self, parcel_id: &str) -> Result<u64> {
        self.check()?;
        Ok(self.ledger.write().await.remove_parcel(parcel_id) as u64)
    }

    async fn missing_fields_since(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        self.check()?;
        let ledger = self.ledger.read().await;
        Ok(ledger
            .items()
            .filter(|i| i.reliability == Reliability::Missing && i.recorded_at >= since)
            .map(|i| i.field.clone())
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryQualityStore {
    scores: Arc<RwLock<BTreeMap<(String, NaiveDate), QualityScore>>>,
    failing: AtomicBool,
}

impl InMemoryQualityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable("quality store"));
        }
        Ok(())
    }
}

#[async_trait]
impl QualityStore for InMemoryQualityStore {
    async fn upsert_score(&self, score: &QualityScore) -> Result<()> {
        self.check()?;
        self.scores
            .write()
            .await
            .insert((score.parcel_id.clone(), score.calc_date), score.clone());
        Ok(())
    }

    async fn history(&self, parcel_id: &str) -> Result<Vec<QualityScore>> {
        self.check()?;
        let scores = self.scores.read().await;
        Ok(scores
            .values()
            .filter(|s| s.parcel_id == parcel_id)
            .cloned()
            .collect())
    }

    async fn scores_since(&self, since: NaiveDate) -> Result<Vec<QualityScore>> {
        self.check()?;
        let scores = self.scores.read().await;
        let mut rows: Vec<_> = scores
            .values()
            .filter(|s| s.calc_date >= since)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.calc_date.cmp(&b.calc_date).then_with(|| a.parcel_id.cmp(&b.parcel_id)));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{LayerSpec, Severity};
    use serde_json::json;

    fn square(x0: f64, y0: f64, size: f64) -> Geometry {
        Geometry::parse_wkt(&format!(
            "POLYGON(({x0} {y0}, {x1} {y0}, {x1} {y1}, {x0} {y1}, {x0} {y0}))",
            x1 = x0 + size,
            y1 = y0 + size
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_probe_intersect_and_nearest() {
        let probe = InMemoryLayerProbe::new();
        probe
            .add_feature(
                LayerName::OpbNoise,
                LayerFeature::new(square(0.0, 0.0, 10.0)).with_text("DS III"),
            )
            .await;
        let hit = probe
            .probe(LayerName::OpbNoise, CheckKind::Intersect, &square(5.0, 5.0, 2.0))
            .await
            .unwrap()
            .unwrap();
        assert!(hit.intersects);
        assert_eq!(hit.value_text.as_deref(), Some("DS III"));

        let miss = probe
            .probe(LayerName::OpbNoise, CheckKind::Intersect, &square(40.0, 0.0, 5.0))
            .await
            .unwrap();
        assert!(miss.is_none());

        let nearest = probe
            .probe(
                LayerName::OpbNoise,
                CheckKind::Distance { threshold_m: 25.0 },
                &square(40.0, 0.0, 5.0),
            )
            .await
            .unwrap()
            .unwrap();
        assert!(!nearest.intersects);
        assert_eq!(nearest.distance_m, Some(30.0));

        let none = probe
            .probe(LayerName::OfacAirport, CheckKind::Intersect, &square(0.0, 0.0, 1.0))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_probe_raster_samples_centroid() {
        let probe = InMemoryLayerProbe::new();
        probe
            .add_feature(
                LayerName::SlopePct,
                LayerFeature::new(square(0.0, 0.0, 100.0)).with_num(38.0),
            )
            .await;
        let obs = probe
            .probe(LayerName::SlopePct, CheckKind::Raster, &square(10.0, 10.0, 20.0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(obs.value_num, Some(38.0));
        let outside = probe
            .probe(LayerName::SlopePct, CheckKind::Raster, &square(200.0, 0.0, 20.0))
            .await
            .unwrap();
        assert!(outside.is_none());
    }

    #[tokio::test]
    async fn test_cache_evicts_oldest_and_purges() {
        let cache = InMemoryContextCache::new(2);
        let flag = LayerSpec::table(25.0)[1].evaluate(LayerObservation {
            intersects: true,
            metadata: json!({}),
            ..Default::default()
        });
        assert_eq!(flag.severity, Severity::Warning);
        let t0 = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        for (i, parcel) in ["A", "B", "C"].iter().enumerate() {
            cache
                .put(
                    parcel,
                    CachedLayer {
                        layer: flag.layer,
                        flag: flag.clone(),
                        computed_at: t0 + chrono::Duration::days(i as i64),
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(cache.len().await, 2);
        assert!(cache.get("A", flag.layer).await.unwrap().is_none());
        let purged = cache
            .purge_older_than(t0 + chrono::Duration::days(2))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(cache.get("C", flag.layer).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_close_validity_rejects_inverted_window() {
        let store = InMemoryRuleStore::new();
        let mut rule = RuleDefinition::new(
            "Z1",
            crate::types::RegulatedField::HeightMax,
            crate::types::FieldValue::Number(10.0),
            crate::types::RuleLevel::CommunalZoning,
        );
        rule.validity.from = NaiveDate::from_ymd_opt(2024, 1, 1);
        let id = rule.id;
        store.insert_rules(&[rule.clone()]).await.unwrap();
        let err = store
            .close_validity(id, NaiveDate::from_ymd_opt(2023, 1, 1).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ParcelError::InvalidInput(_)));
        let dup = store.insert_rules(&[rule]).await.unwrap_err();
        assert!(matches!(dup, ParcelError::Conflict(_)));
        let missing = store
            .close_validity(Uuid::new_v4(), NaiveDate::from_ymd_opt(2025, 1, 1).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(missing, ParcelError::NotFound(_)));
    }

    #[test]
    fn test_fixed_clock_advances() {
        let clock = FixedClock::on(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        let start = clock.now();
        clock.advance(chrono::Duration::days(31));
        assert_eq!(clock.now() - start, chrono::Duration::days(31));
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2025, 2, 1).unwrap());
    }
}
