//! Spatial context resolution.
//!
//! A fixed, table-driven set of constraint layers is evaluated against the
//! parcel geometry. Each layer lookup runs concurrently under its own
//! timeout; a failing or late layer contributes no flag and the rest of the
//! resolution still succeeds. Results are cached per `(parcel, layer)`.

#![allow(clippy::should_implement_trait)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, IntoEnumIterator};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::evidence::Reliability;
use crate::geometry::Geometry;
use crate::ports::{bounded, Clock, ContextCache, LayerProbe};

// ── Layers ────────────────────────────────────────────────────

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LayerName {
    OpbNoise,
    OfacAirport,
    RiskNat,
    RoadsCantonal,
    SlopePct,
}

impl LayerName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpbNoise => "opb_noise",
            Self::OfacAirport => "ofac_airport",
            Self::RiskNat => "risk_nat",
            Self::RoadsCantonal => "roads_cantonal",
            Self::SlopePct => "slope_pct",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::iter().find(|l| l.as_str() == s)
    }
}

impl PartialOrd for LayerName {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Lexicographic on the layer name, the deterministic tie-break for flags.
impl Ord for LayerName {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_str().cmp(other.as_str())
    }
}

/// How a layer is evaluated against the parcel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckKind {
    /// Boolean intersection plus an attribute value.
    Intersect,
    /// Nearest-feature distance; below `threshold_m` severity escalates.
    Distance { threshold_m: f64 },
    /// Continuous value sampled from a raster.
    Raster,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intersect => "intersect",
            Self::Distance { .. } => "distance",
            Self::Raster => "raster",
        }
    }

    /// Distance measurement is itself a derived computation.
    pub fn evidence_reliability(&self) -> Reliability {
        match self {
            Self::Distance { .. } => Reliability::Derived,
            Self::Intersect | Self::Raster => Reliability::Direct,
        }
    }
}

// ── Flags ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Severity {
    Info = 1,
    Warning = 2,
    Critical = 3,
}

impl From<Severity> for u8 {
    fn from(s: Severity) -> u8 {
        s as u8
    }
}

impl TryFrom<u8> for Severity {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Info),
            2 => Ok(Self::Warning),
            3 => Ok(Self::Critical),
            other => Err(format!("severity must be 1..=3, got {other}")),
        }
    }
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Raw answer of a layer probe before severity rules apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerObservation {
    pub intersects: bool,
    #[serde(default)]
    pub value_text: Option<String>,
    #[serde(default)]
    pub value_num: Option<f64>,
    /// Nearest-feature distance in metres, when measured.
    #[serde(default)]
    pub distance_m: Option<f64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// One environmental finding for a parcel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextFlag {
    pub layer: LayerName,
    pub intersects: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_num: Option<f64>,
    /// Metres; only set when not intersecting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub check: CheckKind,
    pub source_path: String,
}

impl ContextFlag {
    /// Kept when intersecting. Distance and raster findings are also kept
    /// when closer than `max_distance_m`; an intersect layer never is.
    pub fn is_retained(&self, max_distance_m: f64) -> bool {
        if self.intersects {
            return true;
        }
        match self.check {
            CheckKind::Intersect => false,
            CheckKind::Distance { .. } | CheckKind::Raster => {
                self.distance.is_some_and(|d| d < max_distance_m)
            }
        }
    }
}

/// Cached evaluation of one layer for one parcel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedLayer {
    pub layer: LayerName,
    pub flag: ContextFlag,
    pub computed_at: DateTime<Utc>,
}

/// Severity descending, then layer name ascending.
pub fn sort_flags(flags: &mut [ContextFlag]) {
    flags.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.layer.cmp(&b.layer)));
}

// ── Layer table ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerSpec {
    pub layer: LayerName,
    pub check: CheckKind,
}

fn meta_str<'a>(obs: &'a LayerObservation, key: &str) -> Option<&'a str> {
    obs.metadata.get(key).and_then(|v| v.as_str())
}

impl LayerSpec {
    /// The five layers, with the road threshold taken from configuration.
    pub fn table(road_threshold_m: f64) -> Vec<LayerSpec> {
        vec![
            LayerSpec {
                layer: LayerName::OpbNoise,
                check: CheckKind::Intersect,
            },
            LayerSpec {
                layer: LayerName::OfacAirport,
                check: CheckKind::Intersect,
            },
            LayerSpec {
                layer: LayerName::RiskNat,
                check: CheckKind::Intersect,
            },
            LayerSpec {
                layer: LayerName::RoadsCantonal,
                check: CheckKind::Distance {
                    threshold_m: road_threshold_m,
                },
            },
            LayerSpec {
                layer: LayerName::SlopePct,
                check: CheckKind::Raster,
            },
        ]
    }

    pub fn severity(&self, obs: &LayerObservation) -> Severity {
        match (self.layer, self.check) {
            (LayerName::OpbNoise, _) => match obs.value_text.as_deref() {
                Some("DS IV") | Some("DS V") => Severity::Critical,
                Some("DS III") => Severity::Warning,
                _ => Severity::Info,
            },
            (LayerName::OfacAirport, _) => Severity::Warning,
            (LayerName::RiskNat, _) => match meta_str(obs, "danger_level") {
                Some("fort") | Some("tres_fort") => Severity::Critical,
                Some("moyen") => Severity::Warning,
                _ => Severity::Info,
            },
            (_, CheckKind::Distance { threshold_m }) => {
                let distance = if obs.intersects {
                    0.0
                } else {
                    obs.distance_m.unwrap_or(f64::INFINITY)
                };
                if distance < threshold_m {
                    Severity::Warning
                } else {
                    Severity::Info
                }
            }
            (_, _) => match obs.value_num {
                Some(slope) if slope > 45.0 => Severity::Critical,
                Some(slope) if slope > 30.0 => Severity::Warning,
                _ => Severity::Info,
            },
        }
    }

    pub fn message(&self, obs: &LayerObservation) -> String {
        match self.layer {
            LayerName::OpbNoise => {
                format!("noise zone {}", obs.value_text.as_deref().unwrap_or("OPB"))
            }
            LayerName::OfacAirport => "airport safety zone (OFAC)".to_string(),
            LayerName::RiskNat => {
                let hazard = meta_str(obs, "hazard_type").unwrap_or("natural");
                let level = meta_str(obs, "danger_level").unwrap_or_default();
                format!("{hazard} hazard zone {level}").trim().to_string()
            }
            LayerName::RoadsCantonal => match obs.distance_m {
                Some(d) if !obs.intersects => format!("cantonal road at {}m", d.round()),
                _ => "parcel touches a cantonal road".to_string(),
            },
            LayerName::SlopePct => {
                format!("average slope {}%", obs.value_num.unwrap_or(0.0).round())
            }
        }
    }

    pub fn source_path(&self, obs: &LayerObservation) -> String {
        match self.layer {
            LayerName::OpbNoise => format!(
                "OPB/cadastre_bruit/{}",
                obs.value_text.as_deref().unwrap_or("zone")
            ),
            LayerName::OfacAirport => "OFAC/PSIA/zone_securite".to_string(),
            LayerName::RiskNat => format!(
                "SIT_VS/dangers_naturels/{}/{}",
                meta_str(obs, "hazard_type").unwrap_or("zone"),
                meta_str(obs, "danger_level").unwrap_or("unrated")
            ),
            LayerName::RoadsCantonal => format!(
                "SIT_VS/routes_cantonales/distance/{}m",
                obs.distance_m.unwrap_or(0.0).round()
            ),
            LayerName::SlopePct => format!(
                "swissALTI3D/slope_analysis/{}pct",
                obs.value_num.unwrap_or(0.0).round()
            ),
        }
    }

    pub fn evaluate(&self, obs: LayerObservation) -> ContextFlag {
        let severity = self.severity(&obs);
        let message = self.message(&obs);
        let source_path = self.source_path(&obs);
        ContextFlag {
            layer: self.layer,
            intersects: obs.intersects,
            value_text: obs.value_text,
            value_num: obs.value_num,
            distance: if obs.intersects { None } else { obs.distance_m },
            severity,
            message,
            metadata: obs.metadata,
            check: self.check,
            source_path,
        }
    }
}

// ── Resolver ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum LayerStatus {
    Evaluated,
    Cached,
    /// The layer had nothing to report.
    NoData,
    Failed(String),
    TimedOut,
}

impl LayerStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::TimedOut)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerOutcome {
    pub layer: LayerName,
    pub status: LayerStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextResolution {
    /// Retained flags, sorted and capped.
    pub flags: Vec<ContextFlag>,
    /// One entry per layer, in layer-name order.
    pub outcomes: Vec<LayerOutcome>,
}

impl ContextResolution {
    pub fn is_degraded(&self) -> bool {
        self.outcomes.iter().any(|o| o.status.is_degraded())
    }

    pub fn degraded_layers(&self) -> Vec<LayerName> {
        self.outcomes
            .iter()
            .filter(|o| o.status.is_degraded())
            .map(|o| o.layer)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub layer_timeout: Duration,
    pub cache_ttl: chrono::Duration,
    pub max_flags: usize,
    pub retention_distance_m: f64,
}

impl From<&EngineConfig> for ContextSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            layer_timeout: config.layer_timeout(),
            cache_ttl: config.context_cache_ttl(),
            max_flags: config.context_max_flags,
            retention_distance_m: config.context_retention_distance_m,
        }
    }
}

pub struct ContextResolver {
    probe: Arc<dyn LayerProbe>,
    cache: Arc<dyn ContextCache>,
    clock: Arc<dyn Clock>,
    layers: Vec<LayerSpec>,
    settings: ContextSettings,
}

impl ContextResolver {
    pub fn new(
        probe: Arc<dyn LayerProbe>,
        cache: Arc<dyn ContextCache>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            probe,
            cache,
            clock,
            layers: LayerSpec::table(config.road_distance_threshold_m),
            settings: ContextSettings::from(config),
        }
    }

    pub fn layers(&self) -> &[LayerSpec] {
        &self.layers
    }

    pub fn layer_spec(&self, layer: LayerName) -> Option<&LayerSpec> {
        self.layers.iter().find(|s| s.layer == layer)
    }

    pub async fn resolve(&self, parcel_id: &str, wkt: &str) -> ContextResolution {
        self.resolve_until(parcel_id, wkt, None).await
    }

    /// Evaluate every layer concurrently. When `deadline` passes, outstanding
    /// lookups are dropped and reported as timed out.
    pub async fn resolve_until(
        &self,
        parcel_id: &str,
        wkt: &str,
        deadline: Option<tokio::time::Instant>,
    ) -> ContextResolution {
        let geometry = match Geometry::parse_wkt(wkt) {
            Ok(g) => g,
            Err(e) => {
                warn!(parcel_id, error = %e, "context resolution skipped: unusable geometry");
                return ContextResolution::default();
            }
        };
        self.resolve_parsed(parcel_id, &geometry, deadline).await
    }

    pub async fn resolve_parsed(
        &self,
        parcel_id: &str,
        geometry: &Geometry,
        deadline: Option<tokio::time::Instant>,
    ) -> ContextResolution {
        let mut pending: FuturesUnordered<_> = self
            .layers
            .iter()
            .map(|spec| self.evaluate_layer(parcel_id, spec, geometry))
            .collect();

        let mut completed: Vec<(LayerOutcome, Option<ContextFlag>)> = Vec::new();
        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, pending.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(
                            parcel_id,
                            outstanding = pending.len(),
                            "context deadline reached; dropping outstanding layers"
                        );
                        break;
                    }
                },
                None => pending.next().await,
            };
            match next {
                Some(result) => completed.push(result),
                None => break,
            }
        }
        drop(pending);

        let done: BTreeSet<LayerName> = completed.iter().map(|(o, _)| o.layer).collect();
        for spec in &self.layers {
            if !done.contains(&spec.layer) {
                completed.push((
                    LayerOutcome {
                        layer: spec.layer,
                        status: LayerStatus::TimedOut,
                    },
                    None,
                ));
            }
        }

        let mut outcomes = Vec::with_capacity(completed.len());
        let mut flags = Vec::new();
        for (outcome, flag) in completed {
            outcomes.push(outcome);
            if let Some(flag) = flag {
                if flag.is_retained(self.settings.retention_distance_m) {
                    flags.push(flag);
                }
            }
        }
        outcomes.sort_by(|a, b| a.layer.cmp(&b.layer));
        sort_flags(&mut flags);
        flags.truncate(self.settings.max_flags);

        ContextResolution { flags, outcomes }
    }

    async fn evaluate_layer(
        &self,
        parcel_id: &str,
        spec: &LayerSpec,
        geometry: &Geometry,
    ) -> (LayerOutcome, Option<ContextFlag>) {
        let layer = spec.layer;
        let outcome = |status| LayerOutcome { layer, status };

        if let Some(flag) = self.cached(parcel_id, layer).await {
            debug!(parcel_id, layer = %layer, "context cache hit");
            return (outcome(LayerStatus::Cached), Some(flag));
        }

        let probe = bounded(
            layer.as_str(),
            self.settings.layer_timeout,
            self.probe.probe(layer, spec.check, geometry),
        )
        .await;

        match probe {
            Ok(Some(obs)) => {
                let flag = spec.evaluate(obs);
                let entry = CachedLayer {
                    layer,
                    flag: flag.clone(),
                    computed_at: self.clock.now(),
                };
                let put = bounded(
                    "context_cache.put",
                    self.settings.layer_timeout,
                    self.cache.put(parcel_id, entry),
                )
                .await;
                if let Err(e) = put {
                    warn!(parcel_id, layer = %layer, error = %e, "context cache write failed");
                }
                (outcome(LayerStatus::Evaluated), Some(flag))
            }
            Ok(None) => (outcome(LayerStatus::NoData), None),
            Err(crate::error::ParcelError::Timeout { .. }) => {
                warn!(parcel_id, layer = %layer, "context layer timed out");
                (outcome(LayerStatus::TimedOut), None)
            }
            Err(e) => {
                warn!(parcel_id, layer = %layer, error = %e, "context layer failed");
                (outcome(LayerStatus::Failed(e.to_string())), None)
            }
        }
    }

    /// Fresh cached flag, if any. Cache errors count as a miss.
    async fn cached(&self, parcel_id: &str, layer: LayerName) -> Option<ContextFlag> {
        let hit = bounded(
            "context_cache.get",
            self.settings.layer_timeout,
            self.cache.get(parcel_id, layer),
        )
        .await;
        match hit {
            Ok(Some(entry)) if self.clock.now() - entry.computed_at < self.settings.cache_ttl => {
                Some(entry.flag)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(parcel_id, layer = %layer, error = %e, "context cache read failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(layer: LayerName) -> LayerSpec {
        LayerSpec::table(25.0)
            .into_iter()
            .find(|s| s.layer == layer)
            .unwrap()
    }

    fn intersecting() -> LayerObservation {
        LayerObservation {
            intersects: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_layer_name_ordering_is_lexicographic() {
        let mut layers: Vec<_> = LayerName::iter().collect();
        layers.sort();
        let names: Vec<_> = layers.iter().map(|l| l.as_str()).collect();
        assert_eq!(
            names,
            vec!["ofac_airport", "opb_noise", "risk_nat", "roads_cantonal", "slope_pct"]
        );
        assert_eq!(LayerName::from_str("risk_nat"), Some(LayerName::RiskNat));
        assert_eq!(LayerName::RoadsCantonal.to_string(), "roads_cantonal");
    }

    #[test]
    fn test_noise_severity() {
        let s = spec(LayerName::OpbNoise);
        for (ds, expected) in [
            ("DS IV", Severity::Critical),
            ("DS V", Severity::Critical),
            ("DS III", Severity::Warning),
            ("DS II", Severity::Info),
        ] {
            let obs = LayerObservation {
                value_text: Some(ds.into()),
                ..intersecting()
            };
            assert_eq!(s.severity(&obs), expected, "{ds}");
        }
        let flag = s.evaluate(LayerObservation {
            value_text: Some("DS III".into()),
            ..intersecting()
        });
        assert_eq!(flag.source_path, "OPB/cadastre_bruit/DS III");
    }

    #[test]
    fn test_hazard_severity_and_message() {
        let s = spec(LayerName::RiskNat);
        let obs = LayerObservation {
            metadata: json!({"danger_level": "fort", "hazard_type": "avalanche"}),
            ..intersecting()
        };
        let flag = s.evaluate(obs);
        assert_eq!(flag.severity, Severity::Critical);
        assert_eq!(flag.message, "avalanche hazard zone fort");
        assert_eq!(flag.source_path, "SIT_VS/dangers_naturels/avalanche/fort");

        let obs = LayerObservation {
            metadata: json!({"danger_level": "moyen"}),
            ..intersecting()
        };
        assert_eq!(s.severity(&obs), Severity::Warning);
    }

    #[test]
    fn test_road_distance_threshold() {
        let s = spec(LayerName::RoadsCantonal);
        let near = LayerObservation {
            distance_m: Some(12.4),
            ..Default::default()
        };
        let far = LayerObservation {
            distance_m: Some(60.0),
            ..Default::default()
        };
        let flag = s.evaluate(near);
        assert_eq!(flag.severity, Severity::Warning);
        assert_eq!(flag.distance, Some(12.4));
        assert_eq!(flag.source_path, "SIT_VS/routes_cantonales/distance/12m");
        assert_eq!(s.evaluate(far).severity, Severity::Info);
    }

    #[test]
    fn test_slope_buckets() {
        let s = spec(LayerName::SlopePct);
        let at = |v: f64| LayerObservation {
            value_num: Some(v),
            ..intersecting()
        };
        assert_eq!(s.severity(&at(50.0)), Severity::Critical);
        assert_eq!(s.severity(&at(45.0)), Severity::Warning);
        assert_eq!(s.severity(&at(31.0)), Severity::Warning);
        assert_eq!(s.severity(&at(30.0)), Severity::Info);
        assert_eq!(s.evaluate(at(37.6)).source_path, "swissALTI3D/slope_analysis/38pct");
    }

    #[test]
    fn test_retention() {
        let s = spec(LayerName::RoadsCantonal);
        let flag = |d: f64| {
            s.evaluate(LayerObservation {
                distance_m: Some(d),
                ..Default::default()
            })
        };
        assert!(flag(99.9).is_retained(100.0));
        assert!(!flag(100.0).is_retained(100.0));
        assert!(spec(LayerName::OfacAirport)
            .evaluate(intersecting())
            .is_retained(100.0));
    }

    #[test]
    fn test_nearby_zone_outside_parcel_is_not_retained() {
        let near_miss = spec(LayerName::RiskNat).evaluate(LayerObservation {
            intersects: false,
            distance_m: Some(30.0),
            metadata: json!({"danger_level": "fort", "hazard_type": "avalanche"}),
            ..Default::default()
        });
        assert!(!near_miss.is_retained(100.0));

        let airport = spec(LayerName::OfacAirport).evaluate(LayerObservation {
            distance_m: Some(99.0),
            ..Default::default()
        });
        assert!(!airport.is_retained(100.0));
    }

    #[test]
    fn test_intersecting_flag_has_no_distance() {
        let flag = spec(LayerName::RoadsCantonal).evaluate(LayerObservation {
            intersects: true,
            distance_m: Some(0.0),
            ..Default::default()
        });
        assert_eq!(flag.distance, None);
        assert_eq!(flag.severity, Severity::Warning);
    }

    #[test]
    fn test_severity_serializes_as_integer() {
        assert_eq!(serde_json::to_value(Severity::Critical).unwrap(), json!(3));
        let s: Severity = serde_json::from_value(json!(2)).unwrap();
        assert_eq!(s, Severity::Warning);
        assert!(serde_json::from_value::<Severity>(json!(4)).is_err());
    }

    #[test]
    fn test_sort_flags() {
        let mut flags = vec![
            spec(LayerName::SlopePct).evaluate(LayerObservation {
                value_num: Some(10.0),
                ..intersecting()
            }),
            spec(LayerName::OfacAirport).evaluate(intersecting()),
            spec(LayerName::OpbNoise).evaluate(LayerObservation {
                value_text: Some("DS III".into()),
                ..intersecting()
            }),
        ];
        sort_flags(&mut flags);
        let order: Vec<_> = flags.iter().map(|f| f.layer).collect();
        assert_eq!(
            order,
            vec![LayerName::OfacAirport, LayerName::OpbNoise, LayerName::SlopePct]
        );
    }
}
