//! Hierarchical rule resolution.
//!
//! Competing definitions for the same `(zone, field)` are reduced to a single
//! [`ConsolidatedRule`]. The winner is the active definition with the
//! highest-priority [`RuleLevel`]; within one tier the latest validity start
//! wins, then the smallest id. Every loser is kept on the winner as an
//! [`OverriddenRule`] for audit.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::geometry::Geometry;
use crate::ports::{bounded, Clock, Result, RuleStore};
use crate::types::{
    ConsolidatedRule, FieldValue, OverriddenRule, RegulatedField, RuleDefinition, RuleLevel,
};

// ── Pure consolidation ────────────────────────────────────────

fn precedence(a: &RuleDefinition, b: &RuleDefinition) -> Ordering {
    a.level
        .cmp(&b.level)
        .then_with(|| b.validity.from.cmp(&a.validity.from))
        .then_with(|| a.id.cmp(&b.id))
}

/// Reduce definitions to one consolidated rule per `(zone, field)`.
///
/// Definitions inactive at `as_of` are ignored entirely: they neither win
/// nor appear as overridden. Fields with no active definition are absent.
pub fn consolidate(definitions: &[RuleDefinition], as_of: NaiveDate) -> Vec<ConsolidatedRule> {
    let mut grouped: BTreeMap<(&str, RegulatedField), Vec<&RuleDefinition>> = BTreeMap::new();
    for def in definitions.iter().filter(|d| d.validity.is_active(as_of)) {
        grouped
            .entry((def.zone_id.as_str(), def.field))
            .or_default()
            .push(def);
    }

    grouped
        .into_values()
        .filter_map(|mut candidates| {
            candidates.sort_by(|a, b| precedence(a, b));
            let (winner, losers) = candidates.split_first()?;
            Some(ConsolidatedRule {
                zone_id: winner.zone_id.clone(),
                field: winner.field,
                value: winner.value.clone(),
                level: winner.level,
                rule_id: winner.id,
                description: winner.description.clone(),
                source_id: winner.source_id,
                source_path: winner.source_path(),
                overridden: losers.iter().map(|d| OverriddenRule::from(*d)).collect(),
            })
        })
        .collect()
}

// ── Zone selection ────────────────────────────────────────────

/// Outcome of resolving rules for a zone or a parcel geometry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneResolution {
    /// Selected zone; `None` when nothing intersected or the input was invalid.
    pub zone_id: Option<String>,
    pub rules: Vec<ConsolidatedRule>,
    /// Zones sharing the winning field count, including the selected one.
    /// Empty when the selection was unambiguous.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tied_zones: Vec<String>,
}

impl ZoneResolution {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn for_zone(zone_id: impl Into<String>, rules: Vec<ConsolidatedRule>) -> Self {
        Self {
            zone_id: Some(zone_id.into()),
            rules,
            tied_zones: Vec::new(),
        }
    }

    pub fn is_tied(&self) -> bool {
        !self.tied_zones.is_empty()
    }
}

/// Pick the zone with the most resolvable fields.
///
/// Equal counts resolve to the lexicographically smallest zone id and are
/// reported in `tied_zones`.
pub fn select_zone(mut candidates: Vec<(String, Vec<ConsolidatedRule>)>) -> ZoneResolution {
    candidates.sort_by(|a, b| a.0.cmp(&b.0));
    candidates.dedup_by(|a, b| a.0 == b.0);

    let Some(best) = candidates.iter().map(|(_, rules)| rules.len()).max() else {
        return ZoneResolution::empty();
    };

    let tied: Vec<String> = candidates
        .iter()
        .filter(|(_, rules)| rules.len() == best)
        .map(|(zone, _)| zone.clone())
        .collect();

    let Some(index) = candidates.iter().position(|(_, rules)| rules.len() == best) else {
        return ZoneResolution::empty();
    };
    let (zone_id, rules) = candidates.swap_remove(index);

    ZoneResolution {
        zone_id: Some(zone_id),
        rules,
        tied_zones: if tied.len() > 1 { tied } else { Vec::new() },
    }
}

// ── Resolver ──────────────────────────────────────────────────

/// Rule lookup input: a known zone or a raw parcel boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleQuery {
    Zone(String),
    GeometryWkt(String),
}

pub struct RuleResolver {
    store: Arc<dyn RuleStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl RuleResolver {
    pub fn new(store: Arc<dyn RuleStore>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            store,
            clock,
            timeout,
        }
    }

    pub async fn resolve(&self, query: &RuleQuery) -> Result<ZoneResolution> {
        match query {
            RuleQuery::Zone(zone_id) => {
                let rules = self.resolve_zone(zone_id).await?;
                Ok(ZoneResolution::for_zone(zone_id.clone(), rules))
            }
            RuleQuery::GeometryWkt(wkt) => self.resolve_geometry(wkt).await,
        }
    }

    /// Consolidated rules for a zone as of today.
    pub async fn resolve_zone(&self, zone_id: &str) -> Result<Vec<ConsolidatedRule>> {
        self.resolve_zone_as_of(zone_id, self.clock.today()).await
    }

    pub async fn resolve_zone_as_of(
        &self,
        zone_id: &str,
        as_of: NaiveDate,
    ) -> Result<Vec<ConsolidatedRule>> {
        let definitions = bounded(
            "rule_store.rules_for_zone",
            self.timeout,
            self.store.rules_for_zone(zone_id),
        )
        .await?;
        let rules = consolidate(&definitions, as_of);
        debug!(
            zone_id,
            definitions = definitions.len(),
            fields = rules.len(),
            "zone rules consolidated"
        );
        Ok(rules)
    }

    /// Resolve by parcel boundary. Invalid or empty WKT yields an empty result.
    pub async fn resolve_geometry(&self, wkt: &str) -> Result<ZoneResolution> {
        let geometry = match Geometry::parse_wkt(wkt) {
            Ok(g) => g,
            Err(e) => {
                warn!(error = %e, "rule resolution skipped: unusable geometry");
                return Ok(ZoneResolution::empty());
            }
        };
        self.resolve_parsed(&geometry).await
    }

    pub async fn resolve_parsed(&self, geometry: &Geometry) -> Result<ZoneResolution> {
        let as_of = self.clock.today();
        let zones = bounded(
            "rule_store.zones_intersecting",
            self.timeout,
            self.store.zones_intersecting(geometry),
        )
        .await?;

        let lookups = zones.into_iter().map(|zone_id| async move {
            let rules = self.resolve_zone_as_of(&zone_id, as_of).await?;
            Ok::<_, crate::error::ParcelError>((zone_id, rules))
        });
        let candidates = futures::future::try_join_all(lookups).await?;

        let resolution = select_zone(candidates);
        if resolution.is_tied() {
            warn!(
                selected = resolution.zone_id.as_deref().unwrap_or_default(),
                tied = ?resolution.tied_zones,
                "intersecting zones tie on resolvable field count"
            );
        }
        Ok(resolution)
    }
}

// ── Typed access ──────────────────────────────────────────────

pub fn rule_for(rules: &[ConsolidatedRule], field: RegulatedField) -> Option<&ConsolidatedRule> {
    rules.iter().find(|r| r.field == field)
}

pub fn numeric_rule(rules: &[ConsolidatedRule], field: RegulatedField) -> Option<f64> {
    rule_for(rules, field).and_then(|r| r.value.as_number())
}

pub fn rules_at_level(rules: &[ConsolidatedRule], level: RuleLevel) -> Vec<&ConsolidatedRule> {
    rules.iter().filter(|r| r.level == level).collect()
}

pub fn has_overrides(rules: &[ConsolidatedRule]) -> bool {
    rules.iter().any(ConsolidatedRule::has_overrides)
}

/// Highest tier that produced any winning value.
pub fn highest_priority_level(rules: &[ConsolidatedRule]) -> Option<RuleLevel> {
    rules.iter().map(|r| r.level).min()
}

/// The eight regulated fields pulled out of a consolidated rule set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildingRules {
    pub h_max_m: Option<f64>,
    pub niveaux_max: Option<f64>,
    pub indice_u: Option<f64>,
    pub ibus: Option<f64>,
    pub emprise_max: Option<f64>,
    pub recul_min_m: Option<f64>,
    pub toit_types: Option<FieldValue>,
    pub pente_toit_min_max: Option<FieldValue>,
}

impl BuildingRules {
    pub fn from_rules(rules: &[ConsolidatedRule]) -> Self {
        let num = |field| numeric_rule(rules, field);
        let raw = |field| rule_for(rules, field).map(|r| r.value.clone());
        Self {
            h_max_m: num(RegulatedField::HeightMax),
            niveaux_max: num(RegulatedField::FloorCountMax),
            indice_u: num(RegulatedField::UsageIndex),
            ibus: num(RegulatedField::FloorAreaRatio),
            emprise_max: num(RegulatedField::GroundCoverage),
            recul_min_m: num(RegulatedField::SetbackMin),
            toit_types: raw(RegulatedField::RoofTypes),
            pente_toit_min_max: raw(RegulatedField::RoofPitchRange),
        }
    }
}
