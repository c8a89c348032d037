//! YAML fixtures that seed the in-memory ports.
//!
//! ```yaml
//! zones:
//!   - id: SION-R2
//!     boundary: "POLYGON((...))"
//! rules:
//!   - zone_id: SION-R2
//!     field: indice_u
//!     value: 0.5
//!     level: LEVEL3
//! layers:
//!   opb_noise:
//!     - geometry: "POLYGON((...))"
//!       value_text: DS III
//! parcels:
//!   - id: "6266-1234"
//!     geometry: "POLYGON((...))"
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::LayerName;
use crate::error::ParcelError;
use crate::geometry::Geometry;
use crate::memory::{
    InMemoryContextCache, InMemoryEvidenceStore, InMemoryLayerProbe, InMemoryQualityStore,
    InMemoryRuleStore, LayerFeature,
};
use crate::ports::{Clock, Result, RuleStore};
use crate::service::AnalyzerPorts;
use crate::types::{FieldValue, RegulatedField, RuleDefinition, RuleLevel, ValidityWindow};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureZone {
    pub id: String,
    pub boundary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureRule {
    /// Derived from the rule's position and content when omitted.
    #[serde(default)]
    pub id: Option<Uuid>,
    pub zone_id: String,
    pub field: RegulatedField,
    pub value: FieldValue,
    pub level: RuleLevel,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub validity: ValidityWindow,
    #[serde(default)]
    pub article_ref: Option<String>,
}

impl FixtureRule {
    fn into_definition(self, index: usize) -> RuleDefinition {
        let id = self.id.unwrap_or_else(|| {
            let name = format!("{}/{}/{}/{index}", self.zone_id, self.field.key(), self.level);
            Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
        });
        RuleDefinition {
            id,
            zone_id: self.zone_id,
            field: self.field,
            value: self.value,
            level: self.level,
            description: self.description,
            validity: self.validity,
            source_id: None,
            article_ref: self.article_ref,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureFeature {
    pub geometry: String,
    #[serde(default)]
    pub value_text: Option<String>,
    #[serde(default)]
    pub value_num: Option<f64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureParcel {
    pub id: String,
    pub geometry: String,
    #[serde(default)]
    pub zone_id: Option<String>,
    #[serde(default)]
    pub area_m2: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureSet {
    #[serde(default)]
    pub zones: Vec<FixtureZone>,
    #[serde(default)]
    pub rules: Vec<FixtureRule>,
    #[serde(default)]
    pub layers: BTreeMap<LayerName, Vec<FixtureFeature>>,
    #[serde(default)]
    pub parcels: Vec<FixtureParcel>,
}

/// Concrete handles to the seeded stores, for inspection after a run.
#[derive(Clone)]
pub struct SeededStores {
    pub rules: Arc<InMemoryRuleStore>,
    pub layers: Arc<InMemoryLayerProbe>,
    pub context_cache: Arc<InMemoryContextCache>,
    pub evidence: Arc<InMemoryEvidenceStore>,
    pub quality: Arc<InMemoryQualityStore>,
}

impl SeededStores {
    pub fn ports(&self, clock: Arc<dyn Clock>) -> AnalyzerPorts {
        AnalyzerPorts {
            rules: self.rules.clone(),
            layers: self.layers.clone(),
            context_cache: self.context_cache.clone(),
            evidence: self.evidence.clone(),
            quality: self.quality.clone(),
            clock,
        }
    }
}

impl FixtureSet {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ParcelError::InvalidInput(format!("fixture: {e}")))
    }

    pub fn parcel(&self, id: &str) -> Option<&FixtureParcel> {
        self.parcels.iter().find(|p| p.id == id)
    }

    /// Build in-memory stores holding the fixture data.
    pub async fn seed(&self, cache_capacity: usize) -> Result<SeededStores> {
        let rules = Arc::new(InMemoryRuleStore::new());
        for zone in &self.zones {
            let boundary = Geometry::parse_wkt(&zone.boundary).map_err(|e| {
                ParcelError::InvalidInput(format!("zone {}: {e}", zone.id))
            })?;
            rules.add_zone(zone.id.clone(), boundary).await;
        }
        let definitions: Vec<RuleDefinition> = self
            .rules
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, r)| r.into_definition(i))
            .collect();
        rules.insert_rules(&definitions).await?;

        let layers = Arc::new(InMemoryLayerProbe::new());
        for (layer, features) in &self.layers {
            for (i, feature) in features.iter().enumerate() {
                let geometry = Geometry::parse_wkt(&feature.geometry).map_err(|e| {
                    ParcelError::InvalidInput(format!("layer {layer} feature {i}: {e}"))
                })?;
                let mut seeded = LayerFeature::new(geometry).with_metadata(feature.metadata.clone());
                seeded.value_text = feature.value_text.clone();
                seeded.value_num = feature.value_num;
                layers.add_feature(*layer, seeded).await;
            }
        }

        Ok(SeededStores {
            rules,
            layers,
            context_cache: Arc::new(InMemoryContextCache::new(cache_capacity)),
            evidence: Arc::new(InMemoryEvidenceStore::new()),
            quality: Arc::new(InMemoryQualityStore::new()),
        })
    }
}
