//! Core domain types for regulation resolution.
//! These are pure value types: no sqlx, no DB dependencies.

// Several enums intentionally use `from_str() -> Option<Self>` instead of
// `FromStr` because they return None for unknown values rather than an error.
#![allow(clippy::should_implement_trait)]

use std::cmp::Ordering;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use uuid::Uuid;

// ── Priority tiers ────────────────────────────────────────────

/// Legal priority tier of a rule definition.
///
/// Tier 1 beats tier 2 beats tier 3 beats tier 4. Ordering is driven by
/// [`RuleLevel::rank`], never by the persisted string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleLevel {
    /// Easements and special-plan constraints.
    #[serde(rename = "LEVEL1")]
    Easement,
    /// Communal planning complements.
    #[serde(rename = "LEVEL2")]
    CommunalComplement,
    /// Communal zoning regulation.
    #[serde(rename = "LEVEL3")]
    CommunalZoning,
    /// Cantonal / federal default law.
    #[serde(rename = "LEVEL4")]
    CantonalFederal,
}

impl RuleLevel {
    pub const ALL: [RuleLevel; 4] = [
        Self::Easement,
        Self::CommunalComplement,
        Self::CommunalZoning,
        Self::CantonalFederal,
    ];

    /// 1 = highest priority, 4 = lowest.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Easement => 1,
            Self::CommunalComplement => 2,
            Self::CommunalZoning => 3,
            Self::CantonalFederal => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Easement => "LEVEL1",
            Self::CommunalComplement => "LEVEL2",
            Self::CommunalZoning => "LEVEL3",
            Self::CantonalFederal => "LEVEL4",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "LEVEL1" => Some(Self::Easement),
            "LEVEL2" => Some(Self::CommunalComplement),
            "LEVEL3" => Some(Self::CommunalZoning),
            "LEVEL4" => Some(Self::CantonalFederal),
            _ => None,
        }
    }

    /// True if `self` wins over `other`.
    pub fn outranks(&self, other: RuleLevel) -> bool {
        self.rank() < other.rank()
    }
}

impl PartialOrd for RuleLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// `Easement < CantonalFederal`: sorting ascending puts the winner first.
impl Ord for RuleLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl std::fmt::Display for RuleLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Regulated fields ──────────────────────────────────────────

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
    EnumIter,
)]
pub enum RegulatedField {
    #[serde(rename = "h_max_m")]
    #[strum(serialize = "h_max_m")]
    HeightMax,
    #[serde(rename = "niveaux_max")]
    #[strum(serialize = "niveaux_max")]
    FloorCountMax,
    #[serde(rename = "indice_u")]
    #[strum(serialize = "indice_u")]
    UsageIndex,
    #[serde(rename = "ibus")]
    #[strum(serialize = "ibus")]
    FloorAreaRatio,
    #[serde(rename = "emprise_max")]
    #[strum(serialize = "emprise_max")]
    GroundCoverage,
    #[serde(rename = "recul_min_m")]
    #[strum(serialize = "recul_min_m")]
    SetbackMin,
    #[serde(rename = "toit_types")]
    #[strum(serialize = "toit_types")]
    RoofTypes,
    #[serde(rename = "pente_toit_min_max")]
    #[strum(serialize = "pente_toit_min_max")]
    RoofPitchRange,
}

impl RegulatedField {
    /// Fields whose absence penalises calculator reliability.
    pub const CORE: [RegulatedField; 3] =
        [Self::UsageIndex, Self::FloorAreaRatio, Self::GroundCoverage];

    pub fn key(&self) -> &'static str {
        match self {
            Self::HeightMax => "h_max_m",
            Self::FloorCountMax => "niveaux_max",
            Self::UsageIndex => "indice_u",
            Self::FloorAreaRatio => "ibus",
            Self::GroundCoverage => "emprise_max",
            Self::SetbackMin => "recul_min_m",
            Self::RoofTypes => "toit_types",
            Self::RoofPitchRange => "pente_toit_min_max",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::iter().find(|f| f.key() == key)
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, Self::RoofTypes | Self::RoofPitchRange)
    }

    pub fn is_core(&self) -> bool {
        Self::CORE.contains(self)
    }
}

// ── Values ────────────────────────────────────────────────────

/// Typed rule or evidence value: numeric, text, or structured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
    Structured(serde_json::Value),
}

impl FieldValue {
    /// Numeric view; numeric text is parsed.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            Self::Structured(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Split into the (num, text, json) column triple used by the stores.
    pub fn to_columns(&self) -> (Option<f64>, Option<String>, Option<serde_json::Value>) {
        match self {
            Self::Number(n) => (Some(*n), None, None),
            Self::Text(s) => (None, Some(s.clone()), None),
            Self::Structured(v) => (None, None, Some(v.clone())),
        }
    }

    /// Inverse of [`FieldValue::to_columns`]; number wins over text over json.
    pub fn from_columns(
        num: Option<f64>,
        text: Option<String>,
        json: Option<serde_json::Value>,
    ) -> Option<Self> {
        num.map(Self::Number)
            .or_else(|| text.map(Self::Text))
            .or_else(|| json.map(Self::Structured))
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Structured(v) => write!(f, "{v}"),
        }
    }
}

// ── Rule definitions ──────────────────────────────────────────

/// Inclusive validity interval. Open bounds are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub to: Option<NaiveDate>,
}

impl ValidityWindow {
    pub fn open() -> Self {
        Self::default()
    }

    pub fn is_active(&self, as_of: NaiveDate) -> bool {
        self.from.map_or(true, |from| from <= as_of) && self.to.map_or(true, |to| as_of <= to)
    }
}

/// One regulatory statement, as read from the rule store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: Uuid,
    pub zone_id: String,
    pub field: RegulatedField,
    pub value: FieldValue,
    pub level: RuleLevel,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub validity: ValidityWindow,
    /// Regulation document the rule was ingested from.
    #[serde(default)]
    pub source_id: Option<Uuid>,
    #[serde(default)]
    pub article_ref: Option<String>,
}

impl RuleDefinition {
    pub fn new(
        zone_id: impl Into<String>,
        field: RegulatedField,
        value: FieldValue,
        level: RuleLevel,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            zone_id: zone_id.into(),
            field,
            value,
            level,
            description: None,
            validity: ValidityWindow::open(),
            source_id: None,
            article_ref: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_validity(mut self, validity: ValidityWindow) -> Self {
        self.validity = validity;
        self
    }

    /// `LEVEL/zone/field[/article]`, used as evidence source path.
    pub fn source_path(&self) -> String {
        let mut parts = vec![
            self.level.as_str().to_string(),
            self.zone_id.clone(),
            self.field.key().to_string(),
        ];
        if let Some(article) = &self.article_ref {
            parts.push(article.clone());
        }
        parts.join("/")
    }
}

/// A lower-priority definition that lost against the winner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverriddenRule {
    pub rule_id: Uuid,
    pub level: RuleLevel,
    pub value: FieldValue,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source_id: Option<Uuid>,
}

impl From<&RuleDefinition> for OverriddenRule {
    fn from(def: &RuleDefinition) -> Self {
        Self {
            rule_id: def.id,
            level: def.level,
            value: def.value.clone(),
            description: def.description.clone(),
            source_id: def.source_id,
        }
    }
}

/// The single winning value for a regulated field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedRule {
    pub zone_id: String,
    pub field: RegulatedField,
    pub value: FieldValue,
    pub level: RuleLevel,
    pub rule_id: Uuid,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source_id: Option<Uuid>,
    pub source_path: String,
    /// Ordered by priority, highest first.
    #[serde(default)]
    pub overridden: Vec<OverriddenRule>,
}

impl ConsolidatedRule {
    pub fn has_overrides(&self) -> bool {
        !self.overridden.is_empty()
    }
}
