//! Buildable-area calculator.
//!
//! Turns consolidated rules and a parcel area into floor-area figures. Input
//! problems never surface as `Err`: they become controls embedded in the
//! output, and the affected figures are `None`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::conversion::{ConversionMethod, IbusConversion, ValaisConversionTable};
use crate::rules::BuildingRules;
use crate::types::{ConsolidatedRule, RegulatedField};

const RELIABILITY_FLOOR: f64 = 0.25;
const PENALTY_PER_MISSING: f64 = 0.25;
const INDICE_U_MAX: f64 = 2.0;
const EMPRISE_MAX: f64 = 1.0;

// ── Controls ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCode {
    InvalidArea,
    MissingIndiceU,
    IbusConverted,
    MissingIbus,
    MissingEmprise,
    NiveauxLimited,
    IbusIncoherent,
    IndiceURange,
    EmpriseRange,
}

impl ControlCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArea => "INVALID_AREA",
            Self::MissingIndiceU => "MISSING_INDICE_U",
            Self::IbusConverted => "IBUS_CONVERTED",
            Self::MissingIbus => "MISSING_IBUS",
            Self::MissingEmprise => "MISSING_EMPRISE",
            Self::NiveauxLimited => "NIVEAUX_LIMITED",
            Self::IbusIncoherent => "IBUS_INCOHERENT",
            Self::IndiceURange => "INDICE_U_RANGE",
            Self::EmpriseRange => "EMPRISE_RANGE",
        }
    }

    /// Fatal controls mean every numeric output is `None`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidArea)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub code: ControlCode,
    pub level: ControlLevel,
    pub message: String,
}

impl ControlMessage {
    fn new(code: ControlCode, level: ControlLevel, message: impl Into<String>) -> Self {
        Self {
            code,
            level,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSummary {
    pub errors: usize,
    pub warnings: usize,
    pub infos: usize,
}

pub fn summarize_controls(controls: &[ControlMessage]) -> ControlSummary {
    controls
        .iter()
        .fold(ControlSummary::default(), |mut acc, c| {
            match c.level {
                ControlLevel::Error => acc.errors += 1,
                ControlLevel::Warning => acc.warnings += 1,
                ControlLevel::Info => acc.infos += 1,
            }
            acc
        })
}

/// True when at least one of the two floor-area indices is available.
pub fn can_calculate(rules: &[ConsolidatedRule]) -> bool {
    let b = BuildingRules::from_rules(rules);
    b.indice_u.is_some() || b.ibus.is_some()
}

// ── Output ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Formulas {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub su: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ibus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emprise: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub niveaux: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionDetail {
    pub table: String,
    pub from_indice_u: f64,
    pub ibus: f64,
    pub method: ConversionMethod,
}

/// Inputs and intermediate values behind a [`CalcOutput`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalcDetails {
    pub parcel_area_m2: f64,
    pub indice_u: Option<f64>,
    /// `ibus` as found in the rules, before any conversion.
    pub ibus: Option<f64>,
    pub emprise_max: Option<f64>,
    pub h_max_m: Option<f64>,
    pub niveaux_max: Option<f64>,
    pub conversion: Option<ConversionDetail>,
    pub formulas: Formulas,
    /// Core fields absent from the rules.
    pub missing_values: Vec<RegulatedField>,
}

impl CalcDetails {
    pub fn conversion_applied(&self) -> bool {
        self.conversion.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalcOutput {
    pub su_m2: Option<f64>,
    pub ibus_m2: Option<f64>,
    pub emprise_m2: Option<f64>,
    pub niveaux_max_est: Option<u32>,
    pub reliability: f64,
    pub controls: Vec<ControlMessage>,
    pub details: CalcDetails,
}

impl CalcOutput {
    pub fn has_control(&self, code: ControlCode) -> bool {
        self.controls.iter().any(|c| c.code == code)
    }

    pub fn is_fatal(&self) -> bool {
        self.controls.iter().any(|c| c.code.is_fatal())
    }

    pub fn summary(&self) -> ControlSummary {
        summarize_controls(&self.controls)
    }
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

// ── Calculator ────────────────────────────────────────────────

pub struct BuildCalculator {
    conversion: Arc<dyn IbusConversion>,
}

impl Default for BuildCalculator {
    fn default() -> Self {
        Self::new(Arc::new(ValaisConversionTable::default()))
    }
}

impl BuildCalculator {
    pub fn new(conversion: Arc<dyn IbusConversion>) -> Self {
        Self { conversion }
    }

    /// Pure and deterministic: identical inputs give identical outputs.
    pub fn compute(&self, parcel_area_m2: f64, rules: &[ConsolidatedRule]) -> CalcOutput {
        let mut controls = Vec::new();
        let mut details = CalcDetails {
            parcel_area_m2,
            ..CalcDetails::default()
        };

        let valid_area = parcel_area_m2.is_finite() && parcel_area_m2 > 0.0;
        if !valid_area {
            controls.push(ControlMessage::new(
                ControlCode::InvalidArea,
                ControlLevel::Error,
                format!("parcel area {parcel_area_m2} m² is not a positive number"),
            ));
            return CalcOutput {
                su_m2: None,
                ibus_m2: None,
                emprise_m2: None,
                niveaux_max_est: None,
                reliability: RELIABILITY_FLOOR,
                controls,
                details,
            };
        }

        let b = BuildingRules::from_rules(rules);
        details.indice_u = b.indice_u;
        details.ibus = b.ibus;
        details.emprise_max = b.emprise_max;
        details.h_max_m = b.h_max_m;
        details.niveaux_max = b.niveaux_max;

        for (field, value) in [
            (RegulatedField::UsageIndex, b.indice_u),
            (RegulatedField::FloorAreaRatio, b.ibus),
            (RegulatedField::GroundCoverage, b.emprise_max),
        ] {
            if value.is_none() {
                details.missing_values.push(field);
            }
        }

        // Usable floor area
        let su_m2 = match b.indice_u {
            Some(u) => {
                let su = round1(u * parcel_area_m2);
                details.formulas.su = Some(format!("{u} × {parcel_area_m2} = {su} m²"));
                Some(su)
            }
            None => {
                controls.push(ControlMessage::new(
                    ControlCode::MissingIndiceU,
                    ControlLevel::Warning,
                    "usage index (indice_u) is not defined",
                ));
                None
            }
        };

        // Gross floor area, converting from indice_u when ibus is absent
        let ibus = match (b.ibus, b.indice_u) {
            (Some(ibus), _) => Some(ibus),
            (None, Some(u)) => {
                let conversion = self.conversion.convert(u);
                controls.push(ControlMessage::new(
                    ControlCode::IbusConverted,
                    ControlLevel::Info,
                    format!(
                        "ibus derived from indice_u {u} via {} ({}): {}",
                        self.conversion.name(),
                        conversion.method.as_str(),
                        conversion.value
                    ),
                ));
                details.conversion = Some(ConversionDetail {
                    table: self.conversion.name().to_string(),
                    from_indice_u: u,
                    ibus: conversion.value,
                    method: conversion.method,
                });
                Some(conversion.value)
            }
            (None, None) => None,
        };

        let ibus_m2 = match ibus {
            Some(ibus) => {
                let gross = round1(ibus * parcel_area_m2);
                details.formulas.ibus = Some(format!("{ibus} × {parcel_area_m2} = {gross} m²"));
                Some(gross)
            }
            None => {
                controls.push(ControlMessage::new(
                    ControlCode::MissingIbus,
                    ControlLevel::Warning,
                    "ibus is not defined and cannot be derived",
                ));
                None
            }
        };

        // Ground coverage
        let emprise_m2 = match b.emprise_max {
            Some(e) => {
                let cover = round1(e * parcel_area_m2);
                details.formulas.emprise = Some(format!("{e} × {parcel_area_m2} = {cover} m²"));
                Some(cover)
            }
            None => {
                controls.push(ControlMessage::new(
                    ControlCode::MissingEmprise,
                    ControlLevel::Info,
                    "maximum ground coverage (emprise_max) is not defined",
                ));
                None
            }
        };

        // Floor count estimate
        let mut niveaux_max_est = None;
        if let (Some(gross), Some(cover)) = (ibus_m2, emprise_m2) {
            if cover > 0.0 {
                let est = (gross / cover).floor().max(0.0) as u32;
                details.formulas.niveaux = Some(format!("floor({gross} / {cover}) = {est}"));
                niveaux_max_est = Some(est);

                if let Some(cap) = b.niveaux_max {
                    if f64::from(est) > cap {
                        let capped = cap.floor().max(0.0) as u32;
                        niveaux_max_est = Some(capped);
                        controls.push(ControlMessage::new(
                            ControlCode::NiveauxLimited,
                            ControlLevel::Info,
                            format!("floor count capped by regulation at {cap}"),
                        ));
                    }
                }
            }
        }

        // Coherence
        if let (Some(gross), Some(su)) = (ibus_m2, su_m2) {
            if gross < su {
                controls.push(ControlMessage::new(
                    ControlCode::IbusIncoherent,
                    ControlLevel::Error,
                    format!("gross floor area ({gross} m²) is below usable floor area ({su} m²)"),
                ));
            }
        }
        if let Some(u) = b.indice_u {
            if u <= 0.0 || u > INDICE_U_MAX {
                controls.push(ControlMessage::new(
                    ControlCode::IndiceURange,
                    ControlLevel::Warning,
                    format!("indice_u {u} is outside the usual range (0, {INDICE_U_MAX}]"),
                ));
            }
        }
        if let Some(e) = b.emprise_max {
            if e <= 0.0 || e > EMPRISE_MAX {
                controls.push(ControlMessage::new(
                    ControlCode::EmpriseRange,
                    ControlLevel::Warning,
                    format!("emprise_max {e} is outside the usual range (0, {EMPRISE_MAX}]"),
                ));
            }
        }

        let missing = details.missing_values.len() as f64;
        let reliability = (1.0 - PENALTY_PER_MISSING * missing).max(RELIABILITY_FLOOR);

        CalcOutput {
            su_m2,
            ibus_m2,
            emprise_m2,
            niveaux_max_est,
            reliability,
            controls,
            details,
        }
    }
}
