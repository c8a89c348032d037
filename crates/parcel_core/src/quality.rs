//! Quality scoring.
//!
//! A parcel's score is the importance-weighted mean of the reliability
//! weights of every tracked field, rounded to two decimals.

#![allow(clippy::should_implement_trait)]

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::evidence::{RefType, Reliability};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Regulations,
    Context,
    Calculations,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regulations => "regulations",
            Self::Context => "context",
            Self::Calculations => "calculations",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "regulations" => Some(Self::Regulations),
            "context" => Some(Self::Context),
            "calculations" => Some(Self::Calculations),
            _ => None,
        }
    }
}

impl From<RefType> for Category {
    fn from(r: RefType) -> Self {
        match r {
            RefType::Regulation => Self::Regulations,
            RefType::Context => Self::Context,
            RefType::Calculation => Self::Calculations,
        }
    }
}

/// One field's contribution to the score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredField {
    pub category: Category,
    pub field: String,
    pub reliability: Reliability,
}

impl ScoredField {
    pub fn new(category: Category, field: impl Into<String>, reliability: Reliability) -> Self {
        Self {
            category,
            field: field.into(),
            reliability,
        }
    }

    pub fn detail_key(&self) -> String {
        format!("{}.{}", self.category.as_str(), self.field)
    }
}

/// Relative importance of a field. Unknown fields weigh 0.5.
pub fn field_importance(field: &str) -> f64 {
    match field {
        "indice_u" | "ibus" => 1.0,
        "ibus_m2" | "su_m2" => 0.9,
        "emprise_max" | "emprise_m2" => 0.7,
        "niveaux_max_est" => 0.5,
        _ => 0.5,
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Weighted mean in [0, 1]; `None` when no field was tracked.
pub fn weighted_score<'a>(fields: impl IntoIterator<Item = &'a ScoredField>) -> Option<f64> {
    let (total, weight) = fields.into_iter().fold((0.0, 0.0), |(total, weight), f| {
        let importance = field_importance(&f.field);
        (total + f.reliability.weight() * importance, weight + importance)
    });
    (weight > 0.0).then(|| round2(total / weight).clamp(0.0, 1.0))
}

// ── Score ─────────────────────────────────────────────────────

/// One row per parcel per calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub parcel_id: String,
    #[serde(default)]
    pub zone_id: Option<String>,
    pub calc_date: NaiveDate,
    pub score_global: f64,
    #[serde(default)]
    pub score_regulations: Option<f64>,
    #[serde(default)]
    pub score_context: Option<f64>,
    #[serde(default)]
    pub score_calculations: Option<f64>,
    pub total_fields: usize,
    pub direct_count: usize,
    pub derived_count: usize,
    pub estimated_count: usize,
    pub missing_count: usize,
    /// Reliability weight per `"<category>.<field>"`.
    #[serde(default)]
    pub details: BTreeMap<String, f64>,
    pub analysis_version: String,
}

impl QualityScore {
    pub fn compute(
        parcel_id: impl Into<String>,
        zone_id: Option<String>,
        calc_date: NaiveDate,
        analysis_version: impl Into<String>,
        fields: &[ScoredField],
    ) -> Self {
        let count = |r: Reliability| fields.iter().filter(|f| f.reliability == r).count();
        let category =
            |c: Category| weighted_score(fields.iter().filter(move |f| f.category == c));

        Self {
            parcel_id: parcel_id.into(),
            zone_id,
            calc_date,
            score_global: weighted_score(fields).unwrap_or(0.0),
            score_regulations: category(Category::Regulations),
            score_context: category(Category::Context),
            score_calculations: category(Category::Calculations),
            total_fields: fields.len(),
            direct_count: count(Reliability::Direct),
            derived_count: count(Reliability::Derived),
            estimated_count: count(Reliability::Estimated),
            missing_count: count(Reliability::Missing),
            details: fields
                .iter()
                .map(|f| (f.detail_key(), f.reliability.weight()))
                .collect(),
            analysis_version: analysis_version.into(),
        }
    }
}

// ── Report ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreDistribution {
    /// >= 0.9
    pub excellent: usize,
    /// [0.7, 0.9)
    pub good: usize,
    /// [0.5, 0.7)
    pub average: usize,
    /// < 0.5
    pub poor: usize,
}

impl ScoreDistribution {
    fn record(&mut self, score: f64) {
        if score >= 0.9 {
            self.excellent += 1;
        } else if score >= 0.7 {
            self.good += 1;
        } else if score >= 0.5 {
            self.average += 1;
        } else {
            self.poor += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyQuality {
    pub date: NaiveDate,
    pub parcels: usize,
    pub average_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingFieldCount {
    pub field: String,
    pub occurrences: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub parcels_analyzed: usize,
    pub average_score: Option<f64>,
    pub distribution: ScoreDistribution,
    pub top_missing_fields: Vec<MissingFieldCount>,
    /// Most recent day first.
    pub daily_trend: Vec<DailyQuality>,
    /// Lowest global scores first.
    pub worst_parcels: Vec<QualityScore>,
}

const TOP_MISSING: usize = 5;
const WORST_PARCELS: usize = 10;

impl QualityReport {
    pub fn build(scores: &[QualityScore], missing_fields: &[String]) -> Self {
        let parcels: BTreeSet<&str> = scores.iter().map(|s| s.parcel_id.as_str()).collect();

        let mut distribution = ScoreDistribution::default();
        for s in scores {
            distribution.record(s.score_global);
        }

        let average_score = (!scores.is_empty()).then(|| {
            round2(scores.iter().map(|s| s.score_global).sum::<f64>() / scores.len() as f64)
        });

        let mut by_field: HashMap<&str, usize> = HashMap::new();
        for field in missing_fields {
            *by_field.entry(field.as_str()).or_default() += 1;
        }
        let mut top_missing_fields: Vec<MissingFieldCount> = by_field
            .into_iter()
            .map(|(field, occurrences)| MissingFieldCount {
                field: field.to_string(),
                occurrences,
            })
            .collect();
        top_missing_fields.sort_by(|a, b| {
            b.occurrences
                .cmp(&a.occurrences)
                .then_with(|| a.field.cmp(&b.field))
        });
        top_missing_fields.truncate(TOP_MISSING);

        let mut by_day: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();
        for s in scores {
            by_day.entry(s.calc_date).or_default().push(s.score_global);
        }
        let daily_trend = by_day
            .into_iter()
            .rev()
            .map(|(date, day)| DailyQuality {
                date,
                parcels: day.len(),
                average_score: round2(day.iter().sum::<f64>() / day.len() as f64),
            })
            .collect();

        let mut worst_parcels = scores.to_vec();
        worst_parcels.sort_by(|a, b| {
            a.score_global
                .total_cmp(&b.score_global)
                .then_with(|| a.parcel_id.cmp(&b.parcel_id))
        });
        worst_parcels.truncate(WORST_PARCELS);

        Self {
            parcels_analyzed: parcels.len(),
            average_score,
            distribution,
            top_missing_fields,
            daily_trend,
            worst_parcels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    fn f(category: Category, field: &str, r: Reliability) -> ScoredField {
        ScoredField::new(category, field, r)
    }

    #[test]
    fn test_importance_table() {
        assert_eq!(field_importance("ibus"), 1.0);
        assert_eq!(field_importance("su_m2"), 0.9);
        assert_eq!(field_importance("emprise_m2"), 0.7);
        assert_eq!(field_importance("niveaux_max_est"), 0.5);
        assert_eq!(field_importance("opb_noise"), 0.5);
    }

    #[test]
    fn test_weighted_score() {
        let fields = vec![
            f(Category::Regulations, "indice_u", Reliability::Direct),
            f(Category::Regulations, "ibus", Reliability::Missing),
        ];
        assert_eq!(weighted_score(&fields), Some(0.5));
        assert_eq!(weighted_score(&[]), None);
    }

    #[test]
    fn test_all_missing_scores_zero() {
        let fields = vec![
            f(Category::Regulations, "indice_u", Reliability::Missing),
            f(Category::Calculations, "su_m2", Reliability::Missing),
        ];
        let s = QualityScore::compute("P1", None, day(1), "1.0", &fields);
        assert_eq!(s.score_global, 0.0);
        assert_eq!(s.missing_count, 2);
        assert_eq!(s.score_context, None);
        assert_eq!(s.score_calculations, Some(0.0));
    }

    #[test]
    fn test_compute_details_and_counts() {
        let fields = vec![
            f(Category::Regulations, "indice_u", Reliability::Direct),
            f(Category::Calculations, "su_m2", Reliability::Derived),
            f(Category::Calculations, "niveaux_max_est", Reliability::Estimated),
            f(Category::Context, "opb_noise", Reliability::Direct),
        ];
        let s = QualityScore::compute("P1", Some("Z1".into()), day(1), "1.0", &fields);
        // (1.0*1.0 + 0.8*0.9 + 0.5*0.5 + 1.0*0.5) / (1.0 + 0.9 + 0.5 + 0.5)
        assert_eq!(s.score_global, 0.85);
        assert_eq!(s.total_fields, 4);
        assert_eq!(s.direct_count, 2);
        assert_eq!(s.details.get("calculations.su_m2"), Some(&0.8));
        assert_eq!(s.details.get("context.opb_noise"), Some(&1.0));
        assert_eq!(s.score_regulations, Some(1.0));
    }

    fn score(parcel: &str, d: u32, global: f64) -> QualityScore {
        let mut s = QualityScore::compute(parcel, None, day(d), "1.0", &[]);
        s.score_global = global;
        s
    }

    #[test]
    fn test_report() {
        let scores = vec![
            score("A", 1, 0.95),
            score("B", 1, 0.75),
            score("A", 2, 0.55),
            score("C", 2, 0.2),
        ];
        let missing: Vec<String> = ["ibus", "ibus", "emprise_max", "ibus", "su_m2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let r = QualityReport::build(&scores, &missing);
        assert_eq!(r.parcels_analyzed, 3);
        assert_eq!(r.average_score, Some(0.61));
        assert_eq!(
            r.distribution,
            ScoreDistribution {
                excellent: 1,
                good: 1,
                average: 1,
                poor: 1
            }
        );
        assert_eq!(r.top_missing_fields[0].field, "ibus");
        assert_eq!(r.top_missing_fields[0].occurrences, 3);
        assert_eq!(r.top_missing_fields[1].field, "emprise_max");
        assert_eq!(r.daily_trend[0].date, day(2));
        assert_eq!(r.daily_trend[0].average_score, 0.38);
        assert_eq!(r.worst_parcels[0].parcel_id, "C");
    }

    #[test]
    fn test_empty_report() {
        let r = QualityReport::build(&[], &[]);
        assert_eq!(r.parcels_analyzed, 0);
        assert_eq!(r.average_score, None);
        assert!(r.top_missing_fields.is_empty());
    }
}
