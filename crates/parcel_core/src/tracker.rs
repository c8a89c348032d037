//! Evidence tracking and quality scoring for one analysis run.
//!
//! [`collect_evidence`] is pure: it turns resolver, calculator and context
//! output into evidence items plus the per-field reliabilities that feed
//! the score. [`EvidenceTracker::track`] adds persistence, which never
//! fails the run; a failed write is reported as [`PersistenceStatus::Degraded`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::calculator::CalcOutput;
use crate::config::{EngineConfig, PersistenceMode};
use crate::context::ContextFlag;
use crate::evidence::{EvidenceItem, EvidenceLedger, RefType, Reliability};
use crate::ports::{bounded, Clock, EvidenceStore, QualityStore};
use crate::quality::{Category, QualityScore, ScoredField};
use crate::types::{ConsolidatedRule, FieldValue, RegulatedField};

pub const DEFAULT_INSERTED_BY: &str = "parcel_engine";

/// Combined output of one analysis, as seen by the tracker.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisInputs<'a> {
    pub zone_id: Option<&'a str>,
    pub rules: &'a [ConsolidatedRule],
    pub calc: &'a CalcOutput,
    pub context: &'a [ContextFlag],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackedEvidence {
    /// Unique per evidence key, in key order.
    pub items: Vec<EvidenceItem>,
    /// One entry per tracked field; overridden rules are audit-only.
    pub scored: Vec<ScoredField>,
}

struct Collector<'a> {
    parcel_id: &'a str,
    recorded_at: DateTime<Utc>,
    inserted_by: &'a str,
    ledger: EvidenceLedger,
    scored: Vec<ScoredField>,
}

impl<'a> Collector<'a> {
    #[allow(clippy::too_many_arguments)]
    fn record(
        &mut self,
        ref_type: RefType,
        ref_id: Option<String>,
        field: &str,
        value: Option<FieldValue>,
        reliability: Reliability,
        source_path: String,
        comment: Option<String>,
        metadata: serde_json::Value,
    ) {
        self.ledger.upsert(EvidenceItem {
            ref_type,
            ref_id,
            parcel_id: self.parcel_id.to_string(),
            field: field.to_string(),
            value,
            reliability,
            source_path,
            comment,
            metadata,
            inserted_by: self.inserted_by.to_string(),
            recorded_at: self.recorded_at,
        });
    }

    fn score(&mut self, ref_type: RefType, field: &str, reliability: Reliability) {
        self.scored
            .push(ScoredField::new(Category::from(ref_type), field, reliability));
    }

    fn regulations(&mut self, zone_id: Option<&str>, rules: &[ConsolidatedRule]) {
        for rule in rules {
            let field = rule.field.key();
            self.record(
                RefType::Regulation,
                Some(rule.rule_id.to_string()),
                field,
                Some(rule.value.clone()),
                Reliability::Direct,
                rule.source_path.clone(),
                rule.description.clone(),
                json!({ "level": rule.level, "zone_id": rule.zone_id }),
            );
            self.score(RefType::Regulation, field, Reliability::Direct);

            for lost in &rule.overridden {
                self.record(
                    RefType::Regulation,
                    Some(lost.rule_id.to_string()),
                    field,
                    Some(lost.value.clone()),
                    Reliability::Derived,
                    format!("{}/{}/{}/overridden", lost.level, rule.zone_id, field),
                    Some(format!("overridden by {} ({})", rule.level, rule.value)),
                    json!({
                        "level": lost.level,
                        "winner_rule_id": rule.rule_id,
                        "winner_level": rule.level,
                    }),
                );
            }
        }

        for field in RegulatedField::CORE {
            if rules.iter().any(|r| r.field == field) {
                continue;
            }
            self.record(
                RefType::Regulation,
                None,
                field.key(),
                None,
                Reliability::Missing,
                format!("regulations/{}/{}", zone_id.unwrap_or("unknown"), field.key()),
                Some("no applicable rule definition".to_string()),
                serde_json::Value::Null,
            );
            self.score(RefType::Regulation, field.key(), Reliability::Missing);
        }
    }

    fn calculation(&mut self, calc: &CalcOutput) {
        let area = calc.details.parcel_area_m2;
        let products = [
            ("su_m2", calc.su_m2, calc.details.formulas.su.clone()),
            ("ibus_m2", calc.ibus_m2, calc.details.formulas.ibus.clone()),
            ("emprise_m2", calc.emprise_m2, calc.details.formulas.emprise.clone()),
        ];
        for (field, value, formula) in products {
            let reliability = if value.is_some() {
                Reliability::Derived
            } else {
                Reliability::Missing
            };
            self.record(
                RefType::Calculation,
                None,
                field,
                value.map(FieldValue::Number),
                reliability,
                format!("calculation/{field}"),
                formula,
                json!({ "parcel_area_m2": area }),
            );
            self.score(RefType::Calculation, field, reliability);
        }

        let niveaux = calc.niveaux_max_est.map(|n| FieldValue::Number(f64::from(n)));
        let reliability = if niveaux.is_some() {
            Reliability::Estimated
        } else {
            Reliability::Missing
        };
        self.record(
            RefType::Calculation,
            None,
            "niveaux_max_est",
            niveaux,
            reliability,
            "calculation/niveaux_max_est".to_string(),
            calc.details.formulas.niveaux.clone(),
            json!({ "cap": calc.details.niveaux_max }),
        );
        self.score(RefType::Calculation, "niveaux_max_est", reliability);

        if let Some(conversion) = &calc.details.conversion {
            self.record(
                RefType::Calculation,
                None,
                "ibus",
                Some(FieldValue::Number(conversion.ibus)),
                Reliability::Derived,
                format!("conversion/{}/{}", conversion.table, conversion.method.as_str()),
                Some(format!("derived from indice_u {}", conversion.from_indice_u)),
                json!({ "indice_u": conversion.from_indice_u }),
            );
            self.score(RefType::Calculation, "ibus", Reliability::Derived);
        }
    }

    fn context(&mut self, flags: &[ContextFlag]) {
        for flag in flags {
            let layer = flag.layer.as_str();
            let value = flag
                .value_num
                .map(FieldValue::Number)
                .or_else(|| flag.value_text.clone().map(FieldValue::Text))
                .or_else(|| flag.distance.map(FieldValue::Number));
            let reliability = flag.check.evidence_reliability();
            self.record(
                RefType::Context,
                Some(layer.to_string()),
                layer,
                value,
                reliability,
                flag.source_path.clone(),
                Some(flag.message.clone()),
                json!({
                    "check": flag.check.as_str(),
                    "severity": flag.severity,
                    "intersects": flag.intersects,
                }),
            );
            self.score(RefType::Context, layer, reliability);
        }
    }
}

/// Build the evidence and scored fields for one parcel analysis.
pub fn collect_evidence(
    parcel_id: &str,
    inputs: AnalysisInputs<'_>,
    recorded_at: DateTime<Utc>,
    inserted_by: &str,
) -> TrackedEvidence {
    let mut collector = Collector {
        parcel_id,
        recorded_at,
        inserted_by,
        ledger: EvidenceLedger::new(),
        scored: Vec::new(),
    };
    collector.regulations(inputs.zone_id, inputs.rules);
    collector.calculation(inputs.calc);
    collector.context(inputs.context);

    TrackedEvidence {
        items: collector.ledger.into_items(),
        scored: collector.scored,
    }
}

// ── Tracker ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PersistenceStatus {
    Persisted {
        evidence_rows: usize,
    },
    /// At least one of the two writes still failed after the last attempt.
    /// A `None` error means that write went through.
    Degraded {
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        evidence_error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        score_error: Option<String>,
    },
}

impl PersistenceStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    /// One line naming each failed write.
    pub fn error_summary(&self) -> Option<String> {
        match self {
            Self::Persisted { .. } => None,
            Self::Degraded {
                evidence_error,
                score_error,
                ..
            } => {
                let parts: Vec<String> = [
                    evidence_error.as_ref().map(|e| format!("evidence: {e}")),
                    score_error.as_ref().map(|e| format!("quality score: {e}")),
                ]
                .into_iter()
                .flatten()
                .collect();
                Some(parts.join("; "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackOutcome {
    pub score: QualityScore,
    pub evidence: Vec<EvidenceItem>,
    pub persistence: PersistenceStatus,
}

pub struct EvidenceTracker {
    evidence: Arc<dyn EvidenceStore>,
    quality: Arc<dyn QualityStore>,
    clock: Arc<dyn Clock>,
    persistence: PersistenceMode,
    store_timeout: Duration,
    analysis_version: String,
    inserted_by: String,
}

impl EvidenceTracker {
    pub fn new(
        evidence: Arc<dyn EvidenceStore>,
        quality: Arc<dyn QualityStore>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            evidence,
            quality,
            clock,
            persistence: config.persistence,
            store_timeout: config.store_timeout(),
            analysis_version: config.analysis_version.clone(),
            inserted_by: DEFAULT_INSERTED_BY.to_string(),
        }
    }

    pub fn with_inserted_by(mut self, inserted_by: impl Into<String>) -> Self {
        self.inserted_by = inserted_by.into();
        self
    }

    pub async fn track(&self, parcel_id: &str, inputs: AnalysisInputs<'_>) -> TrackOutcome {
        let now = self.clock.now();
        let tracked = collect_evidence(parcel_id, inputs, now, &self.inserted_by);
        let score = QualityScore::compute(
            parcel_id,
            inputs.zone_id.map(str::to_string),
            now.date_naive(),
            self.analysis_version.clone(),
            &tracked.scored,
        );

        let persistence = self.persist(parcel_id, &tracked.items, &score).await;
        info!(
            parcel_id,
            score = score.score_global,
            evidence = tracked.items.len(),
            degraded = persistence.is_degraded(),
            "evidence tracked"
        );

        TrackOutcome {
            score,
            evidence: tracked.items,
            persistence,
        }
    }

    /// Evidence and score are written independently; each failed write is
    /// retried on its own until it succeeds or attempts run out.
    async fn persist(
        &self,
        parcel_id: &str,
        items: &[EvidenceItem],
        score: &QualityScore,
    ) -> PersistenceStatus {
        let max_attempts = self.persistence.max_attempts();
        let mut evidence_rows = None;
        let mut evidence_error = None;
        let mut score_written = false;
        let mut score_error = None;

        for attempt in 1..=max_attempts {
            let delay = self.persistence.backoff_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            if evidence_rows.is_none() {
                match bounded(
                    "evidence_store.replace_parcel",
                    self.store_timeout,
                    self.evidence.replace_parcel(parcel_id, items),
                )
                .await
                {
                    Ok(rows) => {
                        evidence_rows = Some(rows);
                        evidence_error = None;
                    }
                    Err(e) => {
                        warn!(parcel_id, attempt, max_attempts, error = %e, "evidence persistence failed");
                        evidence_error = Some(e.to_string());
                    }
                }
            }

            if !score_written {
                match bounded(
                    "quality_store.upsert_score",
                    self.store_timeout,
                    self.quality.upsert_score(score),
                )
                .await
                {
                    Ok(()) => {
                        score_written = true;
                        score_error = None;
                    }
                    Err(e) => {
                        warn!(parcel_id, attempt, max_attempts, error = %e, "quality score persistence failed");
                        score_error = Some(e.to_string());
                    }
                }
            }

            if let (Some(evidence_rows), true) = (evidence_rows, score_written) {
                return PersistenceStatus::Persisted { evidence_rows };
            }
        }

        PersistenceStatus::Degraded {
            attempts: max_attempts,
            evidence_error,
            score_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::BuildCalculator;
    use crate::context::{LayerName, LayerObservation, LayerSpec};
    use crate::memory::{FixedClock, InMemoryEvidenceStore, InMemoryQualityStore};
    use crate::rules::consolidate;
    use crate::types::{RuleDefinition, RuleLevel};
    use chrono::NaiveDate;

    fn rules() -> Vec<ConsolidatedRule> {
        let defs = vec![
            RuleDefinition::new(
                "Z1",
                RegulatedField::UsageIndex,
                FieldValue::Number(0.5),
                RuleLevel::CommunalZoning,
            ),
            RuleDefinition::new(
                "Z1",
                RegulatedField::UsageIndex,
                FieldValue::Number(0.4),
                RuleLevel::CantonalFederal,
            ),
            RuleDefinition::new(
                "Z1",
                RegulatedField::GroundCoverage,
                FieldValue::Number(0.3),
                RuleLevel::CommunalZoning,
            ),
        ];
        consolidate(&defs, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
    }

    fn road_flag() -> ContextFlag {
        LayerSpec::table(25.0)
            .into_iter()
            .find(|s| s.layer == LayerName::RoadsCantonal)
            .unwrap()
            .evaluate(LayerObservation {
                distance_m: Some(10.0),
                ..Default::default()
            })
    }

    #[test]
    fn test_collect_evidence_tiers() {
        let rules = rules();
        let calc = BuildCalculator::default().compute(1000.0, &rules);
        let context = vec![road_flag()];
        let tracked = collect_evidence(
            "P1",
            AnalysisInputs {
                zone_id: Some("Z1"),
                rules: &rules,
                calc: &calc,
                context: &context,
            },
            Utc::now(),
            "test",
        );

        let find = |ref_type: RefType, field: &str, r: Reliability| {
            tracked
                .items
                .iter()
                .filter(|i| i.ref_type == ref_type && i.field == field && i.reliability == r)
                .count()
        };
        assert_eq!(find(RefType::Regulation, "indice_u", Reliability::Direct), 1);
        assert_eq!(find(RefType::Regulation, "indice_u", Reliability::Derived), 1);
        assert_eq!(find(RefType::Regulation, "ibus", Reliability::Missing), 1);
        assert_eq!(find(RefType::Calculation, "ibus", Reliability::Derived), 1);
        assert_eq!(find(RefType::Calculation, "su_m2", Reliability::Derived), 1);
        assert_eq!(
            find(RefType::Calculation, "niveaux_max_est", Reliability::Estimated),
            1
        );
        assert_eq!(
            find(RefType::Context, "roads_cantonal", Reliability::Derived),
            1
        );
        // overridden rule is evidence but not a scored field
        assert_eq!(
            tracked
                .scored
                .iter()
                .filter(|f| f.field == "indice_u")
                .count(),
            1
        );
    }

    #[test]
    fn test_no_rules_records_missing_not_omitted() {
        let calc = BuildCalculator::default().compute(500.0, &[]);
        let tracked = collect_evidence(
            "P1",
            AnalysisInputs {
                zone_id: None,
                rules: &[],
                calc: &calc,
                context: &[],
            },
            Utc::now(),
            "test",
        );
        assert!(tracked
            .items
            .iter()
            .all(|i| i.reliability == Reliability::Missing));
        // 3 core regulation fields + 4 calculation fields
        assert_eq!(tracked.items.len(), 7);
        let score = QualityScore::compute("P1", None, Utc::now().date_naive(), "1.0", &tracked.scored);
        assert_eq!(score.score_global, 0.0);
    }

    #[tokio::test]
    async fn test_track_persists_and_upserts() {
        let evidence = Arc::new(InMemoryEvidenceStore::new());
        let quality = Arc::new(InMemoryQualityStore::new());
        let clock = Arc::new(FixedClock::on(NaiveDate::from_ymd_opt(2025, 5, 1).unwrap()));
        let tracker = EvidenceTracker::new(
            evidence.clone(),
            quality.clone(),
            clock,
            &EngineConfig::default(),
        );
        let rules = rules();
        let calc = BuildCalculator::default().compute(1000.0, &rules);
        let inputs = AnalysisInputs {
            zone_id: Some("Z1"),
            rules: &rules,
            calc: &calc,
            context: &[],
        };

        let first = tracker.track("P1", inputs).await;
        assert!(!first.persistence.is_degraded());
        let stored = evidence.evidence_for_parcel("P1").await.unwrap().len();
        assert_eq!(stored, first.evidence.len());

        let second = tracker.track("P1", inputs).await;
        assert_eq!(evidence.evidence_for_parcel("P1").await.unwrap().len(), stored);
        assert_eq!(quality.history("P1").await.unwrap().len(), 1);
        assert_eq!(first.score, second.score);
    }

    #[tokio::test]
    async fn test_track_degrades_on_store_failure() {
        let evidence = Arc::new(InMemoryEvidenceStore::new());
        evidence.set_failing(true);
        let quality = Arc::new(InMemoryQualityStore::new());
        let config = EngineConfig {
            persistence: PersistenceMode::RetryWithBackoff {
                max_attempts: 2,
                initial_backoff_ms: 1,
            },
            ..EngineConfig::default()
        };
        let tracker = EvidenceTracker::new(
            evidence,
            quality.clone(),
            Arc::new(FixedClock::on(NaiveDate::from_ymd_opt(2025, 5, 1).unwrap())),
            &config,
        );
        let calc = BuildCalculator::default().compute(500.0, &[]);
        let outcome = tracker
            .track(
                "P1",
                AnalysisInputs {
                    zone_id: None,
                    rules: &[],
                    calc: &calc,
                    context: &[],
                },
            )
            .await;
        match &outcome.persistence {
            PersistenceStatus::Degraded {
                attempts,
                evidence_error,
                score_error,
            } => {
                assert_eq!(*attempts, 2);
                assert!(evidence_error.is_some());
                assert_eq!(*score_error, None);
            }
            other => panic!("expected degraded, got {other:?}"),
        }
        assert_eq!(outcome.score.score_global, 0.0);
        // The score row is written even though the evidence write failed.
        assert_eq!(quality.history("P1").await.unwrap().len(), 1);
        assert!(outcome
            .persistence
            .error_summary()
            .unwrap()
            .starts_with("evidence: "));
    }

    #[tokio::test]
    async fn test_track_reports_score_failure_separately() {
        let evidence = Arc::new(InMemoryEvidenceStore::new());
        let quality = Arc::new(InMemoryQualityStore::new());
        quality.set_failing(true);
        let tracker = EvidenceTracker::new(
            evidence.clone(),
            quality,
            Arc::new(FixedClock::on(NaiveDate::from_ymd_opt(2025, 5, 1).unwrap())),
            &EngineConfig::default(),
        );
        let calc = BuildCalculator::default().compute(500.0, &[]);
        let outcome = tracker
            .track(
                "P1",
                AnalysisInputs {
                    zone_id: None,
                    rules: &[],
                    calc: &calc,
                    context: &[],
                },
            )
            .await;

        match &outcome.persistence {
            PersistenceStatus::Degraded {
                evidence_error,
                score_error,
                ..
            } => {
                assert_eq!(*evidence_error, None);
                assert!(score_error.is_some());
            }
            other => panic!("expected degraded, got {other:?}"),
        }
        assert_eq!(
            evidence.evidence_for_parcel("P1").await.unwrap().len(),
            outcome.evidence.len()
        );
    }

    #[tokio::test]
    async fn test_retrack_drops_missing_row_once_rule_exists() {
        let evidence = Arc::new(InMemoryEvidenceStore::new());
        let tracker = EvidenceTracker::new(
            evidence.clone(),
            Arc::new(InMemoryQualityStore::new()),
            Arc::new(FixedClock::on(NaiveDate::from_ymd_opt(2025, 5, 1).unwrap())),
            &EngineConfig::default(),
        );
        let before = rules();
        let calc = BuildCalculator::default().compute(1000.0, &before);
        tracker
            .track(
                "P1",
                AnalysisInputs {
                    zone_id: Some("Z1"),
                    rules: &before,
                    calc: &calc,
                    context: &[],
                },
            )
            .await;
        let missing_ibus = |items: &[EvidenceItem]| {
            items
                .iter()
                .any(|i| i.field == "ibus" && i.reliability == Reliability::Missing)
        };
        assert!(missing_ibus(&evidence.evidence_for_parcel("P1").await.unwrap()));

        let mut defs = vec![RuleDefinition::new(
            "Z1",
            RegulatedField::FloorAreaRatio,
            FieldValue::Number(0.7),
            RuleLevel::CommunalZoning,
        )];
        defs.push(RuleDefinition::new(
            "Z1",
            RegulatedField::UsageIndex,
            FieldValue::Number(0.5),
            RuleLevel::CommunalZoning,
        ));
        let after = consolidate(&defs, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        let calc = BuildCalculator::default().compute(1000.0, &after);
        let outcome = tracker
            .track(
                "P1",
                AnalysisInputs {
                    zone_id: Some("Z1"),
                    rules: &after,
                    calc: &calc,
                    context: &[],
                },
            )
            .await;

        let stored = evidence.evidence_for_parcel("P1").await.unwrap();
        assert!(!missing_ibus(&stored));
        assert_eq!(stored.len(), outcome.evidence.len());
        let since = Utc::now() - chrono::Duration::days(3650);
        let missing = evidence.missing_fields_since(since).await.unwrap();
        assert!(!missing.iter().any(|f| f == "ibus"));
    }
}
