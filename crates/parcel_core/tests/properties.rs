//! Property tests for the pure parts of the pipeline.

use chrono::NaiveDate;
use parcel_core::calculator::BuildCalculator;
use parcel_core::context::{sort_flags, LayerObservation, LayerSpec};
use parcel_core::conversion::{IbusConversion, ValaisConversionTable};
use parcel_core::quality::{Category, QualityScore, ScoredField};
use parcel_core::rules::consolidate;
use parcel_core::tracker::collect_evidence;
use parcel_core::{
    AnalysisInputs, FieldValue, RegulatedField, Reliability, RuleDefinition, RuleLevel,
};
use proptest::prelude::*;
use strum::IntoEnumIterator;

// -- Strategy helpers --

fn arb_level() -> impl Strategy<Value = RuleLevel> {
    prop::sample::select(RuleLevel::ALL.to_vec())
}

fn arb_field() -> impl Strategy<Value = RegulatedField> {
    prop::sample::select(RegulatedField::iter().collect::<Vec<_>>())
}

fn arb_definition() -> impl Strategy<Value = RuleDefinition> {
    (
        prop::sample::select(vec!["Z1", "Z2"]),
        arb_field(),
        0.05f64..1.5,
        arb_level(),
    )
        .prop_map(|(zone, field, value, level)| {
            RuleDefinition::new(zone, field, FieldValue::Number(value), level)
        })
}

fn arb_reliability() -> impl Strategy<Value = Reliability> {
    prop::sample::select(Reliability::ALL.to_vec())
}

fn arb_scored() -> impl Strategy<Value = ScoredField> {
    (
        prop::sample::select(vec![
            Category::Regulations,
            Category::Context,
            Category::Calculations,
        ]),
        prop::sample::select(vec![
            "indice_u",
            "ibus",
            "su_m2",
            "emprise_m2",
            "niveaux_max_est",
            "opb_noise",
        ]),
        arb_reliability(),
    )
        .prop_map(|(c, f, r)| ScoredField::new(c, f, r))
}

fn as_of() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
}

proptest! {
    #[test]
    fn conversion_is_monotonic(a in 0.0f64..2.0, b in 0.0f64..2.0) {
        let table = ValaisConversionTable::default();
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(table.convert(lo).value <= table.convert(hi).value + 1e-9);
    }

    #[test]
    fn conversion_never_below_floor(u in 0.0f64..3.0) {
        let table = ValaisConversionTable::default();
        prop_assert!(table.convert(u).value >= 0.5 - 1e-9);
    }

    /// Every output field comes from an input definition, with the
    /// highest-priority level and all competitors listed as overridden.
    #[test]
    fn consolidation_picks_highest_level(defs in prop::collection::vec(arb_definition(), 0..24)) {
        let rules = consolidate(&defs, as_of());
        for rule in &rules {
            let competing: Vec<&RuleDefinition> = defs
                .iter()
                .filter(|d| d.zone_id == rule.zone_id && d.field == rule.field)
                .collect();
            prop_assert!(!competing.is_empty());
            let best = competing.iter().map(|d| d.level).min().unwrap();
            prop_assert_eq!(rule.level, best);
            prop_assert_eq!(rule.overridden.len(), competing.len() - 1);
            prop_assert!(rule.overridden.iter().all(|o| o.level >= rule.level));
        }
        let groups: std::collections::BTreeSet<(String, RegulatedField)> = defs
            .iter()
            .map(|d| (d.zone_id.clone(), d.field))
            .collect();
        prop_assert_eq!(rules.len(), groups.len());
    }

    #[test]
    fn consolidation_is_order_independent(defs in prop::collection::vec(arb_definition(), 0..16)) {
        let mut reversed = defs.clone();
        reversed.reverse();
        prop_assert_eq!(consolidate(&defs, as_of()), consolidate(&reversed, as_of()));
    }

    #[test]
    fn calculator_is_deterministic_and_bounded(
        area in -100.0f64..5000.0,
        defs in prop::collection::vec(arb_definition(), 0..12),
    ) {
        let rules = consolidate(&defs, as_of());
        let rules: Vec<_> = rules.into_iter().filter(|r| r.zone_id == "Z1").collect();
        let calculator = BuildCalculator::default();
        let first = calculator.compute(area, &rules);
        let second = calculator.compute(area, &rules);
        prop_assert_eq!(&first, &second);

        prop_assert!([0.25, 0.5, 0.75, 1.0].contains(&first.reliability));
        if area <= 0.0 {
            prop_assert!(first.is_fatal());
            prop_assert!(first.su_m2.is_none() && first.ibus_m2.is_none());
            prop_assert!(first.emprise_m2.is_none() && first.niveaux_max_est.is_none());
        }
    }

    #[test]
    fn quality_score_is_bounded(fields in prop::collection::vec(arb_scored(), 0..20)) {
        let score = QualityScore::compute("P", None, as_of(), "1.0", &fields);
        prop_assert!((0.0..=1.0).contains(&score.score_global));
        prop_assert_eq!(
            score.direct_count + score.derived_count + score.estimated_count + score.missing_count,
            fields.len()
        );
        for value in [score.score_regulations, score.score_context, score.score_calculations]
            .into_iter()
            .flatten()
        {
            prop_assert!((0.0..=1.0).contains(&value));
        }
    }

    /// Evidence never claims a value it did not receive: missing items
    /// carry no value, and every regulation item points at a rule.
    #[test]
    fn evidence_has_no_fabricated_values(
        area in 1.0f64..5000.0,
        defs in prop::collection::vec(arb_definition(), 0..12),
    ) {
        let rules: Vec<_> = consolidate(&defs, as_of())
            .into_iter()
            .filter(|r| r.zone_id == "Z1")
            .collect();
        let calc = BuildCalculator::default().compute(area, &rules);
        let tracked = collect_evidence(
            "P",
            AnalysisInputs { zone_id: Some("Z1"), rules: &rules, calc: &calc, context: &[] },
            chrono::Utc::now(),
            "prop",
        );
        for item in &tracked.items {
            if item.reliability == Reliability::Missing {
                prop_assert!(item.value.is_none());
            } else {
                prop_assert!(item.value.is_some());
            }
        }
        for field in RegulatedField::CORE {
            let present = rules.iter().any(|r| r.field == field);
            let missing = tracked.items.iter().any(|i| {
                i.field == field.key() && i.reliability == Reliability::Missing
            });
            prop_assert_eq!(present, !missing);
        }
    }

    #[test]
    fn flags_sorted_by_severity_then_name(slopes in prop::collection::vec(0.0f64..80.0, 1..5)) {
        let specs = LayerSpec::table(25.0);
        let mut flags: Vec<_> = specs
            .iter()
            .zip(slopes.iter().cycle())
            .map(|(spec, slope)| spec.evaluate(LayerObservation {
                intersects: true,
                value_num: Some(*slope),
                value_text: Some("DS IV".to_string()),
                ..Default::default()
            }))
            .collect();
        sort_flags(&mut flags);
        for pair in flags.windows(2) {
            prop_assert!(
                pair[0].severity > pair[1].severity
                    || (pair[0].severity == pair[1].severity && pair[0].layer <= pair[1].layer)
            );
        }
    }
}
