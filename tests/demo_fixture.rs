//! The shipped demo fixture and config file stay loadable.

use std::path::Path;

use parcel_core::{AnalysisRequest, LayerName, RuleQuery};
use parcel_engine::{backend, AppConfig};
use pretty_assertions::assert_eq;

const DEMO_FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/demo_parcel.yaml");
const DEMO_CONFIG: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/config/parcel.yaml");

#[test]
fn test_shipped_config_parses() {
    let config = AppConfig::from_file(Path::new(DEMO_CONFIG)).unwrap();
    assert_eq!(config.engine.context_max_flags, 5);
    assert_eq!(config.engine.context_cache_ttl_days, 30);
}

#[tokio::test]
async fn test_demo_parcel_analysis() {
    let backend = backend::from_fixture(Path::new(DEMO_FIXTURE), &AppConfig::default())
        .await
        .unwrap();
    let parcel = backend.known_parcel("6266-1234").unwrap().clone();

    let report = backend
        .analyzer
        .analyze(AnalysisRequest::new(parcel.id, parcel.geometry))
        .await
        .unwrap();

    assert_eq!(report.zone_id.as_deref(), Some("SION-R2"));
    assert_eq!(report.calc.su_m2, Some(500.0));
    assert_eq!(report.calc.emprise_m2, Some(300.0));
    assert!(report.context.len() <= 5);
    assert!(report.context.iter().any(|f| f.layer == LayerName::OpbNoise));
    assert!(!report.degraded.any());
}

#[tokio::test]
async fn test_demo_parcel_with_supplied_zone_and_area() {
    let backend = backend::from_fixture(Path::new(DEMO_FIXTURE), &AppConfig::default())
        .await
        .unwrap();
    let parcel = backend.known_parcel("6266-5678").unwrap();
    assert_eq!(parcel.zone_id.as_deref(), Some("SION-R2"));

    let request = AnalysisRequest::new(&parcel.id, &parcel.geometry)
        .with_zone("SION-R2")
        .with_area(912.0);
    let report = backend.analyzer.analyze(request).await.unwrap();
    assert_eq!(report.area_m2, Some(912.0));
    assert_eq!(report.calc.su_m2, Some(456.0));
}

#[tokio::test]
async fn test_demo_rules_for_zone() {
    let backend = backend::from_fixture(Path::new(DEMO_FIXTURE), &AppConfig::default())
        .await
        .unwrap();
    let resolution = backend
        .analyzer
        .resolve_rules(&RuleQuery::Zone("SION-R2".into()))
        .await
        .unwrap();
    // indice_u is defined twice; LEVEL3 wins over LEVEL4.
    assert_eq!(resolution.rules.len(), 6);
    let indice = resolution
        .rules
        .iter()
        .find(|r| r.field.key() == "indice_u")
        .unwrap();
    assert_eq!(indice.overridden.len(), 1);
}

#[tokio::test]
async fn test_parcel_outside_every_zone() {
    let backend = backend::from_fixture(Path::new(DEMO_FIXTURE), &AppConfig::default())
        .await
        .unwrap();
    let parcel = backend.known_parcel("6266-9999").unwrap().clone();
    let report = backend
        .analyzer
        .analyze(AnalysisRequest::new(parcel.id, parcel.geometry))
        .await
        .unwrap();
    assert_eq!(report.zone_id, None);
    assert_eq!(report.calc.su_m2, None);
    assert_eq!(report.calc.reliability, 0.25);
}
