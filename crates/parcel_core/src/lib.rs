//! parcel_core: regulation resolution and evidence-scored buildability
//! analysis for land parcels.
//!
//! Pure domain logic plus port traits. Storage lives behind the traits in
//! [`ports`]; `parcel_postgres` implements them for PostGIS and [`memory`]
//! implements them in process.

pub mod calculator;
pub mod config;
pub mod context;
pub mod conversion;
pub mod error;
pub mod evidence;
pub mod fixture;
pub mod geometry;
pub mod memory;
pub mod ports;
pub mod quality;
pub mod rules;
pub mod service;
pub mod tracker;
pub mod types;

pub use calculator::{BuildCalculator, CalcOutput, ControlCode, ControlLevel, ControlMessage};
pub use config::{EngineConfig, PersistenceMode};
pub use context::{CheckKind, ContextFlag, ContextResolver, LayerName, Severity};
pub use error::ParcelError;
pub use evidence::{EvidenceItem, RefType, Reliability};
pub use geometry::Geometry;
pub use quality::{QualityReport, QualityScore};
pub use rules::{RuleQuery, RuleResolver, ZoneResolution};
pub use service::{AnalysisReport, AnalysisRequest, AnalyzerPorts, ParcelAnalyzer};
pub use tracker::{AnalysisInputs, EvidenceTracker, PersistenceStatus};
pub use types::{ConsolidatedRule, FieldValue, RegulatedField, RuleDefinition, RuleLevel};
