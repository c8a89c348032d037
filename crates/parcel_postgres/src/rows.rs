//! Row shapes read back from Postgres and their conversion into core types.

use std::collections::BTreeMap;

use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use parcel_core::error::ParcelError;
use parcel_core::evidence::{EvidenceItem, RefType, Reliability};
use parcel_core::quality::QualityScore;
use parcel_core::types::{FieldValue, RegulatedField, RuleDefinition, RuleLevel, ValidityWindow};

#[derive(Debug, FromRow)]
pub(crate) struct PgRuleRow {
    pub id: Uuid,
    pub zone_id: String,
    pub field: String,
    pub num_value: Option<f64>,
    pub text_value: Option<String>,
    pub json_value: Option<serde_json::Value>,
    pub level: String,
    pub description: Option<String>,
    pub validity_from: Option<NaiveDate>,
    pub validity_to: Option<NaiveDate>,
    pub source_id: Option<Uuid>,
    pub article_ref: Option<String>,
}

impl TryFrom<PgRuleRow> for RuleDefinition {
    type Error = String;

    fn try_from(row: PgRuleRow) -> Result<Self, Self::Error> {
        let field = RegulatedField::from_key(&row.field)
            .ok_or_else(|| format!("rule {}: unknown field '{}'", row.id, row.field))?;
        let level = RuleLevel::from_str(&row.level)
            .ok_or_else(|| format!("rule {}: unknown level '{}'", row.id, row.level))?;
        let value = FieldValue::from_columns(row.num_value, row.text_value, row.json_value)
            .ok_or_else(|| format!("rule {}: no value", row.id))?;
        Ok(RuleDefinition {
            id: row.id,
            zone_id: row.zone_id,
            field,
            value,
            level,
            description: row.description,
            validity: ValidityWindow {
                from: row.validity_from,
                to: row.validity_to,
            },
            source_id: row.source_id,
            article_ref: row.article_ref,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct PgLayerRow {
    pub value_text: Option<String>,
    pub value_num: Option<f64>,
    pub metadata: serde_json::Value,
    pub intersects: bool,
    pub distance_m: f64,
}

#[derive(Debug, FromRow)]
pub(crate) struct PgEvidenceRow {
    pub ref_type: String,
    pub ref_id: String,
    pub parcel_id: String,
    pub field: String,
    pub num_value: Option<f64>,
    pub text_value: Option<String>,
    pub json_value: Option<serde_json::Value>,
    pub reliability: String,
    pub source_path: String,
    pub comment: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub inserted_by: String,
    pub recorded_at: DateTime<Utc>,
}

impl TryFrom<PgEvidenceRow> for EvidenceItem {
    type Error = String;

    fn try_from(row: PgEvidenceRow) -> Result<Self, Self::Error> {
        let ref_type = RefType::from_str(&row.ref_type)
            .ok_or_else(|| format!("unknown ref_type '{}'", row.ref_type))?;
        let reliability = Reliability::from_str(&row.reliability)
            .ok_or_else(|| format!("unknown reliability '{}'", row.reliability))?;
        Ok(EvidenceItem {
            ref_type,
            ref_id: (!row.ref_id.is_empty()).then_some(row.ref_id),
            parcel_id: row.parcel_id,
            field: row.field,
            value: FieldValue::from_columns(row.num_value, row.text_value, row.json_value),
            reliability,
            source_path: row.source_path,
            comment: row.comment,
            metadata: row.metadata.unwrap_or(serde_json::Value::Null),
            inserted_by: row.inserted_by,
            recorded_at: row.recorded_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct PgQualityRow {
    pub parcel_id: String,
    pub calc_date: NaiveDate,
    pub zone_id: Option<String>,
    pub score_global: f64,
    pub score_regulations: Option<f64>,
    pub score_context: Option<f64>,
    pub score_calculations: Option<f64>,
    pub total_fields: i32,
    pub direct_count: i32,
    pub derived_count: i32,
    pub estimated_count: i32,
    pub missing_count: i32,
    pub details: serde_json::Value,
    pub analysis_version: String,
}

fn count(n: i32) -> usize {
    usize::try_from(n).unwrap_or(0)
}

impl TryFrom<PgQualityRow> for QualityScore {
    type Error = ParcelError;

    fn try_from(row: PgQualityRow) -> Result<Self, Self::Error> {
        let details: BTreeMap<String, f64> =
            serde_json::from_value(row.details).map_err(|e| anyhow!(e))?;
        Ok(QualityScore {
            parcel_id: row.parcel_id,
            zone_id: row.zone_id,
            calc_date: row.calc_date,
            score_global: row.score_global,
            score_regulations: row.score_regulations,
            score_context: row.score_context,
            score_calculations: row.score_calculations,
            total_fields: count(row.total_fields),
            direct_count: count(row.direct_count),
            derived_count: count(row.derived_count),
            estimated_count: count(row.estimated_count),
            missing_count: count(row.missing_count),
            details,
            analysis_version: row.analysis_version,
        })
    }
}
