//! Postgres implementations of all parcel_core port traits.
//!
//! Each adapter is a newtype wrapping PgPool. All SQL is runtime-checked
//! (sqlx::query, not sqlx::query!) so builds never need a live database.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use parcel_core::context::{CachedLayer, CheckKind, ContextFlag, LayerName, LayerObservation};
use parcel_core::error::ParcelError;
use parcel_core::evidence::EvidenceItem;
use parcel_core::geometry::{Geometry, DEFAULT_SRID};
use parcel_core::ports::{
    ContextCache, EvidenceStore, LayerProbe, QualityStore, Result, RuleStore,
};
use parcel_core::quality::QualityScore;
use parcel_core::types::RuleDefinition;

use crate::rows::{PgEvidenceRow, PgLayerRow, PgQualityRow, PgRuleRow};

/// Pool exhaustion and connection loss are transient; everything else is internal.
pub(crate) fn db_error(e: sqlx::Error) -> ParcelError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            ParcelError::Unavailable(e.to_string())
        }
        sqlx::Error::RowNotFound => ParcelError::NotFound(e.to_string()),
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            ParcelError::Conflict(db.message().to_string())
        }
        other => ParcelError::Internal(anyhow!(other)),
    }
}

fn srid(geometry: &Geometry) -> i32 {
    geometry.srid.unwrap_or(DEFAULT_SRID)
}

// ── PgRuleStore ───────────────────────────────────────────────

pub struct PgRuleStore {
    pool: PgPool,
}

impl PgRuleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RuleStore for PgRuleStore {
    async fn rules_for_zone(&self, zone_id: &str) -> Result<Vec<RuleDefinition>> {
        let rows = sqlx::query_as::<_, PgRuleRow>(
            r#"
            SELECT id, zone_id, field, num_value, text_value, json_value,
                   level, description, validity_from, validity_to,
                   source_id, article_ref
            FROM rule_definitions
            WHERE zone_id = $1
            ORDER BY field, level, id
            "#,
        )
        .bind(zone_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let mut definitions = Vec::with_capacity(rows.len());
        for row in rows {
            match RuleDefinition::try_from(row) {
                Ok(def) => definitions.push(def),
                Err(reason) => warn!(zone_id, %reason, "skipping unreadable rule definition"),
            }
        }
        Ok(definitions)
    }

    async fn zones_intersecting(&self, geometry: &Geometry) -> Result<Vec<String>> {
        let zones = sqlx::query_scalar::<_, String>(
            r#"
            SELECT zone_id
            FROM zones
            WHERE ST_Intersects(geom, ST_GeomFromText($1, $2))
            ORDER BY zone_id
            "#,
        )
        .bind(geometry.to_wkt())
        .bind(srid(geometry))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(zones)
    }

    async fn insert_rules(&self, rules: &[RuleDefinition]) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        for rule in rules {
            let (num, text, json) = rule.value.to_columns();
            sqlx::query(
                r#"
                INSERT INTO rule_definitions (
                    id, zone_id, field, num_value, text_value, json_value,
                    level, description, validity_from, validity_to,
                    source_id, article_ref
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(rule.id)
            .bind(&rule.zone_id)
            .bind(rule.field.key())
            .bind(num)
            .bind(text)
            .bind(json)
            .bind(rule.level.as_str())
            .bind(&rule.description)
            .bind(rule.validity.from)
            .bind(rule.validity.to)
            .bind(rule.source_id)
            .bind(&rule.article_ref)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }
        tx.commit().await.map_err(db_error)?;
        Ok(rules.len())
    }

    async fn close_validity(&self, rule_id: Uuid, to: NaiveDate) -> Result<()> {
        let from = sqlx::query_scalar::<_, Option<NaiveDate>>(
            "SELECT validity_from FROM rule_definitions WHERE id = $1",
        )
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or_else(|| ParcelError::NotFound(format!("rule {rule_id}")))?;

        if from.is_some_and(|from| to < from) {
            return Err(ParcelError::InvalidInput(format!(
                "rule {rule_id}: validity cannot end before it starts"
            )));
        }

        sqlx::query("UPDATE rule_definitions SET validity_to = $2 WHERE id = $1")
            .bind(rule_id)
            .bind(to)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

// ── PgLayerProbe ──────────────────────────────────────────────

/// PostGIS lookups against `context_layers`.
pub struct PgLayerProbe {
    pool: PgPool,
}

impl PgLayerProbe {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const NEAREST_FEATURE_SQL: &str = r#"
    WITH parcel AS (SELECT ST_GeomFromText($2, $3) AS g)
    SELECT cl.value_text, cl.value_num, cl.metadata,
           ST_Intersects(cl.geom, parcel.g) AS intersects,
           ST_Distance(cl.geom, parcel.g) AS distance_m
    FROM context_layers cl, parcel
    WHERE cl.layer = $1
    ORDER BY ST_Intersects(cl.geom, parcel.g) DESC, ST_Distance(cl.geom, parcel.g) ASC
    LIMIT 1
"#;

const INTERSECTING_FEATURE_SQL: &str = r#"
    WITH parcel AS (SELECT ST_GeomFromText($2, $3) AS g)
    SELECT cl.value_text, cl.value_num, cl.metadata,
           true AS intersects,
           0.0::double precision AS distance_m
    FROM context_layers cl, parcel
    WHERE cl.layer = $1
      AND ST_Intersects(cl.geom, parcel.g)
    LIMIT 1
"#;

const RASTER_CELL_SQL: &str = r#"
    WITH parcel AS (SELECT ST_Centroid(ST_GeomFromText($2, $3)) AS c)
    SELECT cl.value_text, cl.value_num, cl.metadata,
           true AS intersects,
           0.0::double precision AS distance_m
    FROM context_layers cl, parcel
    WHERE cl.layer = $1
      AND ST_Contains(cl.geom, parcel.c)
    LIMIT 1
"#;

#[async_trait]
impl LayerProbe for PgLayerProbe {
    async fn probe(
        &self,
        layer: LayerName,
        check: CheckKind,
        geometry: &Geometry,
    ) -> Result<Option<LayerObservation>> {
        let sql = match check {
            CheckKind::Intersect => INTERSECTING_FEATURE_SQL,
            CheckKind::Distance { .. } => NEAREST_FEATURE_SQL,
            CheckKind::Raster => RASTER_CELL_SQL,
        };
        let row = sqlx::query_as::<_, PgLayerRow>(sql)
            .bind(layer.as_str())
            .bind(geometry.to_wkt())
            .bind(srid(geometry))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(row.map(|r| {
            let (intersects, distance_m) = match check {
                CheckKind::Intersect => (true, None),
                CheckKind::Distance { .. } => (r.distance_m == 0.0, Some(r.distance_m)),
                CheckKind::Raster => (true, None),
            };
            LayerObservation {
                intersects,
                value_text: r.value_text,
                value_num: r.value_num,
                distance_m,
                metadata: r.metadata,
            }
        }))
    }
}

// ── PgContextCache ────────────────────────────────────────────

/// `parcel_context` table, one row per (parcel, layer).
pub struct PgContextCache {
    pool: PgPool,
}

impl PgContextCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContextCache for PgContextCache {
    async fn get(&self, parcel_id: &str, layer: LayerName) -> Result<Option<CachedLayer>> {
        let row = sqlx::query_as::<_, (serde_json::Value, DateTime<Utc>)>(
            "SELECT flag, computed_at FROM parcel_context WHERE parcel_id = $1 AND layer = $2",
        )
        .bind(parcel_id)
        .bind(layer.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        let Some((flag, computed_at)) = row else {
            return Ok(None);
        };
        match serde_json::from_value::<ContextFlag>(flag) {
            Ok(flag) => Ok(Some(CachedLayer {
                layer,
                flag,
                computed_at,
            })),
            Err(e) => {
                // stale row shape; treat as a miss and let the next put overwrite it
                debug!(parcel_id, layer = %layer, error = %e, "unreadable cached flag");
                Ok(None)
            }
        }
    }

    async fn put(&self, parcel_id: &str, entry: CachedLayer) -> Result<()> {
        let flag = serde_json::to_value(&entry.flag).map_err(|e| anyhow!(e))?;
        sqlx::query(
            r#"
            INSERT INTO parcel_context (parcel_id, layer, flag, computed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (parcel_id, layer)
            DO UPDATE SET flag = EXCLUDED.flag, computed_at = EXCLUDED.computed_at
            "#,
        )
        .bind(parcel_id)
        .bind(entry.layer.as_str())
        .bind(flag)
        .bind(entry.computed_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM parcel_context WHERE computed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected())
    }
}

// ── PgEvidenceStore ───────────────────────────────────────────

pub struct PgEvidenceStore {
    pool: PgPool,
}

impl PgEvidenceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn upsert_evidence(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    items: &[EvidenceItem],
) -> Result<()> {
    for item in items {
        let (num, text, json) = match &item.value {
            Some(value) => value.to_columns(),
            None => (None, None, None),
        };
        sqlx::query(
            r#"
            INSERT INTO evidence_items (
                ref_type, ref_id, parcel_id, field,
                num_value, text_value, json_value,
                reliability, source_path, comment, metadata,
                inserted_by, recorded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (ref_type, ref_id, field, parcel_id) DO UPDATE SET
                num_value = EXCLUDED.num_value,
                text_value = EXCLUDED.text_value,
                json_value = EXCLUDED.json_value,
                reliability = EXCLUDED.reliability,
                source_path = EXCLUDED.source_path,
                comment = EXCLUDED.comment,
                metadata = EXCLUDED.metadata,
                inserted_by = EXCLUDED.inserted_by,
                recorded_at = EXCLUDED.recorded_at
            "#,
        )
        .bind(item.ref_type.as_str())
        .bind(item.ref_id.as_deref().unwrap_or(""))
        .bind(&item.parcel_id)
        .bind(&item.field)
        .bind(num)
        .bind(text)
        .bind(json)
        .bind(item.reliability.as_str())
        .bind(&item.source_path)
        .bind(&item.comment)
        .bind(&item.metadata)
        .bind(&item.inserted_by)
        .bind(item.recorded_at)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
    }
    Ok(())
}

#[async_trait]
impl EvidenceStore for PgEvidenceStore {
    async fn upsert_batch(&self, items: &[EvidenceItem]) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        upsert_evidence(&mut tx, items).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(items.len())
    }

    async fn replace_parcel(&self, parcel_id: &str, items: &[EvidenceItem]) -> Result<usize> {
        let items: Vec<EvidenceItem> = items
            .iter()
            .filter(|i| i.parcel_id == parcel_id)
            .cloned()
            .collect();
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        sqlx::query("DELETE FROM evidence_items WHERE parcel_id = $1")
            .bind(parcel_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        upsert_evidence(&mut tx, &items).await?;
        tx.commit().await.map_err(db_error)?;
        Ok(items.len())
    }

    async fn evidence_for_parcel(&self, parcel_id: &str) -> Result<Vec<EvidenceItem>> {
        let rows = sqlx::query_as::<_, PgEvidenceRow>(
            r#"
            SELECT ref_type, ref_id, parcel_id, field,
                   num_value, text_value, json_value,
                   reliability, source_path, comment, metadata,
                   inserted_by, recorded_at
            FROM evidence_items
            WHERE parcel_id = $1
            ORDER BY ref_type, ref_id, field
            "#,
        )
        .bind(parcel_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter()
            .map(|r| {
                EvidenceItem::try_from(r).map_err(|e: String| ParcelError::Internal(anyhow!(e)))
            })
            .collect()
    }

    async fn purge_parcel(&self, parcel_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM evidence_items WHERE parcel_id = $1")
            .bind(parcel_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected())
    }

    async fn missing_fields_since(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT field
            FROM evidence_items
            WHERE reliability = 'missing'
              AND recorded_at >= $1
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)
    }
}

// ── PgQualityStore ────────────────────────────────────────────

pub struct PgQualityStore {
    pool: PgPool,
}

impl PgQualityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const QUALITY_COLUMNS: &str = r#"
    parcel_id, calc_date, zone_id, score_global,
    score_regulations, score_context, score_calculations,
    total_fields, direct_count, derived_count, estimated_count, missing_count,
    details, analysis_version
"#;

fn as_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[async_trait]
impl QualityStore for PgQualityStore {
    async fn upsert_score(&self, score: &QualityScore) -> Result<()> {
        let details = serde_json::to_value(&score.details).map_err(|e| anyhow!(e))?;
        sqlx::query(
            r#"
            INSERT INTO quality_scores (
                parcel_id, calc_date, zone_id, score_global,
                score_regulations, score_context, score_calculations,
                total_fields, direct_count, derived_count, estimated_count, missing_count,
                details, analysis_version, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, now())
            ON CONFLICT (parcel_id, calc_date) DO UPDATE SET
                zone_id = EXCLUDED.zone_id,
                score_global = EXCLUDED.score_global,
                score_regulations = EXCLUDED.score_regulations,
                score_context = EXCLUDED.score_context,
                score_calculations = EXCLUDED.score_calculations,
                total_fields = EXCLUDED.total_fields,
                direct_count = EXCLUDED.direct_count,
                derived_count = EXCLUDED.derived_count,
                estimated_count = EXCLUDED.estimated_count,
                missing_count = EXCLUDED.missing_count,
                details = EXCLUDED.details,
                analysis_version = EXCLUDED.analysis_version,
                updated_at = now()
            "#,
        )
        .bind(&score.parcel_id)
        .bind(score.calc_date)
        .bind(&score.zone_id)
        .bind(score.score_global)
        .bind(score.score_regulations)
        .bind(score.score_context)
        .bind(score.score_calculations)
        .bind(as_i32(score.total_fields))
        .bind(as_i32(score.direct_count))
        .bind(as_i32(score.derived_count))
        .bind(as_i32(score.estimated_count))
        .bind(as_i32(score.missing_count))
        .bind(details)
        .bind(&score.analysis_version)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn history(&self, parcel_id: &str) -> Result<Vec<QualityScore>> {
        let query = format!(
            "SELECT {QUALITY_COLUMNS} FROM quality_scores WHERE parcel_id = $1 ORDER BY calc_date"
        );
        let rows = sqlx::query_as::<_, PgQualityRow>(&query)
            .bind(parcel_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.into_iter().map(QualityScore::try_from).collect()
    }

    async fn scores_since(&self, since: NaiveDate) -> Result<Vec<QualityScore>> {
        let query = format!(
            "SELECT {QUALITY_COLUMNS} FROM quality_scores WHERE calc_date >= $1 ORDER BY calc_date, parcel_id"
        );
        let rows = sqlx::query_as::<_, PgQualityRow>(&query)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.into_iter().map(QualityScore::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_unavailable() {
        assert!(matches!(
            db_error(sqlx::Error::PoolTimedOut),
            ParcelError::Unavailable(_)
        ));
        assert!(matches!(
            db_error(sqlx::Error::PoolClosed),
            ParcelError::Unavailable(_)
        ));
    }

    #[test]
    fn test_other_errors_are_internal() {
        assert!(matches!(
            db_error(sqlx::Error::Protocol("bad frame".into())),
            ParcelError::Internal(_)
        ));
        assert!(matches!(
            db_error(sqlx::Error::RowNotFound),
            ParcelError::NotFound(_)
        ));
    }
}
