use moka::future::Cache;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::cache_integrity::SealedEntry;
use crate::db_storage::{AssessmentStorage, OpportunityStore, SnapshotStorage};
use crate::errors::{AppError, ResultExt};
use crate::handlers::AppState;
use crate::kpi::{self, KpiBasis, KpiKind, KpiScope, KpiValue, Period};
use crate::models::{PrescriptionFact, QuotaRow};
use crate::scoring::{self, Assessment, ScoringConfig};

/// Where an assessment was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssessmentBasis {
    Cache,
    Computed,
}

impl AssessmentBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssessmentBasis::Cache => "cache",
            AssessmentBasis::Computed => "computed",
        }
    }
}

/// Qualification assessment lookup with read-through caching.
///
/// Assessments are derived data: the pillar texts on the opportunity row are
/// the source of truth and the cached `Arc<Assessment>` is dropped whenever
/// the opportunity changes (pillar edits, stage moves, CRM events).
pub struct AssessmentService {
    store: OpportunityStore,
    storage: AssessmentStorage,
    cache: Cache<Uuid, Arc<Assessment>>,
    scoring: ScoringConfig,
}

impl AssessmentService {
    pub fn new(state: &AppState) -> Self {
        Self {
            store: OpportunityStore::new(state.db.clone()),
            storage: AssessmentStorage::new(state.db.clone()),
            cache: state.assessment_cache.clone(),
            scoring: state.scoring.clone(),
        }
    }

    /// Returns the assessment for one opportunity, serving the cached object
    /// when present and fresh.
    ///
    /// `force` skips the cache read and recomputes from the stored pillar
    /// texts. Cache entries are shared `Arc`s: repeated calls within the
    /// cache TTL hand back the identical assessment object.
    pub async fn assessment_for(
        &self,
        org_id: Uuid,
        opportunity_id: Uuid,
        force: bool,
    ) -> Result<(Arc<Assessment>, AssessmentBasis), AppError> {
        if !force {
            if let Some(cached) = self.cache.get(&opportunity_id).await {
                // Entries are keyed by opportunity id alone; verify the org
                // before handing data across the tenant boundary.
                if cached.org_id == org_id {
                    tracing::debug!("Assessment cache HIT for opportunity {}", opportunity_id);
                    return Ok((cached, AssessmentBasis::Cache));
                }
            }
            tracing::debug!("Assessment cache MISS for opportunity {}", opportunity_id);
        }

        let opportunity = self
            .store
            .fetch(org_id, opportunity_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Opportunity {} not found", opportunity_id))
            })?;

        let assessment = Arc::new(scoring::assess(
            opportunity.id,
            opportunity.org_id,
            &opportunity.pillar_texts(),
            &self.scoring,
        ));
        self.cache.insert(opportunity_id, assessment.clone()).await;
        tracing::info!(
            "Computed assessment for opportunity {}: {}% ({})",
            opportunity_id,
            assessment.overall_pct,
            assessment.tier
        );

        Ok((assessment, AssessmentBasis::Computed))
    }

    /// Drops any cached assessment for the opportunity.
    pub async fn invalidate(&self, opportunity_id: Uuid) {
        self.cache.invalidate(&opportunity_id).await;
    }

    /// Writes the assessment to the history table.
    pub async fn persist(&self, assessment: &Assessment) -> Result<Uuid, AppError> {
        self.storage
            .store(assessment)
            .await
            .context("Failed to persist assessment history")
    }
}

/// KPI figures with a three-level resolution order.
///
/// Reads try the checksummed in-process cache first, then the persisted
/// snapshot table, and only then recompute from the fact tables; every
/// recomputation refreshes both upper levels. A forced recalculation skips
/// the read path entirely but is throttled per organization and kind.
pub struct KpiService {
    pool: PgPool,
    snapshots: SnapshotStorage,
    cache: Cache<String, String>,
    cooldown: Cache<String, i64>,
    cooldown_secs: u64,
}

impl KpiService {
    pub fn new(state: &AppState) -> Self {
        Self {
            pool: state.db.clone(),
            snapshots: SnapshotStorage::new(state.db.clone()),
            cache: state.kpi_cache.clone(),
            cooldown: state.recalc_cooldown.clone(),
            cooldown_secs: state.config.recalc_cooldown_secs,
        }
    }

    /// Resolves one KPI figure for the given scope and period.
    pub async fn resolve(
        &self,
        org_id: Uuid,
        kind: KpiKind,
        scope: KpiScope,
        period: Period,
        force: bool,
    ) -> Result<KpiValue, AppError> {
        let cache_key = kpi::cache_key(org_id, kind, &scope, &period);

        if force {
            let cooldown_key = format!("{}:{}", org_id, kind.as_str());
            if self.cooldown.get(&cooldown_key).await.is_some() {
                return Err(AppError::RateLimited(format!(
                    "Forced recalculation of {} was run recently; retry in up to {}s",
                    kind, self.cooldown_secs
                )));
            }
            // Claim the slot up front; a failed recalculation still consumes it.
            self.cooldown
                .insert(cooldown_key, chrono::Utc::now().timestamp())
                .await;
            tracing::info!("Forced {} recalculation for org {}", kind, org_id);
        } else {
            if let Some(sealed) = self.cache.get(&cache_key).await {
                match SealedEntry::open(&sealed) {
                    Some(raw) => {
                        if let Ok(mut value) = serde_json::from_str::<KpiValue>(&raw) {
                            tracing::debug!("KPI cache HIT for {}", cache_key);
                            value.basis = KpiBasis::Cache;
                            return Ok(value);
                        }
                        tracing::warn!(
                            "KPI cache entry for {} is unreadable; recomputing",
                            cache_key
                        );
                    }
                    None => {
                        tracing::warn!(
                            "KPI cache entry for {} failed its integrity check; recomputing",
                            cache_key
                        );
                    }
                }
            }

            if let Some(row) = self.snapshots.find(org_id, kind, &scope, &period).await? {
                tracing::debug!("KPI snapshot hit for {}", cache_key);
                let value = KpiValue::from_snapshot(kind, &row);
                self.prime_cache(&cache_key, &value).await;
                return Ok(value);
            }
        }

        let value = self.compute(org_id, kind, scope, period).await?;
        self.snapshots
            .upsert(&value)
            .await
            .context("Failed to persist KPI snapshot")?;
        self.prime_cache(&cache_key, &value).await;
        Ok(value)
    }

    /// Resolves a hyphenated NDC code to the product it identifies.
    pub async fn product_id_for_ndc(
        &self,
        org_id: Uuid,
        ndc: &str,
    ) -> Result<Option<Uuid>, AppError> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM products WHERE org_id = $1 AND ndc_code = $2 LIMIT 1",
        )
        .bind(org_id)
        .bind(ndc.trim())
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    async fn compute(
        &self,
        org_id: Uuid,
        kind: KpiKind,
        scope: KpiScope,
        period: Period,
    ) -> Result<KpiValue, AppError> {
        let (value, numerator, denominator) = match kind {
            KpiKind::Trx => {
                let rows = self.prescription_rows(org_id, &scope, &period).await?;
                let total = kpi::sum_trx(&rows) as f64;
                (total, total, None)
            }
            KpiKind::Nrx => {
                let rows = self.prescription_rows(org_id, &scope, &period).await?;
                let total = kpi::sum_nrx(&rows) as f64;
                (total, total, None)
            }
            KpiKind::MarketShare => {
                let rows = self.prescription_rows(org_id, &scope, &period).await?;
                let own = kpi::sum_trx(&rows) as f64;
                let market = kpi::sum_market_trx(&rows) as f64;
                (kpi::ratio(own, market), own, Some(market))
            }
            KpiKind::CallVolume => {
                let count = self.call_count(org_id, &scope, &period).await? as f64;
                (count, count, None)
            }
            KpiKind::QuotaAttainment => {
                let rows = self.prescription_rows(org_id, &scope, &period).await?;
                let actual = kpi::sum_trx(&rows) as f64;
                let quotas = self.quota_rows(org_id, &scope, &period).await?;
                let target = kpi::quota_target_total(&quotas);
                (kpi::ratio(actual, target), actual, Some(target))
            }
            KpiKind::TrxGrowth => {
                let current_rows = self.prescription_rows(org_id, &scope, &period).await?;
                let current = kpi::sum_trx(&current_rows);
                let previous = match period.previous() {
                    Some(prev) => {
                        kpi::sum_trx(&self.prescription_rows(org_id, &scope, &prev).await?)
                    }
                    None => 0,
                };
                (
                    kpi::growth(current, previous),
                    current as f64,
                    Some(previous as f64),
                )
            }
        };

        Ok(KpiValue {
            kind,
            org_id,
            scope,
            period,
            value,
            numerator,
            denominator,
            computed_at: chrono::Utc::now(),
            basis: KpiBasis::Computed,
        })
    }

    async fn prescription_rows(
        &self,
        org_id: Uuid,
        scope: &KpiScope,
        period: &Period,
    ) -> Result<Vec<PrescriptionFact>, AppError> {
        sqlx::query_as::<_, PrescriptionFact>(
            r#"
            SELECT id, org_id, product_id, territory_id, rep_id, captured_on,
                   trx, nrx, market_trx, source, created_at
            FROM prescriptions
            WHERE org_id = $1
              AND captured_on BETWEEN $2 AND $3
              AND ($4::uuid IS NULL OR product_id = $4)
              AND ($5::uuid IS NULL OR territory_id = $5)
              AND ($6::uuid IS NULL OR rep_id = $6)
            ORDER BY captured_on
            "#,
        )
        .bind(org_id)
        .bind(period.from)
        .bind(period.to)
        .bind(scope.product_id)
        .bind(scope.territory_id)
        .bind(scope.rep_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    async fn call_count(
        &self,
        org_id: Uuid,
        scope: &KpiScope,
        period: &Period,
    ) -> Result<i64, AppError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM call_activities
            WHERE org_id = $1
              AND called_at::date BETWEEN $2 AND $3
              AND ($4::uuid IS NULL OR product_id = $4)
              AND ($5::uuid IS NULL OR territory_id = $5)
              AND ($6::uuid IS NULL OR rep_id = $6)
            "#,
        )
        .bind(org_id)
        .bind(period.from)
        .bind(period.to)
        .bind(scope.product_id)
        .bind(scope.territory_id)
        .bind(scope.rep_id)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    /// Quota rows whose planning interval overlaps the requested period.
    /// Overlapping quotas count in full; there is no day-level proration.
    async fn quota_rows(
        &self,
        org_id: Uuid,
        scope: &KpiScope,
        period: &Period,
    ) -> Result<Vec<QuotaRow>, AppError> {
        sqlx::query_as::<_, QuotaRow>(
            r#"
            SELECT id, org_id, rep_id, product_id, territory_id,
                   period_start, period_end, target_trx
            FROM quotas
            WHERE org_id = $1
              AND period_start <= $3
              AND period_end >= $2
              AND ($4::uuid IS NULL OR product_id = $4)
              AND ($5::uuid IS NULL OR territory_id = $5)
              AND ($6::uuid IS NULL OR rep_id = $6)
            "#,
        )
        .bind(org_id)
        .bind(period.from)
        .bind(period.to)
        .bind(scope.product_id)
        .bind(scope.territory_id)
        .bind(scope.rep_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    async fn prime_cache(&self, key: &str, value: &KpiValue) {
        if let Ok(json) = serde_json::to_string(value) {
            self.cache
                .insert(key.to_string(), SealedEntry::new(json).seal())
                .await;
        }
    }
}
