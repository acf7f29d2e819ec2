use crate::errors::AppError;
use crate::kpi::{KpiKind, KpiScope, KpiValue, Period};
use crate::models::{KpiSnapshotRow, Opportunity, PillarPatch};
use crate::peak::PeakStage;
use crate::scoring::Assessment;
use sqlx::PgPool;
use uuid::Uuid;

const OPPORTUNITY_COLUMNS: &str = "id, org_id, account_id, owner_id, name, stage, \
     metrics, economic_buyer, decision_criteria, decision_process, paper_process, \
     identify_pain, implicate_pain, champion, competition, created_at, updated_at";

/// Read/write access to opportunity rows, always scoped to one organization.
pub struct OpportunityStore {
    pool: PgPool,
}

impl OpportunityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetches one opportunity; returns `None` when the id does not exist
    /// inside the caller's organization.
    pub async fn fetch(&self, org_id: Uuid, id: Uuid) -> Result<Option<Opportunity>, AppError> {
        sqlx::query_as::<_, Opportunity>(&format!(
            "SELECT {} FROM opportunities WHERE id = $1 AND org_id = $2",
            OPPORTUNITY_COLUMNS
        ))
        .bind(id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    /// All opportunity ids of one organization, oldest first.
    pub async fn list_ids(&self, org_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM opportunities WHERE org_id = $1 ORDER BY created_at",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    /// Applies a partial pillar update; absent patch fields keep their
    /// stored value. Returns the number of rows touched (0 when the
    /// opportunity is missing or belongs to another organization).
    pub async fn update_pillars(
        &self,
        org_id: Uuid,
        id: Uuid,
        patch: &PillarPatch,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE opportunities
            SET metrics = COALESCE($3, metrics),
                economic_buyer = COALESCE($4, economic_buyer),
                decision_criteria = COALESCE($5, decision_criteria),
                decision_process = COALESCE($6, decision_process),
                paper_process = COALESCE($7, paper_process),
                identify_pain = COALESCE($8, identify_pain),
                implicate_pain = COALESCE($9, implicate_pain),
                champion = COALESCE($10, champion),
                competition = COALESCE($11, competition),
                updated_at = now()
            WHERE id = $1 AND org_id = $2
            "#,
        )
        .bind(id)
        .bind(org_id)
        .bind(patch.metrics.as_deref())
        .bind(patch.economic_buyer.as_deref())
        .bind(patch.decision_criteria.as_deref())
        .bind(patch.decision_process.as_deref())
        .bind(patch.paper_process.as_deref())
        .bind(patch.identify_pain.as_deref())
        .bind(patch.implicate_pain.as_deref())
        .bind(patch.champion.as_deref())
        .bind(patch.competition.as_deref())
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(result.rows_affected())
    }

    /// Moves an opportunity to a new stage and records the move in the
    /// transition ledger, atomically.
    ///
    /// The update is conditional on the stage still being `from`; if another
    /// request won the race the call fails and the client must re-read.
    pub async fn transition_stage(
        &self,
        org_id: Uuid,
        id: Uuid,
        from: PeakStage,
        to: PeakStage,
        actor_id: Uuid,
        actor_role: &str,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;

        let updated = sqlx::query(
            r#"
            UPDATE opportunities
            SET stage = $4, updated_at = now()
            WHERE id = $1 AND org_id = $2 AND stage = $3
            "#,
        )
        .bind(id)
        .bind(org_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&mut *tx)
        .await
        .map_err(AppError::DatabaseError)?;

        if updated.rows_affected() == 0 {
            return Err(AppError::BadRequest(
                "Opportunity stage changed concurrently; re-read and retry".to_string(),
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO stage_transitions (
                id, org_id, opportunity_id, from_stage, to_stage, actor_id, actor_role, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, now())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(actor_id)
        .bind(actor_role)
        .execute(&mut *tx)
        .await
        .map_err(AppError::DatabaseError)?;

        tx.commit().await.map_err(AppError::DatabaseError)?;

        tracing::info!(
            "Opportunity {} moved from '{}' to '{}' by {}",
            id,
            from,
            to,
            actor_id
        );

        Ok(())
    }
}

/// Write access to the assessment history table.
pub struct AssessmentStorage {
    pool: PgPool,
}

impl AssessmentStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Appends one computed assessment to the history table.
    pub async fn store(&self, assessment: &Assessment) -> Result<Uuid, AppError> {
        let id = Uuid::new_v4();
        let pillar_scores = serde_json::to_value(&assessment.pillar_scores)
            .map_err(|e| AppError::InternalError(format!("Failed to encode pillar scores: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO meddpicc_assessments (
                id, org_id, opportunity_id, overall_pct, tier, pillar_scores, computed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id)
        .bind(assessment.org_id)
        .bind(assessment.opportunity_id)
        .bind(assessment.overall_pct)
        .bind(assessment.tier.as_str())
        .bind(&pillar_scores)
        .bind(assessment.computed_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        tracing::debug!(
            "Stored assessment {} for opportunity {} ({}%, {})",
            id,
            assessment.opportunity_id,
            assessment.overall_pct,
            assessment.tier
        );

        Ok(id)
    }
}

const SNAPSHOT_COLUMNS: &str = "id, org_id, kind, product_id, territory_id, rep_id, \
     period_start, period_end, value, numerator, denominator, computed_at";

/// Read/write access to precomputed KPI snapshot rows.
pub struct SnapshotStorage {
    pool: PgPool,
}

impl SnapshotStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Looks up the snapshot matching an exact (kind, scope, period)
    /// combination, newest first.
    pub async fn find(
        &self,
        org_id: Uuid,
        kind: KpiKind,
        scope: &KpiScope,
        period: &Period,
    ) -> Result<Option<KpiSnapshotRow>, AppError> {
        sqlx::query_as::<_, KpiSnapshotRow>(&format!(
            r#"
            SELECT {}
            FROM kpi_snapshots
            WHERE org_id = $1
              AND kind = $2
              AND product_id IS NOT DISTINCT FROM $3
              AND territory_id IS NOT DISTINCT FROM $4
              AND rep_id IS NOT DISTINCT FROM $5
              AND period_start = $6
              AND period_end = $7
            ORDER BY computed_at DESC
            LIMIT 1
            "#,
            SNAPSHOT_COLUMNS
        ))
        .bind(org_id)
        .bind(kind.as_str())
        .bind(scope.product_id)
        .bind(scope.territory_id)
        .bind(scope.rep_id)
        .bind(period.from)
        .bind(period.to)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }

    /// Writes a freshly computed figure, replacing any snapshot already
    /// covering the same (kind, scope, period).
    /// Uses sequential find-then-write queries rather than a partial-index
    /// upsert because the scope columns are nullable.
    pub async fn upsert(&self, value: &KpiValue) -> Result<(), AppError> {
        let existing = sqlx::query_as::<_, (Uuid,)>(
            r#"
            SELECT id
            FROM kpi_snapshots
            WHERE org_id = $1
              AND kind = $2
              AND product_id IS NOT DISTINCT FROM $3
              AND territory_id IS NOT DISTINCT FROM $4
              AND rep_id IS NOT DISTINCT FROM $5
              AND period_start = $6
              AND period_end = $7
            LIMIT 1
            "#,
        )
        .bind(value.org_id)
        .bind(value.kind.as_str())
        .bind(value.scope.product_id)
        .bind(value.scope.territory_id)
        .bind(value.scope.rep_id)
        .bind(value.period.from)
        .bind(value.period.to)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        match existing {
            Some(row) => {
                sqlx::query(
                    r#"
                    UPDATE kpi_snapshots
                    SET value = $2, numerator = $3, denominator = $4, computed_at = $5
                    WHERE id = $1
                    "#,
                )
                .bind(row.0)
                .bind(value.value)
                .bind(value.numerator)
                .bind(value.denominator)
                .bind(value.computed_at)
                .execute(&self.pool)
                .await
                .map_err(AppError::DatabaseError)?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO kpi_snapshots (
                        id, org_id, kind, product_id, territory_id, rep_id,
                        period_start, period_end, value, numerator, denominator, computed_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(value.org_id)
                .bind(value.kind.as_str())
                .bind(value.scope.product_id)
                .bind(value.scope.territory_id)
                .bind(value.scope.rep_id)
                .bind(value.period.from)
                .bind(value.period.to)
                .bind(value.value)
                .bind(value.numerator)
                .bind(value.denominator)
                .bind(value.computed_at)
                .execute(&self.pool)
                .await
                .map_err(AppError::DatabaseError)?;
            }
        }

        Ok(())
    }
}
