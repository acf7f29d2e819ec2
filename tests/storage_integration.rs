use std::env;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequestParts, State};
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{NaiveDate, Utc};
use sqlx::PgPool;
use tower::ServiceExt;
use uuid::Uuid;

use pharma_crm_api::auth_client::{AuthProviderClient, AuthUser};
use pharma_crm_api::config::Config;
use pharma_crm_api::db::Database;
use pharma_crm_api::db_storage::{AssessmentStorage, OpportunityStore, SnapshotStorage};
use pharma_crm_api::errors::AppError;
use pharma_crm_api::handlers::{api_router, peak_transition, AppState};
use pharma_crm_api::kpi::{KpiBasis, KpiKind, KpiScope, KpiValue, Period};
use pharma_crm_api::models::{PillarPatch, TransitionRequest};
use pharma_crm_api::peak::PeakStage;
use pharma_crm_api::scoring::{assess, ScoringConfig};
use pharma_crm_api::services::{AssessmentBasis, AssessmentService};
use pharma_crm_api::tenancy::{OrgContext, OrgRole};

async fn test_pool() -> anyhow::Result<PgPool> {
    let db_url = env::var("TEST_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("Set TEST_DATABASE_URL or DATABASE_URL to run this test"))?;

    let db = Database::new(&db_url).await?;
    ensure_schema(&db.pool).await?;
    Ok(db.pool)
}

/// Creates the tables these tests touch when they are missing, so the suite
/// can run against a blank database. Types mirror the production columns.
async fn ensure_schema(pool: &PgPool) -> anyhow::Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS organizations (
            id uuid PRIMARY KEY,
            name text NOT NULL,
            created_at timestamptz NOT NULL DEFAULT now()
        )",
        "CREATE TABLE IF NOT EXISTS opportunities (
            id uuid PRIMARY KEY,
            org_id uuid NOT NULL,
            account_id uuid,
            owner_id uuid,
            name text NOT NULL,
            stage text NOT NULL,
            metrics text,
            economic_buyer text,
            decision_criteria text,
            decision_process text,
            paper_process text,
            identify_pain text,
            implicate_pain text,
            champion text,
            competition text,
            created_at timestamptz NOT NULL DEFAULT now(),
            updated_at timestamptz
        )",
        "CREATE TABLE IF NOT EXISTS meddpicc_assessments (
            id uuid PRIMARY KEY,
            org_id uuid NOT NULL,
            opportunity_id uuid NOT NULL,
            overall_pct double precision NOT NULL,
            tier text NOT NULL,
            pillar_scores jsonb NOT NULL,
            computed_at timestamptz NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS kpi_snapshots (
            id uuid PRIMARY KEY,
            org_id uuid NOT NULL,
            kind text NOT NULL,
            product_id uuid,
            territory_id uuid,
            rep_id uuid,
            period_start date NOT NULL,
            period_end date NOT NULL,
            value double precision NOT NULL,
            numerator double precision NOT NULL,
            denominator double precision,
            computed_at timestamptz NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS stage_transitions (
            id uuid PRIMARY KEY,
            org_id uuid NOT NULL,
            opportunity_id uuid NOT NULL,
            from_stage text NOT NULL,
            to_stage text NOT NULL,
            actor_id uuid NOT NULL,
            actor_role text NOT NULL,
            created_at timestamptz NOT NULL DEFAULT now()
        )",
        "CREATE TABLE IF NOT EXISTS crm_events (
            event_id text PRIMARY KEY,
            org_id uuid NOT NULL,
            opportunity_id uuid,
            event_type text,
            occurred_at timestamptz NOT NULL,
            payload_raw jsonb NOT NULL,
            received_at timestamptz NOT NULL DEFAULT now()
        )",
        "CREATE TABLE IF NOT EXISTS org_members (
            org_id uuid NOT NULL,
            user_id uuid NOT NULL,
            role text NOT NULL,
            PRIMARY KEY (org_id, user_id)
        )",
    ];
    for ddl in statements {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

/// Seeds one organization and one opportunity in the given stage; two pillar
/// texts are long enough for full credit.
async fn seed_opportunity(pool: &PgPool, org_id: Uuid, stage: &str) -> anyhow::Result<Uuid> {
    sqlx::query("INSERT INTO organizations (id, name) VALUES ($1, $2)")
        .bind(org_id)
        .bind(format!("Test Org {}", org_id))
        .execute(pool)
        .await?;

    let opportunity_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO opportunities (
            id, org_id, name, stage, champion, metrics, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, now(), now())
        "#,
    )
    .bind(opportunity_id)
    .bind(org_id)
    .bind("Regional formulary expansion")
    .bind(stage)
    .bind("Dr. Alvarez drives the P&T committee and previews our data internally")
    .bind("Projected 18% TRx lift across the hospital network within two quarters")
    .execute(pool)
    .await?;

    Ok(opportunity_id)
}

/// Application state over the given pool, wired like production but with a
/// dead-end auth base URL; tests that need a verified caller seed the token
/// cache directly.
fn service_state(pool: PgPool) -> anyhow::Result<Arc<AppState>> {
    let config = Config {
        database_url: "postgresql://unused".to_string(),
        port: 3000,
        auth_base_url: "http://127.0.0.1:9".to_string(),
        auth_service_key: "test_service_key".to_string(),
        webhook_secret: Some("test-webhook-secret".to_string()),
        scoring_config_json: None,
        assessment_cache_ttl_secs: 300,
        kpi_cache_ttl_secs: 600,
        recalc_cooldown_secs: 60,
        rate_limit_per_second: 50,
        rate_limit_burst: 100,
    };
    AppState::build(config, pool).map_err(|e| anyhow::anyhow!(e.to_string()))
}

/// Integration smoke test for opportunity reads, scoring persistence and
/// pillar updates.
/// Marked ignored to avoid running against production by accident; set
/// TEST_DATABASE_URL to run.
#[tokio::test]
#[ignore]
async fn opportunity_assessment_round_trip_smoke_test() -> anyhow::Result<()> {
    let pool = test_pool().await?;
    let store = OpportunityStore::new(pool.clone());

    let org_id = Uuid::new_v4();
    let opportunity_id = seed_opportunity(&pool, org_id, "prospecting").await?;

    let opportunity = store
        .fetch(org_id, opportunity_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?
        .ok_or_else(|| anyhow::anyhow!("seeded opportunity not found"))?;
    assert_eq!(opportunity.org_id, org_id);
    assert_eq!(opportunity.stage, "prospecting");

    // The same id is invisible from another organization
    let foreign = store
        .fetch(Uuid::new_v4(), opportunity_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert!(foreign.is_none());

    let assessment = assess(
        opportunity.id,
        opportunity.org_id,
        &opportunity.pillar_texts(),
        &ScoringConfig::default(),
    );
    let populated = assessment.pillar_scores.iter().filter(|p| p.populated).count();
    assert_eq!(populated, 2);

    let history_id = AssessmentStorage::new(pool.clone())
        .store(&assessment)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert_ne!(history_id, Uuid::nil());

    // Clearing a pillar touches exactly the seeded row
    let patch = PillarPatch {
        champion: Some(String::new()),
        ..Default::default()
    };
    let rows = store
        .update_pillars(org_id, opportunity_id, &patch)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert_eq!(rows, 1);

    Ok(())
}

/// Integration smoke test for KPI snapshot upserts.
#[tokio::test]
#[ignore]
async fn kpi_snapshot_upsert_smoke_test() -> anyhow::Result<()> {
    let pool = test_pool().await?;
    let snapshots = SnapshotStorage::new(pool);

    let org_id = Uuid::new_v4();
    let period = Period {
        from: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        to: NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
    };
    let scope = KpiScope::default();
    let mut value = KpiValue {
        kind: KpiKind::Trx,
        org_id,
        scope,
        period,
        value: 1520.0,
        numerator: 1520.0,
        denominator: None,
        computed_at: Utc::now(),
        basis: KpiBasis::Computed,
    };

    snapshots
        .upsert(&value)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let found = snapshots
        .find(org_id, KpiKind::Trx, &scope, &period)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?
        .ok_or_else(|| anyhow::anyhow!("snapshot not found after upsert"))?;
    assert_eq!(found.value, 1520.0);

    // A second write for the same (kind, scope, period) replaces the figure
    value.value = 1780.0;
    value.numerator = 1780.0;
    value.computed_at = Utc::now();
    snapshots
        .upsert(&value)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let replaced = snapshots
        .find(org_id, KpiKind::Trx, &scope, &period)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?
        .ok_or_else(|| anyhow::anyhow!("snapshot gone after second upsert"))?;
    assert_eq!(replaced.value, 1780.0);
    assert_eq!(replaced.id, found.id);

    Ok(())
}

/// Integration smoke test for stage transitions and their ledger.
#[tokio::test]
#[ignore]
async fn stage_transition_ledger_smoke_test() -> anyhow::Result<()> {
    let pool = test_pool().await?;
    let store = OpportunityStore::new(pool.clone());

    let org_id = Uuid::new_v4();
    let opportunity_id = seed_opportunity(&pool, org_id, "prospecting").await?;
    let actor_id = Uuid::new_v4();

    store
        .transition_stage(
            org_id,
            opportunity_id,
            PeakStage::Prospecting,
            PeakStage::Engaging,
            actor_id,
            "manager",
        )
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let opportunity = store
        .fetch(org_id, opportunity_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?
        .ok_or_else(|| anyhow::anyhow!("opportunity vanished"))?;
    assert_eq!(opportunity.stage, "engaging");

    let ledger_rows: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM stage_transitions WHERE opportunity_id = $1 AND from_stage = $2",
    )
    .bind(opportunity_id)
    .bind("prospecting")
    .fetch_one(&pool)
    .await?;
    assert_eq!(ledger_rows, 1);

    // Replaying the same move fails the stale-stage guard
    let stale = store
        .transition_stage(
            org_id,
            opportunity_id,
            PeakStage::Prospecting,
            PeakStage::Engaging,
            actor_id,
            "manager",
        )
        .await;
    assert!(matches!(stale, Err(AppError::BadRequest(_))));

    Ok(())
}

/// Integration smoke test for webhook ingestion and replay suppression,
/// driven through the HTTP router against a real database.
#[tokio::test]
#[ignore]
async fn webhook_replay_suppression_smoke_test() -> anyhow::Result<()> {
    let pool = test_pool().await?;
    let app = api_router(service_state(pool)?);

    let event = serde_json::json!({
        "event_id": format!("evt_{}", Uuid::new_v4()),
        "event_type": "opportunity.updated",
        "org_id": Uuid::new_v4(),
        "opportunity_id": Uuid::new_v4(),
        "occurred_at": "2026-03-01T12:30:00Z"
    });
    let deliver = || {
        Request::builder()
            .method("POST")
            .uri("/api/v1/webhooks/crm")
            .header("content-type", "application/json")
            .header("x-webhook-token", "test-webhook-secret")
            .header("x-forwarded-for", "203.0.113.20")
            .body(Body::from(event.to_string()))
            .unwrap()
    };

    let first = app.clone().oneshot(deliver()).await?;
    assert_eq!(first.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(first.into_body(), usize::MAX).await?;
    let body: serde_json::Value = serde_json::from_slice(&bytes)?;
    assert_eq!(body["processed"], 1);
    assert_eq!(body["duplicates"], 0);

    // The CRM retries under the same event id; the replay records nothing
    let second = app.clone().oneshot(deliver()).await?;
    assert_eq!(second.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(second.into_body(), usize::MAX).await?;
    let body: serde_json::Value = serde_json::from_slice(&bytes)?;
    assert_eq!(body["processed"], 0);
    assert_eq!(body["duplicates"], 1);

    Ok(())
}

/// Integration smoke test for stage transitions dropping the cached
/// assessment, driven through the transition handler.
#[tokio::test]
#[ignore]
async fn transition_rescores_on_next_read_smoke_test() -> anyhow::Result<()> {
    let pool = test_pool().await?;
    let state = service_state(pool.clone())?;

    let org_id = Uuid::new_v4();
    let opportunity_id = seed_opportunity(&pool, org_id, "prospecting").await?;

    let service = AssessmentService::new(&state);
    let (first, basis) = service
        .assessment_for(org_id, opportunity_id, false)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert_eq!(basis, AssessmentBasis::Computed);
    let (cached, basis) = service
        .assessment_for(org_id, opportunity_id, false)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert_eq!(basis, AssessmentBasis::Cache);
    assert!(Arc::ptr_eq(&first, &cached));

    let ctx = OrgContext {
        org_id,
        user_id: Uuid::new_v4(),
        role: OrgRole::Manager,
    };
    let Json(ack) = peak_transition(
        State(state.clone()),
        ctx,
        Json(TransitionRequest {
            opportunity_id,
            to_stage: "engaging".to_string(),
        }),
    )
    .await
    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert_eq!(ack.from_stage, "prospecting");
    assert_eq!(ack.to_stage, "engaging");

    // The move dropped the cached copy; the next read scores fresh
    let (rescored, basis) = service
        .assessment_for(org_id, opportunity_id, false)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert_eq!(basis, AssessmentBasis::Computed);
    assert!(!Arc::ptr_eq(&first, &rescored));

    Ok(())
}

/// Integration smoke test for the organization membership gate in the
/// request extractor.
#[tokio::test]
#[ignore]
async fn membership_gate_rejects_non_members_smoke_test() -> anyhow::Result<()> {
    let pool = test_pool().await?;
    let state = service_state(pool.clone())?;

    let org_id = Uuid::new_v4();
    sqlx::query("INSERT INTO organizations (id, name) VALUES ($1, $2)")
        .bind(org_id)
        .bind(format!("Test Org {}", org_id))
        .execute(&pool)
        .await?;
    // The organization has members, just not the caller
    sqlx::query("INSERT INTO org_members (org_id, user_id, role) VALUES ($1, $2, 'manager')")
        .bind(org_id)
        .bind(Uuid::new_v4())
        .execute(&pool)
        .await?;

    // A token the provider already vouched for; seeding the verification
    // cache keeps the provider itself out of the test
    let caller = AuthUser {
        id: Uuid::new_v4(),
        email: Some("outsider@example.com".to_string()),
    };
    let token = format!("token-{}", Uuid::new_v4());
    state
        .token_cache
        .insert(AuthProviderClient::token_cache_key(&token), caller.clone())
        .await;

    let request_parts = || {
        let (parts, _) = Request::builder()
            .header("authorization", format!("Bearer {}", token))
            .header("x-org-id", org_id.to_string())
            .body(())
            .unwrap()
            .into_parts();
        parts
    };

    let mut parts = request_parts();
    let rejection = match OrgContext::from_request_parts(&mut parts, &state).await {
        Err(e) => e,
        Ok(_) => anyhow::bail!("expected the membership gate to reject the caller"),
    };
    assert!(matches!(rejection, AppError::Forbidden(_)));
    assert_eq!(rejection.into_response().status(), StatusCode::FORBIDDEN);

    // Granting membership admits the same token
    sqlx::query("INSERT INTO org_members (org_id, user_id, role) VALUES ($1, $2, 'rep')")
        .bind(org_id)
        .bind(caller.id)
        .execute(&pool)
        .await?;
    let mut parts = request_parts();
    let ctx = OrgContext::from_request_parts(&mut parts, &state)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert_eq!(ctx.org_id, org_id);
    assert_eq!(ctx.user_id, caller.id);
    assert_eq!(ctx.role, OrgRole::Rep);

    Ok(())
}
