use crate::auth_client::{AuthProviderClient, AuthUser};
use crate::config::Config;
use crate::db_storage::OpportunityStore;
use crate::errors::AppError;
use crate::kpi::KpiScope;
use crate::models::{
    AssessmentQuery, AssessmentResponse, KpiBatchRequest, KpiQuery, KpiResponse, KpiValueDto,
    PillarPatch, PillarUpdateAck, TransitionRequest, TransitionResponse,
};
use crate::peak::{self, PeakStage};
use crate::scoring::{Assessment, ScoringConfig};
use crate::services::{AssessmentService, KpiService};
use crate::tenancy::{OrgContext, OrgRole};
use crate::validate::{self, ValidKpiRequest};
use crate::webhook_handler;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use moka::future::Cache;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub db: PgPool,
    /// Application configuration.
    pub config: Config,
    /// Client for the external auth provider.
    pub auth: AuthProviderClient,
    /// Scoring weights and tier thresholds, loaded once at startup.
    pub scoring: ScoringConfig,
    /// Cache of computed assessments, keyed by opportunity id.
    pub assessment_cache: Cache<Uuid, Arc<Assessment>>,
    /// Cache of sealed KPI figures, keyed by org/kind/scope/period.
    pub kpi_cache: Cache<String, String>,
    /// Cache of verified bearer tokens, keyed by token hash.
    pub token_cache: Cache<String, AuthUser>,
    /// Per-org forced-recalculation markers; an entry means "ran recently".
    pub recalc_cooldown: Cache<String, i64>,
}

impl AppState {
    /// Builds the shared state: caches sized from the configuration plus the
    /// auth provider client.
    pub fn build(config: Config, pool: PgPool) -> Result<Arc<Self>, AppError> {
        let assessment_cache = Cache::builder()
            .time_to_live(Duration::from_secs(config.assessment_cache_ttl_secs))
            .max_capacity(10_000)
            .build();
        tracing::info!(
            "Assessment cache initialized ({}s TTL, 10k capacity)",
            config.assessment_cache_ttl_secs
        );

        let kpi_cache = Cache::builder()
            .time_to_live(Duration::from_secs(config.kpi_cache_ttl_secs))
            .max_capacity(50_000)
            .build();
        tracing::info!(
            "KPI cache initialized ({}s TTL, 50k capacity)",
            config.kpi_cache_ttl_secs
        );

        let token_cache = Cache::builder()
            .time_to_live(Duration::from_secs(60))
            .max_capacity(10_000)
            .build();
        tracing::info!("Token verification cache initialized (60s TTL)");

        let recalc_cooldown = Cache::builder()
            .time_to_live(Duration::from_secs(config.recalc_cooldown_secs))
            .max_capacity(10_000)
            .build();

        let auth = AuthProviderClient::new(
            config.auth_base_url.clone(),
            config.auth_service_key.clone(),
        )?;
        tracing::info!("Auth provider client initialized: {}", config.auth_base_url);

        let scoring = ScoringConfig::from_env_json(config.scoring_config_json.as_deref());

        Ok(Arc::new(Self {
            db: pool,
            config,
            auth,
            scoring,
            assessment_cache,
            kpi_cache,
            token_cache,
            recalc_cooldown,
        }))
    }
}

/// Health check endpoint.
///
/// Returns the service status and version; not rate limited so platform
/// probes always get through.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "pharma-crm-api",
            "version": "0.1.0"
        })),
    )
}

/// GET /api/v1/opportunities/:id/assessment
///
/// Returns the qualification assessment for one opportunity, computing it
/// from the stored pillar texts when no cached copy exists.
///
/// # Arguments
///
/// * `state` - The application state.
/// * `ctx` - The authenticated caller and organization.
/// * `id` - The UUID of the opportunity.
/// * `params` - Query flags (`force`, `persist`).
///
/// # Returns
///
/// * `Result<Json<AssessmentResponse>, AppError>` - The assessment or an error.
#[utoipa::path(
    get,
    path = "/api/v1/opportunities/{id}/assessment",
    tag = "assessments",
    params(
        ("id" = Uuid, Path, description = "Opportunity id"),
        AssessmentQuery
    ),
    responses(
        (status = 200, description = "Qualification assessment", body = AssessmentResponse),
        (status = 401, description = "Missing or rejected bearer token"),
        (status = 404, description = "Opportunity not found in this organization")
    )
)]
pub async fn get_assessment(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<Uuid>,
    Query(params): Query<AssessmentQuery>,
) -> Result<Json<AssessmentResponse>, AppError> {
    tracing::info!(
        "GET /opportunities/{}/assessment - org {} force={}",
        id,
        ctx.org_id,
        params.force
    );

    let service = AssessmentService::new(&state);
    let (assessment, basis) = service.assessment_for(ctx.org_id, id, params.force).await?;

    if params.persist {
        let history_id = service.persist(&assessment).await?;
        tracing::debug!("Assessment for {} persisted as {}", id, history_id);
    }

    Ok(Json(AssessmentResponse::from_assessment(
        &assessment,
        basis.as_str(),
    )))
}

/// PUT /api/v1/opportunities/:id/pillars
///
/// Applies a partial update to the opportunity's pillar evidence texts and
/// drops any cached assessment so the next read reflects the new texts.
#[utoipa::path(
    put,
    path = "/api/v1/opportunities/{id}/pillars",
    tag = "assessments",
    params(("id" = Uuid, Path, description = "Opportunity id")),
    request_body = PillarPatch,
    responses(
        (status = 200, description = "Update applied", body = PillarUpdateAck),
        (status = 400, description = "Empty patch or oversized pillar text"),
        (status = 404, description = "Opportunity not found in this organization")
    )
)]
pub async fn update_pillars(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Path(id): Path<Uuid>,
    Json(patch): Json<PillarPatch>,
) -> Result<Json<PillarUpdateAck>, AppError> {
    tracing::info!("PUT /opportunities/{}/pillars - org {}", id, ctx.org_id);
    validate::pillar_patch(&patch)?;

    let store = OpportunityStore::new(state.db.clone());
    let rows = store.update_pillars(ctx.org_id, id, &patch).await?;
    if rows == 0 {
        return Err(AppError::NotFound(format!("Opportunity {} not found", id)));
    }

    AssessmentService::new(&state).invalidate(id).await;
    tracing::debug!("Dropped cached assessment for opportunity {}", id);

    Ok(Json(PillarUpdateAck {
        opportunity_id: id,
        updated: true,
        invalidated: true,
    }))
}

/// GET /api/v1/bi/kpis
///
/// Resolves a single KPI figure for the caller's organization.
#[utoipa::path(
    get,
    path = "/api/v1/bi/kpis",
    tag = "kpis",
    params(KpiQuery),
    responses(
        (status = 200, description = "Resolved KPI figure", body = KpiResponse),
        (status = 400, description = "Unknown kind, bad period or bad product selector"),
        (status = 403, description = "Rep asked for another rep's figures"),
        (status = 404, description = "NDC code matched no product"),
        (status = 429, description = "Forced recalculation ran too recently")
    )
)]
pub async fn get_kpi(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Query(params): Query<KpiQuery>,
) -> Result<Json<KpiResponse>, AppError> {
    tracing::info!(
        "GET /bi/kpis - org {} kind={} force={}",
        ctx.org_id,
        params.kind,
        params.force
    );
    let valid = validate::kpi_query(&params)?;
    resolve_kpis(&state, &ctx, valid).await
}

/// POST /api/v1/bi/kpis
///
/// Resolves several KPI kinds over one shared scope and period.
#[utoipa::path(
    post,
    path = "/api/v1/bi/kpis",
    tag = "kpis",
    request_body = KpiBatchRequest,
    responses(
        (status = 200, description = "Resolved KPI figures", body = KpiResponse),
        (status = 400, description = "Unknown kinds, bad period or bad product selector"),
        (status = 403, description = "Rep asked for another rep's figures"),
        (status = 404, description = "NDC code matched no product"),
        (status = 429, description = "Forced recalculation ran too recently")
    )
)]
pub async fn post_kpis(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Json(body): Json<KpiBatchRequest>,
) -> Result<Json<KpiResponse>, AppError> {
    tracing::info!(
        "POST /bi/kpis - org {} kinds={:?} force={}",
        ctx.org_id,
        body.kinds,
        body.force
    );
    let valid = validate::kpi_batch(&body)?;
    resolve_kpis(&state, &ctx, valid).await
}

/// Reps may not read another rep's scoped figures; org-wide aggregates and
/// their own scope are fine.
fn enforce_rep_scope(ctx: &OrgContext, rep_id: Option<Uuid>) -> Result<(), AppError> {
    if ctx.role == OrgRole::Rep {
        if let Some(rep) = rep_id {
            if rep != ctx.user_id {
                return Err(AppError::Forbidden(
                    "Reps may only query rep-scoped KPIs for themselves".to_string(),
                ));
            }
        }
    }
    Ok(())
}

async fn resolve_kpis(
    state: &Arc<AppState>,
    ctx: &OrgContext,
    req: ValidKpiRequest,
) -> Result<Json<KpiResponse>, AppError> {
    enforce_rep_scope(ctx, req.rep_id)?;

    let service = KpiService::new(state);
    let product_id = match (req.product_id, req.product_ndc.as_deref()) {
        (Some(id), _) => Some(id),
        (None, Some(ndc)) => Some(
            service
                .product_id_for_ndc(ctx.org_id, ndc)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("No product with NDC code {}", ndc))
                })?,
        ),
        (None, None) => None,
    };
    let scope = KpiScope {
        product_id,
        territory_id: req.territory_id,
        rep_id: req.rep_id,
    };

    let mut results = Vec::with_capacity(req.kinds.len());
    for kind in &req.kinds {
        let value = service
            .resolve(ctx.org_id, *kind, scope, req.period, req.force)
            .await?;
        results.push(KpiValueDto::from_value(&value));
    }

    Ok(Json(KpiResponse {
        org_id: ctx.org_id,
        from: req.period.from,
        to: req.period.to,
        results,
    }))
}

/// POST /api/v1/peak/transition
///
/// Moves an opportunity along the pipeline. Forward moves are restricted to
/// the immediate next stage and entry into the final stage requires the
/// qualification tier to be at least Good; backward moves are always allowed.
#[utoipa::path(
    post,
    path = "/api/v1/peak/transition",
    tag = "pipeline",
    request_body = TransitionRequest,
    responses(
        (status = 200, description = "Transition applied", body = TransitionResponse),
        (status = 400, description = "Transition denied with a structured reason"),
        (status = 404, description = "Opportunity not found in this organization")
    )
)]
pub async fn peak_transition(
    State(state): State<Arc<AppState>>,
    ctx: OrgContext,
    Json(req): Json<TransitionRequest>,
) -> Result<Json<TransitionResponse>, AppError> {
    tracing::info!(
        "POST /peak/transition - org {} opportunity {} -> {}",
        ctx.org_id,
        req.opportunity_id,
        req.to_stage
    );
    let valid = validate::transition_request(&req)?;

    let store = OpportunityStore::new(state.db.clone());
    let opportunity = store
        .fetch(ctx.org_id, valid.opportunity_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("Opportunity {} not found", valid.opportunity_id))
        })?;
    let from = PeakStage::parse(&opportunity.stage).ok_or_else(|| {
        AppError::InternalError(format!(
            "Opportunity {} has unrecognized stage '{}'",
            opportunity.id, opportunity.stage
        ))
    })?;

    // The qualification gate only applies when entering the final stage, and
    // only when scoring is in a usable state.
    let tier = if valid.to_stage == PeakStage::KeyDecision {
        if state.scoring.is_usable() {
            let (assessment, _) = AssessmentService::new(&state)
                .assessment_for(ctx.org_id, valid.opportunity_id, false)
                .await?;
            Some(assessment.tier)
        } else {
            tracing::warn!(
                "Scoring configuration is degraded; skipping the qualification gate for {}",
                valid.opportunity_id
            );
            None
        }
    } else {
        None
    };

    peak::validate_transition(from, valid.to_stage, tier)
        .map_err(|denial| AppError::Validation(vec![denial.into_issue()]))?;

    store
        .transition_stage(
            ctx.org_id,
            valid.opportunity_id,
            from,
            valid.to_stage,
            ctx.user_id,
            ctx.role.as_str(),
        )
        .await?;

    AssessmentService::new(&state)
        .invalidate(valid.opportunity_id)
        .await;
    tracing::debug!(
        "Dropped cached assessment for opportunity {}",
        valid.opportunity_id
    );

    Ok(Json(TransitionResponse {
        opportunity_id: valid.opportunity_id,
        from_stage: from.as_str().to_string(),
        to_stage: valid.to_stage.as_str().to_string(),
        transitioned_at: chrono::Utc::now(),
    }))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_assessment,
        update_pillars,
        get_kpi,
        post_kpis,
        peak_transition,
    ),
    components(schemas(
        AssessmentResponse,
        crate::models::PillarScoreDto,
        PillarPatch,
        PillarUpdateAck,
        KpiBatchRequest,
        KpiResponse,
        KpiValueDto,
        TransitionRequest,
        TransitionResponse,
        crate::errors::ValidationIssue,
    )),
    tags(
        (name = "assessments", description = "MEDDPICC qualification scoring"),
        (name = "kpis", description = "Commercial KPI aggregation"),
        (name = "pipeline", description = "PEAK pipeline stage management")
    )
)]
pub struct ApiDoc;

/// Builds the full application router: rate-limited API routes, the open
/// health check, and the generated API docs.
pub fn api_router(state: Arc<AppState>) -> Router {
    // finish() only fails on a zero rate or burst, which Config rejects
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(state.config.rate_limit_per_second)
            .burst_size(state.config.rate_limit_burst)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .unwrap(),
    );

    let protected_routes = Router::new()
        .route(
            "/api/v1/opportunities/:id/assessment",
            get(get_assessment),
        )
        .route("/api/v1/opportunities/:id/pillars", put(update_pillars))
        .route("/api/v1/bi/kpis", get(get_kpi).post(post_kpis))
        .route("/api/v1/peak/transition", post(peak_transition))
        .route("/api/v1/webhooks/crm", post(webhook_handler::crm_webhook))
        .layer(
            ServiceBuilder::new()
                // Request size limit: 1MB max payload
                .layer(RequestBodyLimitLayer::new(1024 * 1024))
                // Per-IP rate limiting
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    Router::new()
        .route("/health", get(health))
        .merge(protected_routes)
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(role: OrgRole) -> OrgContext {
        OrgContext {
            org_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            role,
        }
    }

    #[test]
    fn test_rep_cannot_read_another_reps_scoped_figures() {
        let ctx = member(OrgRole::Rep);
        let denied = enforce_rep_scope(&ctx, Some(Uuid::new_v4()));
        assert!(matches!(denied, Err(AppError::Forbidden(_))));
    }

    #[test]
    fn test_rep_own_scope_and_org_wide_requests_pass() {
        let ctx = member(OrgRole::Rep);
        assert!(enforce_rep_scope(&ctx, Some(ctx.user_id)).is_ok());
        assert!(enforce_rep_scope(&ctx, None).is_ok());
    }

    #[test]
    fn test_managers_and_admins_read_any_reps_figures() {
        let rep_id = Uuid::new_v4();
        assert!(enforce_rep_scope(&member(OrgRole::Manager), Some(rep_id)).is_ok());
        assert!(enforce_rep_scope(&member(OrgRole::Admin), Some(rep_id)).is_ok());
    }
}
