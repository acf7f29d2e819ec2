use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::kpi::KpiValue;
use crate::scoring::{Assessment, Pillar, PillarTexts};

// ============ Database Models ============

/// A sales opportunity within one organization.
///
/// Carries the nine qualification pillar texts alongside the pipeline stage.
/// The stage column is free text at the database level; only the four active
/// pipeline stages are meaningful to this service.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Opportunity {
    /// Unique identifier for the opportunity.
    pub id: Uuid,
    /// Organization that owns the opportunity.
    pub org_id: Uuid,
    /// Account (e.g. hospital network or clinic group) the deal belongs to.
    pub account_id: Option<Uuid>,
    /// Sales rep that owns the deal.
    pub owner_id: Option<Uuid>,
    /// Display name of the deal.
    pub name: String,
    /// Current pipeline stage as stored by the CRM.
    pub stage: String,
    /// Quantified business impact evidence.
    pub metrics: Option<String>,
    /// Who controls the budget.
    pub economic_buyer: Option<String>,
    /// Formal evaluation criteria.
    pub decision_criteria: Option<String>,
    /// How the decision will be made.
    pub decision_process: Option<String>,
    /// Contracting and procurement path.
    pub paper_process: Option<String>,
    /// The pain being solved.
    pub identify_pain: Option<String>,
    /// Cost of inaction for the customer.
    pub implicate_pain: Option<String>,
    /// Internal champion evidence.
    pub champion: Option<String>,
    /// Competitive landscape notes.
    pub competition: Option<String>,
    /// Timestamp of creation.
    pub created_at: DateTime<Utc>,
    /// Timestamp of last update.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Opportunity {
    /// Copies the pillar evidence fields into the scoring input shape.
    pub fn pillar_texts(&self) -> PillarTexts {
        PillarTexts {
            metrics: self.metrics.clone(),
            economic_buyer: self.economic_buyer.clone(),
            decision_criteria: self.decision_criteria.clone(),
            decision_process: self.decision_process.clone(),
            paper_process: self.paper_process.clone(),
            identify_pain: self.identify_pain.clone(),
            implicate_pain: self.implicate_pain.clone(),
            champion: self.champion.clone(),
            competition: self.competition.clone(),
        }
    }
}

/// One row of prescription volume, as delivered by the data vendor feed.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PrescriptionFact {
    /// Unique identifier for the fact row.
    pub id: Uuid,
    /// Organization the row belongs to.
    pub org_id: Uuid,
    /// Product the prescriptions are for.
    pub product_id: Uuid,
    /// Sales territory, when the feed provides one.
    pub territory_id: Option<Uuid>,
    /// Rep credited with the territory at capture time.
    pub rep_id: Option<Uuid>,
    /// The day the volumes were captured for.
    pub captured_on: NaiveDate,
    /// Total prescriptions.
    pub trx: i64,
    /// New prescriptions (first fills).
    pub nrx: i64,
    /// Total market prescriptions in the same segment, for share calculations.
    pub market_trx: i64,
    /// Data vendor or feed the row came from.
    pub source: Option<String>,
    /// Timestamp of ingestion.
    pub created_at: DateTime<Utc>,
}

/// A sales quota row; targets are set per rep, product and/or territory
/// for a planning period.
#[derive(Debug, Clone, FromRow)]
pub struct QuotaRow {
    pub id: Uuid,
    pub org_id: Uuid,
    pub rep_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
    pub territory_id: Option<Uuid>,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    /// Target TRx volume for the period; NUMERIC in the database.
    pub target_trx: BigDecimal,
}

/// A persisted KPI figure, written after each live computation so later
/// requests can be served without touching the fact tables.
#[derive(Debug, Clone, FromRow)]
pub struct KpiSnapshotRow {
    pub id: Uuid,
    pub org_id: Uuid,
    pub kind: String,
    pub product_id: Option<Uuid>,
    pub territory_id: Option<Uuid>,
    pub rep_id: Option<Uuid>,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub value: f64,
    pub numerator: f64,
    pub denominator: Option<f64>,
    pub computed_at: DateTime<Utc>,
}

// ============ API Request Models ============

/// Query parameters for the assessment endpoint.
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AssessmentQuery {
    /// Recompute even when a cached assessment exists.
    #[serde(default)]
    pub force: bool,
    /// Also write the computed assessment to the history table.
    #[serde(default)]
    pub persist: bool,
}

/// Partial update of an opportunity's pillar evidence texts.
///
/// Absent fields are left untouched; sending an empty string clears a
/// pillar back to unpopulated.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct PillarPatch {
    pub metrics: Option<String>,
    pub economic_buyer: Option<String>,
    pub decision_criteria: Option<String>,
    pub decision_process: Option<String>,
    pub paper_process: Option<String>,
    pub identify_pain: Option<String>,
    pub implicate_pain: Option<String>,
    pub champion: Option<String>,
    pub competition: Option<String>,
}

impl PillarPatch {
    pub fn get(&self, pillar: Pillar) -> Option<&str> {
        match pillar {
            Pillar::Metrics => self.metrics.as_deref(),
            Pillar::EconomicBuyer => self.economic_buyer.as_deref(),
            Pillar::DecisionCriteria => self.decision_criteria.as_deref(),
            Pillar::DecisionProcess => self.decision_process.as_deref(),
            Pillar::PaperProcess => self.paper_process.as_deref(),
            Pillar::IdentifyPain => self.identify_pain.as_deref(),
            Pillar::ImplicatePain => self.implicate_pain.as_deref(),
            Pillar::Champion => self.champion.as_deref(),
            Pillar::Competition => self.competition.as_deref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        Pillar::ALL.iter().all(|p| self.get(*p).is_none())
    }
}

/// Query parameters for the single-KPI endpoint.
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct KpiQuery {
    /// KPI kind, e.g. `trx`, `nrx`, `market_share`.
    pub kind: String,
    /// Restrict to one product by id.
    pub product_id: Option<Uuid>,
    /// Restrict to one product by NDC code (alternative to `product_id`).
    pub product_ndc: Option<String>,
    /// Restrict to one sales territory.
    pub territory_id: Option<Uuid>,
    /// Restrict to one rep.
    pub rep_id: Option<Uuid>,
    /// First day of the reporting period (inclusive).
    pub from: Option<NaiveDate>,
    /// Last day of the reporting period (inclusive).
    pub to: Option<NaiveDate>,
    /// Bypass caches and recompute from the fact tables.
    #[serde(default)]
    pub force: bool,
}

/// Body of the batch KPI endpoint; computes several kinds over one period
/// and scope in a single request.
#[derive(Debug, Deserialize, ToSchema)]
pub struct KpiBatchRequest {
    pub kinds: Vec<String>,
    pub product_id: Option<Uuid>,
    pub product_ndc: Option<String>,
    pub territory_id: Option<Uuid>,
    pub rep_id: Option<Uuid>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    #[serde(default)]
    pub force: bool,
}

/// Body of the stage transition endpoint.
#[derive(Debug, Deserialize, ToSchema)]
pub struct TransitionRequest {
    pub opportunity_id: Uuid,
    /// Target stage, e.g. `engaging` or `key_decision`.
    pub to_stage: String,
}

// ============ API Response Models ============

/// Per-pillar score detail as returned to clients.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PillarScoreDto {
    pub pillar: String,
    pub populated: bool,
    pub chars: usize,
    pub score: f64,
    pub max: f64,
}

/// A full qualification assessment response.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AssessmentResponse {
    pub opportunity_id: Uuid,
    pub overall_pct: f64,
    pub tier: String,
    pub pillars: Vec<PillarScoreDto>,
    pub computed_at: DateTime<Utc>,
    /// Where the figures came from: `cache` or `computed`.
    pub basis: String,
}

impl AssessmentResponse {
    pub fn from_assessment(assessment: &Assessment, basis: &str) -> Self {
        Self {
            opportunity_id: assessment.opportunity_id,
            overall_pct: assessment.overall_pct,
            tier: assessment.tier.as_str().to_string(),
            pillars: assessment
                .pillar_scores
                .iter()
                .map(|p| PillarScoreDto {
                    pillar: p.pillar.as_str().to_string(),
                    populated: p.populated,
                    chars: p.chars,
                    score: p.score,
                    max: p.max,
                })
                .collect(),
            computed_at: assessment.computed_at,
            basis: basis.to_string(),
        }
    }
}

/// Acknowledgement returned after a pillar update.
#[derive(Debug, Serialize, ToSchema)]
pub struct PillarUpdateAck {
    pub opportunity_id: Uuid,
    pub updated: bool,
    /// Whether a cached assessment was dropped as part of the update.
    pub invalidated: bool,
}

/// One KPI figure as returned to clients.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct KpiValueDto {
    pub kind: String,
    pub value: f64,
    pub numerator: f64,
    pub denominator: Option<f64>,
    pub product_id: Option<Uuid>,
    pub territory_id: Option<Uuid>,
    pub rep_id: Option<Uuid>,
    /// Where the figure came from: `cache`, `snapshot` or `computed`.
    pub basis: String,
    pub computed_at: DateTime<Utc>,
}

impl KpiValueDto {
    pub fn from_value(value: &KpiValue) -> Self {
        Self {
            kind: value.kind.as_str().to_string(),
            value: value.value,
            numerator: value.numerator,
            denominator: value.denominator,
            product_id: value.scope.product_id,
            territory_id: value.scope.territory_id,
            rep_id: value.scope.rep_id,
            basis: value.basis.as_str().to_string(),
            computed_at: value.computed_at,
        }
    }
}

/// Envelope for one or more KPI figures over a common period.
#[derive(Debug, Serialize, ToSchema)]
pub struct KpiResponse {
    pub org_id: Uuid,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub results: Vec<KpiValueDto>,
}

/// Result of an accepted stage transition.
#[derive(Debug, Serialize, ToSchema)]
pub struct TransitionResponse {
    pub opportunity_id: Uuid,
    pub from_stage: String,
    pub to_stage: String,
    pub transitioned_at: DateTime<Utc>,
}
