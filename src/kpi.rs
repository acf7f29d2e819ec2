use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{KpiSnapshotRow, PrescriptionFact, QuotaRow};

/// The KPI kinds this service can compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KpiKind {
    /// Total prescription volume.
    Trx,
    /// New prescription volume (first fills).
    Nrx,
    /// Own TRx as a share of total market TRx.
    MarketShare,
    /// Number of HCP calls logged in the period.
    CallVolume,
    /// Actual TRx against the quota targets overlapping the period.
    QuotaAttainment,
    /// TRx change versus the immediately preceding period of equal length.
    TrxGrowth,
}

impl KpiKind {
    pub const ALL: [KpiKind; 6] = [
        KpiKind::Trx,
        KpiKind::Nrx,
        KpiKind::MarketShare,
        KpiKind::CallVolume,
        KpiKind::QuotaAttainment,
        KpiKind::TrxGrowth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KpiKind::Trx => "trx",
            KpiKind::Nrx => "nrx",
            KpiKind::MarketShare => "market_share",
            KpiKind::CallVolume => "call_volume",
            KpiKind::QuotaAttainment => "quota_attainment",
            KpiKind::TrxGrowth => "trx_growth",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "trx" => Some(KpiKind::Trx),
            "nrx" => Some(KpiKind::Nrx),
            "market_share" => Some(KpiKind::MarketShare),
            "call_volume" => Some(KpiKind::CallVolume),
            "quota_attainment" => Some(KpiKind::QuotaAttainment),
            "trx_growth" => Some(KpiKind::TrxGrowth),
            _ => None,
        }
    }
}

impl std::fmt::Display for KpiKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A closed reporting interval; both endpoints are inclusive days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl Period {
    /// Number of days covered, counting both endpoints.
    pub fn days(&self) -> i64 {
        self.to.signed_duration_since(self.from).num_days() + 1
    }

    /// The immediately preceding interval of the same length.
    ///
    /// Returns `None` only when the dates underflow the calendar, which
    /// cannot happen for request dates parsed from ISO strings.
    pub fn previous(&self) -> Option<Period> {
        let len = self.days() as u64;
        let to = self.from.checked_sub_days(Days::new(1))?;
        let from = self.from.checked_sub_days(Days::new(len))?;
        Some(Period { from, to })
    }
}

/// Optional dimensional filters applied to a KPI computation.
///
/// Absent fields mean "across the whole organization" for that dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KpiScope {
    pub product_id: Option<Uuid>,
    pub territory_id: Option<Uuid>,
    pub rep_id: Option<Uuid>,
}

/// Where a KPI figure was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KpiBasis {
    /// Served from the in-process cache.
    Cache,
    /// Served from a persisted snapshot row.
    Snapshot,
    /// Computed live from the fact tables.
    Computed,
}

impl KpiBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            KpiBasis::Cache => "cache",
            KpiBasis::Snapshot => "snapshot",
            KpiBasis::Computed => "computed",
        }
    }
}

/// One resolved KPI figure.
///
/// `numerator` and `denominator` expose the inputs behind ratio kinds so
/// clients can render "X of Y" breakdowns; for plain volume kinds the
/// numerator repeats the value and the denominator is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiValue {
    pub kind: KpiKind,
    pub org_id: Uuid,
    #[serde(flatten)]
    pub scope: KpiScope,
    #[serde(flatten)]
    pub period: Period,
    pub value: f64,
    pub numerator: f64,
    pub denominator: Option<f64>,
    pub computed_at: DateTime<Utc>,
    pub basis: KpiBasis,
}

impl KpiValue {
    pub fn from_snapshot(kind: KpiKind, row: &KpiSnapshotRow) -> Self {
        Self {
            kind,
            org_id: row.org_id,
            scope: KpiScope {
                product_id: row.product_id,
                territory_id: row.territory_id,
                rep_id: row.rep_id,
            },
            period: Period {
                from: row.period_start,
                to: row.period_end,
            },
            value: row.value,
            numerator: row.numerator,
            denominator: row.denominator,
            computed_at: row.computed_at,
            basis: KpiBasis::Snapshot,
        }
    }
}

/// Cache key for one (organization, kind, scope, period) combination.
pub fn cache_key(org_id: Uuid, kind: KpiKind, scope: &KpiScope, period: &Period) -> String {
    fn part(id: Option<Uuid>) -> String {
        id.map(|u| u.to_string()).unwrap_or_else(|| "-".to_string())
    }
    format!(
        "kpi:{}:{}:{}:{}:{}:{}:{}",
        org_id,
        kind.as_str(),
        part(scope.product_id),
        part(scope.territory_id),
        part(scope.rep_id),
        period.from,
        period.to
    )
}

pub fn sum_trx(rows: &[PrescriptionFact]) -> i64 {
    rows.iter().map(|r| r.trx).sum()
}

pub fn sum_nrx(rows: &[PrescriptionFact]) -> i64 {
    rows.iter().map(|r| r.nrx).sum()
}

pub fn sum_market_trx(rows: &[PrescriptionFact]) -> i64 {
    rows.iter().map(|r| r.market_trx).sum()
}

/// Total quota target across the matched quota rows, as a float.
pub fn quota_target_total(rows: &[QuotaRow]) -> f64 {
    use bigdecimal::ToPrimitive;
    rows.iter()
        .map(|r| r.target_trx.to_f64().unwrap_or(0.0))
        .sum()
}

/// Safe division: returns 0.0 for an empty or non-positive denominator
/// instead of propagating infinities or NaN.
pub fn ratio(numerator: f64, denominator: f64) -> f64 {
    if !denominator.is_finite() || denominator <= 0.0 {
        return 0.0;
    }
    let value = numerator / denominator;
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Relative TRx change versus the previous period.
///
/// A zero-volume previous period yields 0.0 rather than an infinite growth
/// figure; shrinking volume yields a negative value.
pub fn growth(current: i64, previous: i64) -> f64 {
    if previous <= 0 {
        return 0.0;
    }
    (current - previous) as f64 / previous as f64
}
