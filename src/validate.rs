use chrono::NaiveDate;
use regex::Regex;
use uuid::Uuid;

use crate::errors::{AppError, ValidationIssue};
use crate::kpi::{KpiKind, Period};
use crate::models::{KpiBatchRequest, KpiQuery, PillarPatch, TransitionRequest};
use crate::peak::PeakStage;
use crate::scoring::Pillar;

/// Upper bound on a single pillar evidence text.
pub const MAX_PILLAR_CHARS: usize = 4000;

/// Upper bound on the number of kinds in one batch KPI request.
pub const MAX_BATCH_KINDS: usize = 12;

/// Upper bound on a reporting period, in days.
pub const MAX_PERIOD_DAYS: i64 = 1830;

/// Checks an NDC (National Drug Code) in its common hyphenated form.
pub fn is_valid_ndc(code: &str) -> bool {
    // Labeler-product-package segments: 4-5, 3-4 and 1-2 digits
    let ndc_regex = Regex::new(r"^\d{4,5}-\d{3,4}-\d{1,2}$").unwrap();
    ndc_regex.is_match(code.trim())
}

/// A KPI request that passed validation.
#[derive(Debug, Clone)]
pub struct ValidKpiRequest {
    pub kinds: Vec<KpiKind>,
    pub product_id: Option<Uuid>,
    pub product_ndc: Option<String>,
    pub territory_id: Option<Uuid>,
    pub rep_id: Option<Uuid>,
    pub period: Period,
    pub force: bool,
}

fn parse_kind(raw: &str, field: &str, issues: &mut Vec<ValidationIssue>) -> Option<KpiKind> {
    match KpiKind::parse(raw) {
        Some(kind) => Some(kind),
        None => {
            let known = KpiKind::ALL
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            issues.push(ValidationIssue::new(
                field,
                "unknown",
                format!("Unknown KPI kind '{}'; expected one of: {}", raw, known),
            ));
            None
        }
    }
}

fn parse_period(
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    issues: &mut Vec<ValidationIssue>,
) -> Option<Period> {
    let (from, to) = match (from, to) {
        (Some(from), Some(to)) => (from, to),
        (from, to) => {
            if from.is_none() {
                issues.push(ValidationIssue::new(
                    "from",
                    "missing",
                    "The reporting period start date is required",
                ));
            }
            if to.is_none() {
                issues.push(ValidationIssue::new(
                    "to",
                    "missing",
                    "The reporting period end date is required",
                ));
            }
            return None;
        }
    };
    if from > to {
        issues.push(ValidationIssue::new(
            "from",
            "out_of_order",
            format!("Period start {} is after period end {}", from, to),
        ));
        return None;
    }
    let period = Period { from, to };
    if period.days() > MAX_PERIOD_DAYS {
        issues.push(ValidationIssue::new(
            "to",
            "too_long",
            format!(
                "Reporting period covers {} days; the maximum is {}",
                period.days(),
                MAX_PERIOD_DAYS
            ),
        ));
        return None;
    }
    Some(period)
}

fn check_product_selector(
    product_id: Option<&Uuid>,
    product_ndc: Option<&str>,
    issues: &mut Vec<ValidationIssue>,
) {
    if product_id.is_some() && product_ndc.is_some() {
        issues.push(ValidationIssue::new(
            "product_id",
            "conflict",
            "Provide either product_id or product_ndc, not both",
        ));
    }
    if let Some(ndc) = product_ndc {
        if !is_valid_ndc(ndc) {
            issues.push(ValidationIssue::new(
                "product_ndc",
                "format",
                format!("'{}' is not a valid hyphenated NDC code", ndc),
            ));
        }
    }
}

/// Validates the single-KPI query parameters.
pub fn kpi_query(q: &KpiQuery) -> Result<ValidKpiRequest, AppError> {
    let mut issues = Vec::new();
    let mut kinds = Vec::new();
    if let Some(kind) = parse_kind(&q.kind, "kind", &mut issues) {
        kinds.push(kind);
    }
    let period = parse_period(q.from, q.to, &mut issues);
    check_product_selector(q.product_id.as_ref(), q.product_ndc.as_deref(), &mut issues);

    match (kinds.is_empty(), period) {
        (false, Some(period)) if issues.is_empty() => Ok(ValidKpiRequest {
            kinds,
            product_id: q.product_id,
            product_ndc: q.product_ndc.clone(),
            territory_id: q.territory_id,
            rep_id: q.rep_id,
            period,
            force: q.force,
        }),
        _ => Err(AppError::Validation(issues)),
    }
}

/// Validates the batch KPI request body.
pub fn kpi_batch(req: &KpiBatchRequest) -> Result<ValidKpiRequest, AppError> {
    let mut issues = Vec::new();
    if req.kinds.is_empty() {
        issues.push(ValidationIssue::new(
            "kinds",
            "missing",
            "At least one KPI kind is required",
        ));
    } else if req.kinds.len() > MAX_BATCH_KINDS {
        issues.push(ValidationIssue::new(
            "kinds",
            "too_many",
            format!(
                "A batch request may list at most {} kinds (got {})",
                MAX_BATCH_KINDS,
                req.kinds.len()
            ),
        ));
    }
    let mut kinds = Vec::new();
    if req.kinds.len() <= MAX_BATCH_KINDS {
        for (i, raw) in req.kinds.iter().enumerate() {
            if let Some(kind) = parse_kind(raw, &format!("kinds[{}]", i), &mut issues) {
                kinds.push(kind);
            }
        }
    }
    let period = parse_period(req.from, req.to, &mut issues);
    check_product_selector(req.product_id.as_ref(), req.product_ndc.as_deref(), &mut issues);

    match (kinds.is_empty(), period) {
        (false, Some(period)) if issues.is_empty() => Ok(ValidKpiRequest {
            kinds,
            product_id: req.product_id,
            product_ndc: req.product_ndc.clone(),
            territory_id: req.territory_id,
            rep_id: req.rep_id,
            period,
            force: req.force,
        }),
        _ => Err(AppError::Validation(issues)),
    }
}

/// A stage transition request that passed validation.
#[derive(Debug, Clone, Copy)]
pub struct ValidTransition {
    pub opportunity_id: Uuid,
    pub to_stage: PeakStage,
}

/// Validates the stage transition request body.
pub fn transition_request(req: &TransitionRequest) -> Result<ValidTransition, AppError> {
    let mut issues = Vec::new();
    if req.opportunity_id.is_nil() {
        issues.push(ValidationIssue::new(
            "opportunity_id",
            "missing",
            "A non-nil opportunity id is required",
        ));
    }
    let to_stage = match PeakStage::parse(&req.to_stage) {
        Some(stage) => Some(stage),
        None => {
            let known = PeakStage::ALL
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            issues.push(ValidationIssue::new(
                "to_stage",
                "unknown",
                format!("Unknown stage '{}'; expected one of: {}", req.to_stage, known),
            ));
            None
        }
    };
    match to_stage {
        Some(to_stage) if issues.is_empty() => Ok(ValidTransition {
            opportunity_id: req.opportunity_id,
            to_stage,
        }),
        _ => Err(AppError::Validation(issues)),
    }
}

/// Validates a pillar evidence patch.
///
/// The patch must touch at least one pillar, and no text may exceed
/// `MAX_PILLAR_CHARS` characters.
pub fn pillar_patch(patch: &PillarPatch) -> Result<(), AppError> {
    let mut issues = Vec::new();
    if patch.is_empty() {
        issues.push(ValidationIssue::new(
            "body",
            "empty",
            "The update must set at least one pillar field",
        ));
    }
    for pillar in Pillar::ALL {
        if let Some(text) = patch.get(pillar) {
            let chars = text.chars().count();
            if chars > MAX_PILLAR_CHARS {
                issues.push(ValidationIssue::new(
                    pillar.as_str(),
                    "too_long",
                    format!(
                        "Pillar text is {} characters; the maximum is {}",
                        chars, MAX_PILLAR_CHARS
                    ),
                ));
            }
        }
    }
    if issues.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(issues))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::from_str(s).unwrap()
    }

    fn base_query() -> KpiQuery {
        KpiQuery {
            kind: "trx".to_string(),
            product_id: None,
            product_ndc: None,
            territory_id: None,
            rep_id: None,
            from: Some(date("2026-01-01")),
            to: Some(date("2026-03-31")),
            force: false,
        }
    }

    fn issues_of(err: AppError) -> Vec<ValidationIssue> {
        match err {
            AppError::Validation(issues) => issues,
            other => panic!("expected validation error, got {}", other),
        }
    }

    #[test]
    fn test_valid_ndc_formats() {
        assert!(is_valid_ndc("0002-3227-30"));
        assert!(is_valid_ndc("50090-1234-1"));
        assert!(is_valid_ndc("12345-678-90"));
        assert!(is_valid_ndc(" 0002-3227-30 "));
    }

    #[test]
    fn test_invalid_ndc_formats() {
        assert!(!is_valid_ndc(""));
        assert!(!is_valid_ndc("0002322730"));
        assert!(!is_valid_ndc("002-3227-30"));
        assert!(!is_valid_ndc("0002-3227-301"));
        assert!(!is_valid_ndc("abcd-efg-hi"));
        assert!(!is_valid_ndc("0002-3227"));
    }

    #[test]
    fn test_kpi_query_happy_path() {
        let valid = kpi_query(&base_query()).unwrap();
        assert_eq!(valid.kinds, vec![KpiKind::Trx]);
        assert_eq!(valid.period.days(), 90);
        assert!(!valid.force);
    }

    #[test]
    fn test_kpi_query_unknown_kind() {
        let q = KpiQuery {
            kind: "revenue".to_string(),
            ..base_query()
        };
        let issues = issues_of(kpi_query(&q).unwrap_err());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "kind");
        assert_eq!(issues[0].code, "unknown");
    }

    #[test]
    fn test_kpi_query_missing_period_reports_both_fields() {
        let q = KpiQuery {
            from: None,
            to: None,
            ..base_query()
        };
        let issues = issues_of(kpi_query(&q).unwrap_err());
        let fields: Vec<&str> = issues.iter().map(|i| i.field.as_str()).collect();
        assert!(fields.contains(&"from"));
        assert!(fields.contains(&"to"));
    }

    #[test]
    fn test_kpi_query_inverted_period() {
        let q = KpiQuery {
            from: Some(date("2026-03-31")),
            to: Some(date("2026-01-01")),
            ..base_query()
        };
        let issues = issues_of(kpi_query(&q).unwrap_err());
        assert_eq!(issues[0].code, "out_of_order");
    }

    #[test]
    fn test_kpi_query_period_too_long() {
        let q = KpiQuery {
            from: Some(date("2020-01-01")),
            to: Some(date("2026-01-01")),
            ..base_query()
        };
        let issues = issues_of(kpi_query(&q).unwrap_err());
        assert_eq!(issues[0].code, "too_long");
    }

    #[test]
    fn test_kpi_query_rejects_both_product_selectors() {
        let q = KpiQuery {
            product_id: Some(Uuid::new_v4()),
            product_ndc: Some("0002-3227-30".to_string()),
            ..base_query()
        };
        let issues = issues_of(kpi_query(&q).unwrap_err());
        assert_eq!(issues[0].code, "conflict");
    }

    #[test]
    fn test_kpi_batch_collects_issues_per_kind() {
        let req = KpiBatchRequest {
            kinds: vec!["trx".to_string(), "bogus".to_string(), "nrx".to_string()],
            product_id: None,
            product_ndc: None,
            territory_id: None,
            rep_id: None,
            from: Some(date("2026-01-01")),
            to: Some(date("2026-01-31")),
            force: false,
        };
        let issues = issues_of(kpi_batch(&req).unwrap_err());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "kinds[1]");
    }

    #[test]
    fn test_kpi_batch_rejects_empty_kinds() {
        let req = KpiBatchRequest {
            kinds: vec![],
            product_id: None,
            product_ndc: None,
            territory_id: None,
            rep_id: None,
            from: Some(date("2026-01-01")),
            to: Some(date("2026-01-31")),
            force: false,
        };
        let issues = issues_of(kpi_batch(&req).unwrap_err());
        assert_eq!(issues[0].field, "kinds");
        assert_eq!(issues[0].code, "missing");
    }

    #[test]
    fn test_transition_request_unknown_stage() {
        let req = TransitionRequest {
            opportunity_id: Uuid::new_v4(),
            to_stage: "closed_won".to_string(),
        };
        let issues = issues_of(transition_request(&req).unwrap_err());
        assert_eq!(issues[0].field, "to_stage");
        assert_eq!(issues[0].code, "unknown");
    }

    #[test]
    fn test_transition_request_happy_path() {
        let req = TransitionRequest {
            opportunity_id: Uuid::new_v4(),
            to_stage: "key_decision".to_string(),
        };
        let valid = transition_request(&req).unwrap();
        assert_eq!(valid.to_stage, PeakStage::KeyDecision);
    }

    #[test]
    fn test_pillar_patch_must_touch_a_field() {
        let err = pillar_patch(&PillarPatch::default()).unwrap_err();
        assert_eq!(issues_of(err)[0].code, "empty");
    }

    #[test]
    fn test_pillar_patch_rejects_oversized_text() {
        let patch = PillarPatch {
            champion: Some("x".repeat(MAX_PILLAR_CHARS + 1)),
            ..Default::default()
        };
        let issues = issues_of(pillar_patch(&patch).unwrap_err());
        assert_eq!(issues[0].field, "champion");
        assert_eq!(issues[0].code, "too_long");
    }
}
