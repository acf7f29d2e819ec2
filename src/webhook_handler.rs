use crate::errors::AppError;
use crate::handlers::AppState;
use crate::webhook_models::{CrmEvent, WebhookAck, WebhookPayload};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// CRM Webhook Handler
///
/// Receives change events from the upstream CRM when opportunities are
/// created or edited. Validates the shared secret, deduplicates deliveries
/// by event id, records each event and drops any cached assessment for the
/// touched opportunity so the next read rescores fresh texts.
///
/// Expected payload: single event object OR array of events
/// Authentication: X-Webhook-Token header must match CRM_WEBHOOK_SECRET
pub async fn crm_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<WebhookPayload>,
) -> Result<(StatusCode, Json<WebhookAck>), AppError> {
    tracing::info!("Received CRM webhook");

    validate_webhook_secret(&state, &headers)?;

    let events = payload.into_events();
    let total_received = events.len();
    tracing::info!("Processing {} webhook event(s)", total_received);

    let mut processed = 0;
    let mut duplicates = 0;

    for event in events {
        match process_event(&state, event).await {
            Ok(ProcessResult::Processed) => {
                processed += 1;
            }
            Ok(ProcessResult::Duplicate) => {
                duplicates += 1;
                tracing::debug!("Skipped duplicate webhook event");
            }
            Err(e) => {
                tracing::error!("Failed to process webhook event: {}", e);
                // Continue processing other events even if one fails
            }
        }
    }

    tracing::info!(
        "Webhook processing complete: {} received, {} processed, {} duplicates",
        total_received,
        processed,
        duplicates
    );

    Ok((
        StatusCode::OK,
        Json(WebhookAck {
            status: "received".to_string(),
            received: total_received,
            processed,
            duplicates,
        }),
    ))
}

/// Validate webhook secret from X-Webhook-Token header
fn validate_webhook_secret(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    // With no secret configured every delivery is refused; Config warns
    // about this at startup
    let Some(ref expected_secret) = state.config.webhook_secret else {
        return Err(AppError::Unauthorized(
            "CRM webhook ingestion is not configured".to_string(),
        ));
    };

    let token = headers
        .get("x-webhook-token")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing X-Webhook-Token header".to_string()))?;

    if !constant_time_compare(token, expected_secret) {
        tracing::warn!("Invalid webhook token received");
        return Err(AppError::Unauthorized("Invalid webhook token".to_string()));
    }

    Ok(())
}

/// Constant-time string comparison
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[derive(Debug)]
enum ProcessResult {
    Processed,
    Duplicate,
}

/// Parse timestamp string to DateTime<Utc>
fn parse_timestamp(timestamp_str: &str) -> Result<DateTime<Utc>, AppError> {
    chrono::DateTime::parse_from_rfc3339(timestamp_str)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Fallback: try naive datetime and assume UTC
            chrono::NaiveDateTime::parse_from_str(timestamp_str, "%Y-%m-%d %H:%M:%S%.f")
                .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
        })
        .map_err(|e| {
            AppError::BadRequest(format!(
                "Invalid timestamp format '{}': {}. Expected ISO 8601 (RFC3339)",
                timestamp_str, e
            ))
        })
}

/// Record one event and invalidate the derived data it touches.
async fn process_event(state: &AppState, event: CrmEvent) -> Result<ProcessResult, AppError> {
    if event.event_id.trim().is_empty() {
        return Err(AppError::BadRequest(
            "Missing event_id in webhook event".to_string(),
        ));
    }
    let org_id = event.org_id.ok_or_else(|| {
        AppError::BadRequest(format!("Missing org_id in webhook event {}", event.event_id))
    })?;

    let occurred_at = match event.occurred_at.as_deref() {
        Some(raw) => parse_timestamp(raw)?,
        None => Utc::now(),
    };

    tracing::debug!(
        "Processing webhook event {} ({})",
        event.event_id,
        event.event_type.as_deref().unwrap_or("unknown")
    );

    let payload_raw = serde_json::to_value(&event)
        .map_err(|e| AppError::InternalError(format!("Failed to serialize event: {}", e)))?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO crm_events (
            event_id, org_id, opportunity_id, event_type, occurred_at, payload_raw, received_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, now())
        ON CONFLICT (event_id) DO NOTHING
        "#,
    )
    .bind(&event.event_id)
    .bind(org_id)
    .bind(event.opportunity_id)
    .bind(event.event_type.as_deref())
    .bind(occurred_at)
    .bind(payload_raw)
    .execute(&state.db)
    .await
    .map_err(AppError::DatabaseError)?;

    // A retried delivery conflicts on event_id and must not repeat side effects
    if inserted.rows_affected() == 0 {
        return Ok(ProcessResult::Duplicate);
    }

    if let Some(opportunity_id) = event.opportunity_id {
        state.assessment_cache.invalidate(&opportunity_id).await;
        tracing::debug!(
            "Dropped cached assessment for opportunity {}",
            opportunity_id
        );
    }

    Ok(ProcessResult::Processed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("secret", "secret"));
        assert!(!constant_time_compare("secret", "Secret"));
        assert!(!constant_time_compare("secret", "secret2"));
        assert!(!constant_time_compare("", "secret"));
    }

    #[test]
    fn test_parse_timestamp_accepts_common_formats() {
        assert!(parse_timestamp("2026-03-01T12:30:00Z").is_ok());
        assert!(parse_timestamp("2026-03-01T12:30:00+02:00").is_ok());
        assert!(parse_timestamp("2026-03-01 12:30:00").is_ok());
        assert!(parse_timestamp("2026-03-01 12:30:00.250").is_ok());
        assert!(parse_timestamp("yesterday").is_err());
    }
}
