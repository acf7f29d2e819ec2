use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// CRM webhook delivery - can be a single event object or an array
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum WebhookPayload {
    Single(CrmEvent),
    Batch(Vec<CrmEvent>),
}

impl WebhookPayload {
    /// Convert to a vec of events for uniform processing
    pub fn into_events(self) -> Vec<CrmEvent> {
        match self {
            WebhookPayload::Single(event) => vec![event],
            WebhookPayload::Batch(events) => events,
        }
    }
}

/// Individual change event pushed by the upstream CRM
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CrmEvent {
    /// Delivery id; the CRM retries failed deliveries under the same id
    pub event_id: String,

    /// Event name (e.g., "opportunity.created", "opportunity.updated")
    #[serde(default)]
    pub event_type: Option<String>,

    /// Organization the event belongs to
    #[serde(default)]
    pub org_id: Option<Uuid>,

    /// Opportunity the event is about, when applicable
    #[serde(default)]
    pub opportunity_id: Option<Uuid>,

    /// When the change happened on the CRM side
    #[serde(default)]
    pub occurred_at: Option<String>,

    /// Raw data for any additional fields
    #[serde(flatten)]
    pub raw: Value,
}

/// Response sent back to the CRM
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub status: String,
    pub received: usize,
    pub processed: usize,
    pub duplicates: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_event() {
        let json = r#"
        {
            "event_id": "evt_8821",
            "event_type": "opportunity.updated",
            "org_id": "6a1f6f0e-8f8f-4d0a-9c4e-1f2f3a4b5c6d",
            "opportunity_id": "0e2b8a64-5f13-4c2f-9a77-df8f1f8a2b3c",
            "occurred_at": "2026-03-01T12:30:00Z"
        }
        "#;

        let payload: WebhookPayload = serde_json::from_str(json).unwrap();
        match payload {
            WebhookPayload::Single(event) => {
                assert_eq!(event.event_id, "evt_8821");
                assert_eq!(event.event_type, Some("opportunity.updated".to_string()));
                assert!(event.opportunity_id.is_some());
            }
            _ => panic!("Expected single event"),
        }
    }

    #[test]
    fn test_parse_batch_events() {
        let json = r#"
        [
            {"event_id": "evt_1", "org_id": "6a1f6f0e-8f8f-4d0a-9c4e-1f2f3a4b5c6d"},
            {"event_id": "evt_2", "org_id": "6a1f6f0e-8f8f-4d0a-9c4e-1f2f3a4b5c6d"}
        ]
        "#;

        let payload: WebhookPayload = serde_json::from_str(json).unwrap();
        match payload {
            WebhookPayload::Batch(events) => {
                assert_eq!(events.len(), 2);
            }
            _ => panic!("Expected batch events"),
        }
    }

    #[test]
    fn test_unknown_fields_land_in_raw() {
        let json = r#"
        {
            "event_id": "evt_3",
            "org_id": "6a1f6f0e-8f8f-4d0a-9c4e-1f2f3a4b5c6d",
            "actor": "integration-user",
            "changes": {"stage": "engaging"}
        }
        "#;

        let event: CrmEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.raw["actor"], "integration-user");
        assert_eq!(event.raw["changes"]["stage"], "engaging");
    }
}
