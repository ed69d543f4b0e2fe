//! Generic webhook delivery: one JSON POST per new message.

use serde_json::{json, Value};
use tracing::debug;

use crate::adapters::sqlite::messages::EmailRecord;
use crate::error::Result;
use crate::services::delivery::post_json_with_retry;
use crate::services::settings::Settings;

pub fn build_payload(record: &EmailRecord, account_email: &str) -> Value {
    let received_at = chrono::DateTime::from_timestamp(record.received_at, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();
    json!({
        "account_email": account_email,
        "subject": record.subject,
        "sender": record.sender,
        "received_at": received_at,
        "summary": record.content_summary,
        "labels": record.labels,
        "message_id": record.message_id,
    })
}

/// POST the payload to the configured webhook URL. No-op when unset.
pub async fn send_webhook(
    client: &reqwest::Client,
    settings: &Settings,
    account_email: &str,
    record: &EmailRecord,
) -> Result<()> {
    let Some(url) = settings.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) else {
        debug!("Webhook not configured; skipping");
        return Ok(());
    };

    let payload = build_payload(record, account_email);
    post_json_with_retry(client, url, &payload, "webhook").await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_shape() {
        let record = EmailRecord {
            id: 9,
            account_id: 3,
            message_id: "<m@x>".to_string(),
            subject: "Alert".to_string(),
            sender: "ops@example.com".to_string(),
            content_summary: "summary".to_string(),
            body_text: "body".to_string(),
            body_html: None,
            received_at: 1_700_000_000,
            is_read: false,
            labels: vec!["P1".to_string()],
        };

        let payload = build_payload(&record, "me@example.com");
        assert_eq!(payload["account_email"], "me@example.com");
        assert_eq!(payload["subject"], "Alert");
        assert_eq!(payload["sender"], "ops@example.com");
        assert_eq!(payload["summary"], "summary");
        assert_eq!(payload["message_id"], "<m@x>");
        assert_eq!(payload["labels"][0], "P1");
        assert!(payload["received_at"]
            .as_str()
            .unwrap()
            .starts_with("2023-11-14T"));
        // The body itself is never shipped.
        assert!(payload.get("body_text").is_none());
    }
}
