//! Telegram delivery: per-account push filters, template rendering, and
//! the Bot API call.

use serde_json::json;
use tracing::debug;

use crate::adapters::sqlite::accounts::{Account, PushTemplate};
use crate::adapters::sqlite::messages::EmailRecord;
use crate::adapters::sqlite::push_filters::{FilterField, FilterMode, PushFilter};
use crate::error::Result;
use crate::services::delivery::post_json_with_retry;
use crate::services::helpers::truncate_chars;
use crate::services::settings::Settings;

/// Telegram caps sendMessage text at 4096 chars.
const TELEGRAM_TEXT_LIMIT: usize = 4096;
/// Bound for the `full_email` body excerpt, leaving headroom for the
/// header lines.
const FULL_EMAIL_BODY_LIMIT: usize = 3500;
const SHORT_SUMMARY_LIMIT: usize = 120;

/// The field value a filter inspects, lowercased for matching.
fn filter_field_value(record: &EmailRecord, field: FilterField) -> String {
    let raw = match field {
        FilterField::Sender => record.sender.clone(),
        FilterField::Domain => match record.sender.rsplit_once('@') {
            Some((_, domain)) => domain.trim().to_string(),
            None => record.sender.clone(),
        },
        FilterField::Subject => record.subject.clone(),
        FilterField::Body => {
            let body = if record.body_text.is_empty() {
                record.content_summary.as_str()
            } else {
                record.body_text.as_str()
            };
            body.chars().take(2000).collect()
        }
    };
    raw.to_lowercase()
}

/// Apply the account's allow/deny filter list.
///
/// Deny rules drop on first match. If any allow rule exists, at least
/// one must match; with no allow rules the message passes by default.
/// Empty filter values never constrain.
pub fn filters_admit(record: &EmailRecord, filters: &[PushFilter]) -> bool {
    for filter in filters.iter().filter(|f| f.mode == FilterMode::Deny) {
        let value = filter.value.trim().to_lowercase();
        if value.is_empty() {
            continue;
        }
        if filter_field_value(record, filter.field).contains(&value) {
            return false;
        }
    }

    let mut saw_allow = false;
    for filter in filters.iter().filter(|f| f.mode == FilterMode::Allow) {
        let value = filter.value.trim().to_lowercase();
        if value.is_empty() {
            continue;
        }
        saw_allow = true;
        if filter_field_value(record, filter.field).contains(&value) {
            return true;
        }
    }

    !saw_allow
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn preview_source(record: &EmailRecord) -> &str {
    if record.body_text.trim().is_empty() {
        &record.content_summary
    } else {
        &record.body_text
    }
}

/// Render the notification body for one message. Output is Telegram
/// HTML, bounded to a single sendMessage.
pub fn render_message(record: &EmailRecord, account_email: &str, template: PushTemplate) -> String {
    let subject = if record.subject.trim().is_empty() {
        "(no subject)".to_string()
    } else {
        record.subject.clone()
    };

    let mut lines: Vec<String> = vec![format!("📬 <b>{}</b>", escape_html(&subject))];

    if template != PushTemplate::TitleOnly {
        lines.push(format!("From: <code>{}</code>", escape_html(&record.sender)));
    }

    match template {
        PushTemplate::TitleOnly => {}
        PushTemplate::Short => {
            let summary = truncate_chars(record.content_summary.trim(), SHORT_SUMMARY_LIMIT);
            if !summary.is_empty() {
                lines.push(String::new());
                lines.push(escape_html(&summary));
            }
        }
        PushTemplate::Full | PushTemplate::FullEmail => {
            lines.push(format!("Account: <code>{}</code>", escape_html(account_email)));
            if let Some(time) = chrono::DateTime::from_timestamp(record.received_at, 0) {
                lines.push(format!("Time: {}", time.format("%Y-%m-%d %H:%M")));
            }

            let excerpt = if template == PushTemplate::FullEmail {
                truncate_chars(preview_source(record).trim(), FULL_EMAIL_BODY_LIMIT)
            } else {
                record.content_summary.trim().to_string()
            };
            if !excerpt.is_empty() {
                lines.push(String::new());
                lines.push(escape_html(&excerpt));
            }
        }
    }

    let text = lines.join("\n");
    truncate_chars(&text, TELEGRAM_TEXT_LIMIT)
}

/// Send one notification through the Bot API. A missing token/chat_id
/// makes this a no-op; HTTP failures follow the shared retry policy.
pub async fn send_notification(
    client: &reqwest::Client,
    settings: &Settings,
    account: &Account,
    record: &EmailRecord,
) -> Result<()> {
    let (Some(token), Some(chat_id)) = (
        settings.telegram_bot_token.as_deref(),
        settings.telegram_chat_id.as_deref(),
    ) else {
        debug!("Telegram not configured; skipping notification");
        return Ok(());
    };

    let text = render_message(record, &account.email, account.push_template);
    let url = format!("https://api.telegram.org/bot{}/sendMessage", token);
    let payload = json!({
        "chat_id": chat_id,
        "text": text,
        "parse_mode": "HTML",
        "disable_web_page_preview": true,
    });

    post_json_with_retry(client, &url, &payload, "telegram sendMessage").await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(sender: &str, subject: &str, body: &str) -> EmailRecord {
        EmailRecord {
            id: 1,
            account_id: 1,
            message_id: "<m@x>".to_string(),
            subject: subject.to_string(),
            sender: sender.to_string(),
            content_summary: body.chars().take(200).collect(),
            body_text: body.to_string(),
            body_html: None,
            received_at: 1_700_000_000,
            is_read: false,
            labels: vec![],
        }
    }

    fn filter(field: FilterField, mode: FilterMode, value: &str) -> PushFilter {
        PushFilter {
            id: 0,
            account_id: 1,
            field,
            mode,
            value: value.to_string(),
            rule_order: 0,
        }
    }

    #[test]
    fn no_filters_admit_everything() {
        let r = record("a@example.com", "hello", "body");
        assert!(filters_admit(&r, &[]));
    }

    #[test]
    fn allow_list_requires_a_match() {
        let allow = filter(FilterField::Domain, FilterMode::Allow, "example.com");
        assert!(!filters_admit(
            &record("a@other.com", "s", "b"),
            std::slice::from_ref(&allow)
        ));
        assert!(filters_admit(
            &record("b@example.com", "s", "b"),
            &[allow]
        ));
    }

    #[test]
    fn deny_wins_over_allow() {
        let filters = vec![
            filter(FilterField::Domain, FilterMode::Allow, "example.com"),
            filter(FilterField::Subject, FilterMode::Deny, "spam"),
        ];
        assert!(!filters_admit(
            &record("a@example.com", "SPAM offer", "b"),
            &filters
        ));
        assert!(filters_admit(
            &record("a@example.com", "report", "b"),
            &filters
        ));
    }

    #[test]
    fn domain_matches_sender_domain_only() {
        let allow = filter(FilterField::Domain, FilterMode::Allow, "example.com");
        // The domain appears in the local part but not the domain part.
        assert!(!filters_admit(
            &record("example.com@other.org", "s", "b"),
            &[allow]
        ));
    }

    #[test]
    fn empty_filter_values_are_ignored() {
        let filters = vec![
            filter(FilterField::Subject, FilterMode::Deny, "  "),
            filter(FilterField::Sender, FilterMode::Allow, ""),
        ];
        assert!(filters_admit(&record("a@x.com", "s", "b"), &filters));
    }

    #[test]
    fn title_only_renders_subject_line() {
        let text = render_message(
            &record("a@x.com", "Alert: disk", "body"),
            "me@example.com",
            PushTemplate::TitleOnly,
        );
        assert!(text.contains("Alert: disk"));
        assert!(!text.contains("a@x.com"));
    }

    #[test]
    fn missing_subject_gets_placeholder() {
        let text = render_message(
            &record("a@x.com", "  ", "body"),
            "me@example.com",
            PushTemplate::TitleOnly,
        );
        assert!(text.contains("(no subject)"));
    }

    #[test]
    fn short_template_bounds_summary() {
        let long_body = "y".repeat(500);
        let text = render_message(
            &record("a@x.com", "s", &long_body),
            "me@example.com",
            PushTemplate::Short,
        );
        // 120-char summary cap, not the whole body.
        assert!(text.len() < 400);
        assert!(text.contains("a@x.com"));
    }

    #[test]
    fn full_email_is_bounded_for_one_message() {
        let huge = "z".repeat(10_000);
        let text = render_message(
            &record("a@x.com", "s", &huge),
            "me@example.com",
            PushTemplate::FullEmail,
        );
        assert!(text.chars().count() <= TELEGRAM_TEXT_LIMIT);
        assert!(text.contains("me@example.com"));
    }

    #[test]
    fn html_is_escaped() {
        let text = render_message(
            &record("a@x.com", "<script>alert(1)</script>", "b"),
            "me@example.com",
            PushTemplate::TitleOnly,
        );
        assert!(text.contains("&lt;script&gt;"));
        assert!(!text.contains("<script>"));
    }
}
